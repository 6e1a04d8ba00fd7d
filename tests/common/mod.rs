//! Common test utilities and fixtures.
//!
//! Note: items are `#[allow(dead_code)]` because each test file compiles
//! `common/` separately.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tower::ServiceExt;

use sharebox::client::{ClientError, UploadTransport, UploaderConfig};
use sharebox::config::{Config, DatabaseConfig, ServerConfig, StorageConfig, UploadConfig};
use sharebox::db::{self, ArtifactRepository};
use sharebox::state::AppState;
use sharebox::upload::{
    ChunkUploadResponse, CompleteRequest, CompleteResponse, InitRequest, InitResponse,
    StatusResponse, TransferCoordinator, UploadError,
};

// ============================================================================
// Test Server
// ============================================================================

/// A server instance over a temporary directory.
///
/// `restart` builds a fresh instance over the same database and storage,
/// which is how tests simulate a process restart.
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub storage_path: PathBuf,
    db_url: String,
    upload: UploadConfig,
    _temp_dir: Arc<TempDir>,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::with_upload_config(test_upload_config()).await
    }

    pub async fn with_upload_config(upload: UploadConfig) -> Self {
        let temp_dir = Arc::new(tempfile::tempdir().expect("Failed to create temp directory"));
        let storage_path = temp_dir.path().join("storage");
        std::fs::create_dir_all(&storage_path).expect("Failed to create storage directory");
        let db_url = format!("sqlite:{}", temp_dir.path().join("sharebox.db").display());

        Self::boot(temp_dir, storage_path, db_url, upload).await
    }

    async fn boot(temp_dir: Arc<TempDir>, storage_path: PathBuf, db_url: String, upload: UploadConfig) -> Self {
        let pool = db::create_pool(&db_url)
            .await
            .expect("Failed to create database");

        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            storage: StorageConfig {
                base_path: storage_path.clone(),
            },
            database: DatabaseConfig { url: db_url.clone() },
            upload: upload.clone(),
        };

        let state = AppState::new(config, pool);
        state
            .coordinator()
            .sessions()
            .load()
            .await
            .expect("Failed to restore sessions");
        let router = sharebox::routes::app(state.clone());

        Self {
            router,
            state,
            storage_path,
            db_url,
            upload,
            _temp_dir: temp_dir,
        }
    }

    /// A new server over the same database and storage directory
    pub async fn restart(&self) -> Self {
        Self::boot(
            self._temp_dir.clone(),
            self.storage_path.clone(),
            self.db_url.clone(),
            self.upload.clone(),
        )
        .await
    }

    pub fn coordinator(&self) -> TransferCoordinator {
        self.state.coordinator().clone()
    }

    pub fn db(&self) -> &SqlitePool {
        self.state.db()
    }

    /// Bytes of the artifact published under `code`
    pub async fn artifact_bytes(&self, code: &str) -> Vec<u8> {
        let record = ArtifactRepository::new(self.db())
            .get(code)
            .await
            .unwrap()
            .expect("artifact not found");
        tokio::fs::read(self.storage_path.join(&record.storage_path))
            .await
            .unwrap()
    }
}

pub fn test_upload_config() -> UploadConfig {
    UploadConfig {
        min_chunk_size: 16,
        ..UploadConfig::default()
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Deterministic, non-repeating-per-chunk content
pub fn test_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 1024) % 251) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    sharebox::upload::compute_hash(data)
}

/// Write `data` to `<dir>/<name>` and return the path
pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).expect("Failed to write test file");
    path
}

pub fn fast_uploader_config(chunk_size: u64) -> UploaderConfig {
    UploaderConfig {
        chunk_size,
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        chunk_timeout: Duration::from_secs(10),
    }
}

// ============================================================================
// HTTP Helpers
// ============================================================================

/// Send a request through the router and decode the JSON body.
pub async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let json: Value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };

    (status, json)
}

/// Helper to make JSON requests.
pub async fn json_request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);

    let body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };

    send(router, builder.body(body).unwrap()).await
}

/// Upload raw chunk bytes
pub async fn chunk_request(
    router: &axum::Router,
    upload_id: &str,
    index: usize,
    data: &[u8],
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/chunk/upload/chunk/{upload_id}/{index}"))
        .header("Content-Type", "application/octet-stream")
        .body(Body::from(data.to_vec()))
        .unwrap();

    send(router, request).await
}

// ============================================================================
// In-Process Transport
// ============================================================================

/// Transport that calls the coordinator directly, with failure injection
pub struct LocalTransport {
    coordinator: TransferCoordinator,
    /// Remaining injected network failures per chunk index
    failures: Mutex<HashMap<usize, u32>>,
    /// Attempts per chunk index, failed ones included
    attempts: Mutex<HashMap<usize, u32>>,
    /// Chunks that reached the coordinator
    delivered: AtomicUsize,
}

impl LocalTransport {
    pub fn new(coordinator: TransferCoordinator) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            failures: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            delivered: AtomicUsize::new(0),
        })
    }

    /// Fail the next `times` attempts at chunk `index` with a network error
    pub fn fail_chunk(&self, index: usize, times: u32) {
        self.failures.lock().insert(index, times);
    }

    pub fn attempts(&self, index: usize) -> u32 {
        self.attempts.lock().get(&index).copied().unwrap_or(0)
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

fn to_client_error(err: UploadError) -> ClientError {
    ClientError::from_server(err.status_code().as_u16(), Some(err.detail()), err.to_string())
}

#[async_trait::async_trait]
impl UploadTransport for LocalTransport {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, ClientError> {
        self.coordinator
            .init(request.clone())
            .await
            .map_err(to_client_error)
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        index: usize,
        data: Vec<u8>,
    ) -> Result<ChunkUploadResponse, ClientError> {
        *self.attempts.lock().entry(index).or_insert(0) += 1;

        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(&index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ClientError::Network(format!("injected failure for chunk {index}")));
                }
            }
        }

        let response = self
            .coordinator
            .upload_chunk(upload_id, index, &data)
            .await
            .map_err(to_client_error)?;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(response)
    }

    async fn complete(
        &self,
        upload_id: &str,
        request: &CompleteRequest,
    ) -> Result<CompleteResponse, ClientError> {
        self.coordinator
            .complete(upload_id, request)
            .await
            .map_err(to_client_error)
    }

    async fn status(&self, upload_id: &str) -> Result<StatusResponse, ClientError> {
        self.coordinator.status(upload_id).await.map_err(to_client_error)
    }

    async fn cancel(&self, upload_id: &str) -> Result<(), ClientError> {
        self.coordinator.cancel(upload_id).await.map_err(to_client_error)
    }

    async fn verify(&self, upload_id: &str, index: usize, chunk_hash: &str) -> Result<bool, ClientError> {
        self.coordinator
            .verify(upload_id, index, chunk_hash)
            .await
            .map_err(to_client_error)
    }
}
