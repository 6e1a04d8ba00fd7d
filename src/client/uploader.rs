//! Resumable upload state machine
//!
//! `Idle → Hashing → Initializing → Uploading ⇄ Paused → Completing → Completed`,
//! with `Cancelled` reachable from anywhere and `Failed` after a terminal error.
//! Pause and cancel are cooperative: they are observed between chunks, and an
//! in-flight chunk always runs to completion (or exhausts its retries).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::upload::{
    ChunkBitmap, CompleteRequest, InitRequest, SessionStatus, StatusResponse, DEFAULT_CHUNK_SIZE,
};

use super::error::ClientError;
use super::progress::{Phase, ProgressCallback, ProgressReporter};
use super::source::{hash_file, read_range};
use super::transport::UploadTransport;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Bytes per chunk
    pub chunk_size: u64,

    /// Retries per chunk after the first attempt
    pub max_retries: u32,

    /// Backoff unit; retry `n` waits `n * base_delay`
    pub base_delay: Duration,

    /// Wall-clock limit on a single chunk attempt
    pub chunk_timeout: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            chunk_timeout: Duration::from_secs(300),
        }
    }
}

// ============================================================================
// State and Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Hashing,
    Initializing,
    Uploading,
    Paused,
    Completing,
    Completed,
    Cancelled,
    Failed,
}

/// How a completed upload got its share code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Content already existed on the server; nothing was transferred
    Instant,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub code: String,
    pub name: String,
    pub mode: CompletionMode,
}

/// Where a call to `start` or `resume` stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed(UploadResult),
    Paused,
    Cancelled,
}

pub type ErrorCallback = Box<dyn Fn(&ClientError) + Send + Sync>;
pub type CompleteCallback = Box<dyn Fn(&UploadResult) + Send + Sync>;

/// Local mirror of the server session
struct Mirror {
    state: UploadState,
    path: Option<PathBuf>,
    file_name: String,
    file_size: u64,
    file_hash: String,
    upload_id: Option<String>,
    chunk_size: u64,
    total_chunks: usize,
    received: ChunkBitmap,
    expire: Option<CompleteRequest>,
    result: Option<UploadResult>,
}

impl Mirror {
    fn new() -> Self {
        Self {
            state: UploadState::Idle,
            path: None,
            file_name: String::new(),
            file_size: 0,
            file_hash: String::new(),
            upload_id: None,
            chunk_size: 0,
            total_chunks: 0,
            received: ChunkBitmap::new(0),
            expire: None,
            result: None,
        }
    }

    fn byte_range(&self, index: usize) -> (u64, u64) {
        let start = index as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        (start, end - start)
    }

    /// Replace local assumptions with the server's received set
    fn adopt(&mut self, total_chunks: usize, uploaded: &[usize]) {
        self.total_chunks = total_chunks;
        self.received = ChunkBitmap::from_indices(total_chunks, uploaded.iter().copied());
    }
}

// ============================================================================
// Resumable Uploader
// ============================================================================

#[derive(Clone)]
pub struct ResumableUploader {
    inner: Arc<UploaderInner>,
}

struct UploaderInner {
    transport: Arc<dyn UploadTransport>,
    config: UploaderConfig,
    mirror: Mutex<Mirror>,
    pause: AtomicBool,
    cancel: Arc<AtomicBool>,
    progress: ProgressReporter,
    on_error: RwLock<Option<ErrorCallback>>,
    on_complete: RwLock<Option<CompleteCallback>>,
}

impl ResumableUploader {
    pub fn new(transport: Arc<dyn UploadTransport>, config: UploaderConfig) -> Self {
        Self {
            inner: Arc::new(UploaderInner {
                transport,
                config,
                mirror: Mutex::new(Mirror::new()),
                pause: AtomicBool::new(false),
                cancel: Arc::new(AtomicBool::new(false)),
                progress: ProgressReporter::new(),
                on_error: RwLock::new(None),
                on_complete: RwLock::new(None),
            }),
        }
    }

    // ========================================================================
    // Callbacks and Accessors
    // ========================================================================

    pub fn on_progress(&self, callback: ProgressCallback) {
        self.inner.progress.set_callback(callback);
    }

    /// Invoked once per failed `start` or `resume`
    pub fn on_error(&self, callback: ErrorCallback) {
        *self.inner.on_error.write() = Some(callback);
    }

    pub fn on_complete(&self, callback: CompleteCallback) {
        *self.inner.on_complete.write() = Some(callback);
    }

    pub fn state(&self) -> UploadState {
        self.inner.mirror.lock().state
    }

    pub fn upload_id(&self) -> Option<String> {
        self.inner.mirror.lock().upload_id.clone()
    }

    /// Chunk indices the server is known to hold
    pub fn uploaded_chunks(&self) -> Vec<usize> {
        self.inner.mirror.lock().received.to_vec()
    }

    /// Fraction of chunks held by the server, never decreasing within an upload
    pub fn progress(&self) -> f64 {
        self.inner.progress.current()
    }

    fn set_state(&self, state: UploadState) {
        self.inner.mirror.lock().state = state;
    }

    fn cancelled(&self) -> bool {
        self.inner.cancel.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Start / Resume
    // ========================================================================

    /// Hash, initialize, upload missing chunks, and complete
    ///
    /// Allowed from `Idle`, `Cancelled`, or a `Failed` upload that never got
    /// a server session.
    pub async fn start(
        &self,
        path: impl AsRef<Path>,
        expire_value: i64,
        expire_style: impl Into<String>,
    ) -> Result<UploadOutcome, ClientError> {
        let path = path.as_ref().to_path_buf();
        {
            let mut mirror = self.inner.mirror.lock();
            let restartable = match mirror.state {
                UploadState::Idle | UploadState::Cancelled => true,
                UploadState::Failed => mirror.upload_id.is_none(),
                _ => false,
            };
            if !restartable {
                return Err(ClientError::InvalidState(format!(
                    "cannot start while {:?}",
                    mirror.state
                )));
            }
            *mirror = Mirror::new();
            mirror.path = Some(path.clone());
            mirror.chunk_size = self.inner.config.chunk_size;
            mirror.expire = Some(CompleteRequest {
                expire_value,
                expire_style: expire_style.into(),
            });
            mirror.state = UploadState::Hashing;
        }
        self.inner.pause.store(false, Ordering::SeqCst);
        self.inner.cancel.store(false, Ordering::SeqCst);
        self.inner.progress.reset();

        let result = self.run_start(&path).await;
        self.finish(result)
    }

    async fn run_start(&self, path: &Path) -> Result<UploadOutcome, ClientError> {
        self.inner.progress.report(Phase::Hashing, 0, 0);

        let metadata = tokio::fs::metadata(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ClientError::InvalidState(format!("{} is not a file", path.display())))?;

        let Some(file_hash) = hash_file(path, self.inner.cancel.clone()).await? else {
            return Ok(UploadOutcome::Cancelled);
        };
        if self.cancelled() {
            return Ok(UploadOutcome::Cancelled);
        }

        tracing::debug!(file_name = %file_name, file_hash = %file_hash, "Hashed file");

        {
            let mut mirror = self.inner.mirror.lock();
            mirror.file_name = file_name;
            mirror.file_size = metadata.len();
            mirror.file_hash = file_hash;
        }

        if let Some(result) = self.init().await? {
            self.inner.progress.report(Phase::Completing, 0, 0);
            return Ok(UploadOutcome::Completed(result));
        }
        if self.cancelled() {
            return Ok(UploadOutcome::Cancelled);
        }

        self.upload_and_complete().await
    }

    /// Continue a paused or failed upload against the same session
    ///
    /// If the server no longer has the session, the local id is dropped and
    /// the error is `SessionNotFound`; call `start` again.
    pub async fn resume(&self) -> Result<UploadOutcome, ClientError> {
        {
            let mirror = self.inner.mirror.lock();
            if mirror.upload_id.is_none() {
                return Err(ClientError::NoActiveSession);
            }
            match mirror.state {
                UploadState::Completed => {
                    if let Some(result) = &mirror.result {
                        return Ok(UploadOutcome::Completed(result.clone()));
                    }
                }
                UploadState::Paused | UploadState::Failed => {}
                other => {
                    return Err(ClientError::InvalidState(format!("cannot resume while {other:?}")));
                }
            }
        }
        self.inner.pause.store(false, Ordering::SeqCst);
        self.set_state(UploadState::Uploading);

        let result = self.run_resume().await;
        if matches!(result, Err(ClientError::SessionNotFound(_))) {
            // Dead on the server; only a fresh start can continue
            self.inner.mirror.lock().upload_id = None;
        }
        self.finish(result)
    }

    async fn run_resume(&self) -> Result<UploadOutcome, ClientError> {
        let status = self.status().await?;
        if self.cancelled() {
            return Ok(UploadOutcome::Cancelled);
        }

        match status.status {
            SessionStatus::Pending | SessionStatus::Completed => {}
            SessionStatus::Expired | SessionStatus::Cancelled => {
                return Err(ClientError::SessionNotFound(format!(
                    "{} is {}",
                    status.upload_id,
                    status.status.as_str()
                )));
            }
        }

        tracing::info!(
            upload_id = %status.upload_id,
            uploaded = status.uploaded_chunks.len(),
            total_chunks = status.total_chunks,
            "Resuming upload"
        );

        self.upload_and_complete().await
    }

    /// Record the terminal state and fire callbacks exactly once
    fn finish(&self, result: Result<UploadOutcome, ClientError>) -> Result<UploadOutcome, ClientError> {
        match &result {
            Ok(UploadOutcome::Completed(done)) => {
                if let Some(cb) = self.inner.on_complete.read().as_ref() {
                    cb(done);
                }
            }
            Ok(UploadOutcome::Paused) => self.set_state(UploadState::Paused),
            Ok(UploadOutcome::Cancelled) => self.set_state(UploadState::Cancelled),
            Err(e) => {
                if self.cancelled() {
                    self.set_state(UploadState::Cancelled);
                    return Ok(UploadOutcome::Cancelled);
                }
                self.set_state(UploadState::Failed);
                tracing::warn!(error = %e, kind = ?e.kind(), "Upload failed");
                if let Some(cb) = self.inner.on_error.read().as_ref() {
                    cb(e);
                }
            }
        }
        result
    }

    // ========================================================================
    // Protocol Steps
    // ========================================================================

    /// Send Init; `Some` on a dedup hit
    async fn init(&self) -> Result<Option<UploadResult>, ClientError> {
        let request = {
            let mut mirror = self.inner.mirror.lock();
            mirror.state = UploadState::Initializing;
            InitRequest {
                file_name: mirror.file_name.clone(),
                file_size: mirror.file_size,
                chunk_size: mirror.chunk_size,
                file_hash: mirror.file_hash.clone(),
            }
        };
        self.inner.progress.report(Phase::Initializing, 0, 0);

        let response = self.inner.transport.init(&request).await?;

        let mut mirror = self.inner.mirror.lock();
        if self.cancelled() {
            // The mirror was reset while Init was in flight
            drop(mirror);
            if let Some(upload_id) = response.upload_id {
                self.spawn_server_cancel(upload_id);
            }
            return Err(ClientError::Cancelled);
        }
        if response.existed {
            let code = response.file_code.ok_or_else(|| ClientError::Protocol {
                status: 200,
                kind: "MALFORMED_RESPONSE".to_string(),
                message: "dedup hit without a file code".to_string(),
            })?;
            let result = UploadResult {
                code,
                name: mirror.file_name.clone(),
                mode: CompletionMode::Instant,
            };
            mirror.result = Some(result.clone());
            mirror.state = UploadState::Completed;

            tracing::info!(file_name = %mirror.file_name, code = %result.code, "Instant upload");
            return Ok(Some(result));
        }

        let upload_id = response.upload_id.ok_or_else(|| ClientError::Protocol {
            status: 200,
            kind: "MALFORMED_RESPONSE".to_string(),
            message: "init response without an upload id".to_string(),
        })?;
        if let Some(chunk_size) = response.chunk_size {
            mirror.chunk_size = chunk_size;
        }
        let total_chunks = response
            .total_chunks
            .unwrap_or_else(|| crate::upload::total_chunks_for(mirror.file_size, mirror.chunk_size));
        mirror.adopt(total_chunks, &response.uploaded_chunks.unwrap_or_default());
        mirror.upload_id = Some(upload_id);

        tracing::info!(
            upload_id = ?mirror.upload_id,
            total_chunks = mirror.total_chunks,
            uploaded = mirror.received.count(),
            "Upload initialized"
        );
        Ok(None)
    }

    async fn upload_and_complete(&self) -> Result<UploadOutcome, ClientError> {
        if let Some(stopped) = self.upload_loop().await? {
            return Ok(stopped);
        }
        let result = self.complete().await?;
        Ok(UploadOutcome::Completed(result))
    }

    /// Upload missing chunks in ascending order; `Some` if paused or cancelled
    async fn upload_loop(&self) -> Result<Option<UploadOutcome>, ClientError> {
        let (missing, total) = {
            let mut mirror = self.inner.mirror.lock();
            mirror.state = UploadState::Uploading;
            (mirror.received.missing().collect::<Vec<_>>(), mirror.total_chunks)
        };
        self.inner
            .progress
            .report(Phase::Uploading, total - missing.len(), total);

        for index in missing {
            if self.cancelled() {
                return Ok(Some(UploadOutcome::Cancelled));
            }
            if self.inner.pause.load(Ordering::SeqCst) {
                tracing::info!(upload_id = ?self.upload_id(), next_chunk = index, "Upload paused");
                return Ok(Some(UploadOutcome::Paused));
            }

            self.upload_chunk(index).await?;

            let uploaded = {
                let mut mirror = self.inner.mirror.lock();
                mirror.received.insert(index);
                mirror.received.count()
            };
            self.inner.progress.report(Phase::Uploading, uploaded, total);
        }

        Ok(None)
    }

    /// Transfer one chunk, retrying network failures with linear backoff
    async fn upload_chunk(&self, index: usize) -> Result<(), ClientError> {
        let (path, upload_id, offset, len) = {
            let mirror = self.inner.mirror.lock();
            let path = mirror.path.clone().ok_or(ClientError::NoActiveSession)?;
            let upload_id = mirror.upload_id.clone().ok_or(ClientError::NoActiveSession)?;
            let (offset, len) = mirror.byte_range(index);
            (path, upload_id, offset, len)
        };
        let data = read_range(&path, offset, len).await?;

        let config = &self.inner.config;
        let attempts = config.max_retries + 1;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let sent = tokio::time::timeout(
                config.chunk_timeout,
                self.inner.transport.upload_chunk(&upload_id, index, data.clone()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ClientError::Network(format!(
                    "chunk {index} timed out after {:?}",
                    config.chunk_timeout
                )))
            });

            let err = match sent {
                Ok(_) => {
                    tracing::debug!(upload_id = %upload_id, chunk_index = index, attempt = attempt, "Chunk uploaded");
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if attempt >= attempts {
                return Err(ClientError::RetriesExhausted {
                    index,
                    attempts,
                    source: Box::new(err),
                });
            }
            if self.cancelled() {
                return Err(ClientError::Cancelled);
            }

            let delay = config.base_delay * attempt;
            tracing::warn!(
                upload_id = %upload_id,
                chunk_index = index,
                attempt = attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Chunk upload failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Finalize the upload. Idempotent: later calls return the first result.
    pub async fn complete(&self) -> Result<UploadResult, ClientError> {
        let (upload_id, request, name, total) = {
            let mut mirror = self.inner.mirror.lock();
            if let Some(result) = &mirror.result {
                return Ok(result.clone());
            }
            let upload_id = mirror.upload_id.clone().ok_or(ClientError::NoActiveSession)?;
            let missing: Vec<usize> = mirror.received.missing().collect();
            if !missing.is_empty() {
                return Err(ClientError::IncompleteUpload(missing));
            }
            mirror.state = UploadState::Completing;
            let request = mirror.expire.clone().unwrap_or(CompleteRequest {
                expire_value: 1,
                expire_style: "day".to_string(),
            });
            (upload_id, request, mirror.file_name.clone(), mirror.total_chunks)
        };
        self.inner.progress.report(Phase::Completing, total, total);

        let response = self.inner.transport.complete(&upload_id, &request).await?;

        let result = UploadResult {
            code: response.code,
            name: if response.name.is_empty() { name } else { response.name },
            mode: CompletionMode::Upload,
        };

        let mut mirror = self.inner.mirror.lock();
        if self.cancelled() {
            return Err(ClientError::Cancelled);
        }
        mirror.result = Some(result.clone());
        mirror.state = UploadState::Completed;

        tracing::info!(upload_id = %upload_id, code = %result.code, "Upload completed");
        Ok(result)
    }

    // ========================================================================
    // Pause / Cancel / Status / Verify
    // ========================================================================

    /// Stop before the next chunk; the in-flight chunk finishes
    pub fn pause(&self) {
        self.inner.pause.store(true, Ordering::SeqCst);
    }

    /// Abandon the upload. The server session is deleted in the background.
    pub fn cancel(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);

        let upload_id = {
            let mut mirror = self.inner.mirror.lock();
            let upload_id = mirror.upload_id.take();
            *mirror = Mirror::new();
            mirror.state = UploadState::Cancelled;
            upload_id
        };

        if let Some(upload_id) = upload_id {
            self.spawn_server_cancel(upload_id);
        }
    }

    /// Best-effort DELETE of a server session, off the caller's task
    fn spawn_server_cancel(&self, upload_id: String) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let transport = self.inner.transport.clone();
                runtime.spawn(async move {
                    match transport.cancel(&upload_id).await {
                        Ok(()) => tracing::info!(upload_id = %upload_id, "Upload cancelled"),
                        Err(e) => tracing::warn!(
                            upload_id = %upload_id,
                            error = %e,
                            "Failed to cancel upload on server"
                        ),
                    }
                });
            }
            Err(_) => {
                tracing::warn!(upload_id = %upload_id, "No runtime available to cancel upload on server");
            }
        }
    }

    /// Fetch the authoritative status and adopt its received set
    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        let upload_id = self.upload_id().ok_or(ClientError::NoActiveSession)?;
        let status = self.inner.transport.status(&upload_id).await?;

        let mut mirror = self.inner.mirror.lock();
        if mirror.upload_id.as_deref() == Some(upload_id.as_str()) {
            mirror.adopt(status.total_chunks, &status.uploaded_chunks);
        }
        Ok(status)
    }

    /// Whether the server's digest for a chunk matches. Errors read as `false`.
    pub async fn verify_chunk(&self, index: usize, expected_hash: &str) -> bool {
        let Some(upload_id) = self.upload_id() else {
            tracing::warn!(chunk_index = index, "Cannot verify chunk without an active upload");
            return false;
        };

        match self.inner.transport.verify(&upload_id, index, expected_hash).await {
            Ok(valid) => valid,
            Err(e) => {
                tracing::warn!(upload_id = %upload_id, chunk_index = index, error = %e, "Chunk verification failed");
                false
            }
        }
    }
}
