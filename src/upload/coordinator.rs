//! Transfer Coordinator
//!
//! Owns the server side of the chunked upload protocol: Init (dedup, resume,
//! or create), idempotent chunk writes, assembly on Complete, Status, Cancel
//! and chunk Verify. HTTP handlers are thin wrappers over these operations.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::chunk_store::{compute_hash, ChunkStore};
use super::deduplication::DeduplicationService;
use super::expiry::ExpirePolicy;
use super::session::{SessionManager, SessionOrigin};
use super::types::{
    ChunkDisposition, ChunkUploadResponse, CompleteRequest, CompleteResponse, InitRequest,
    InitResponse, SessionStatus, StatusResponse, UploadError, UploadSession,
};
use crate::config::UploadConfig;
use crate::db::ArtifactRecord;

/// Attempts at drawing an unused share code before giving up
const SHARE_CODE_ATTEMPTS: usize = 5;

// ============================================================================
// Transfer Coordinator
// ============================================================================

#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<TransferCoordinatorInner>,
}

struct TransferCoordinatorInner {
    sessions: SessionManager,
    chunk_store: ChunkStore,
    dedup: DeduplicationService,
    config: UploadConfig,
}

impl TransferCoordinator {
    /// Build a coordinator storing chunks and artifacts under `storage_path`
    pub fn new(db: SqlitePool, storage_path: PathBuf, config: UploadConfig) -> Self {
        let chunk_store = ChunkStore::with_local_storage(storage_path);
        let sessions = SessionManager::new(db.clone(), chunk_store.clone(), config.session_ttl());
        let dedup = DeduplicationService::new(db, config.dedup_cache_size);

        Self {
            inner: Arc::new(TransferCoordinatorInner {
                sessions,
                chunk_store,
                dedup,
                config,
            }),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    // ========================================================================
    // Init
    // ========================================================================

    /// Start, resume, or short-circuit an upload
    pub async fn init(&self, mut request: InitRequest) -> Result<InitResponse, UploadError> {
        self.validate_init(&mut request)?;

        if let Some(code) = self
            .inner
            .dedup
            .check_file_exists(&request.file_hash, request.file_size)
            .await?
        {
            tracing::info!(
                file_hash = %request.file_hash,
                file_name = %request.file_name,
                code = %code,
                "Duplicate file detected - instant upload"
            );
            return Ok(InitResponse::existing(code));
        }

        let (handle, origin) = self.inner.sessions.find_or_create(&request).await?;
        let session = handle.lock().await;

        if origin == SessionOrigin::Resumed {
            tracing::debug!(
                upload_id = %session.id,
                resume_position = session.resume_position(),
                "Init resumed existing session"
            );
        }

        Ok(InitResponse::session(&session))
    }

    fn validate_init(&self, request: &mut InitRequest) -> Result<(), UploadError> {
        let config = &self.inner.config;

        if request.file_name.trim().is_empty() {
            return Err(UploadError::InvalidRequest("file_name is required".to_string()));
        }

        request.file_hash = request.file_hash.trim().to_ascii_lowercase();
        if request.file_hash.len() != 64 || !request.file_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(UploadError::InvalidRequest(
                "file_hash must be a hex SHA-256 digest".to_string(),
            ));
        }

        if request.file_size > config.max_file_size {
            return Err(UploadError::FileTooLarge {
                size: request.file_size,
                max: config.max_file_size,
            });
        }

        if request.chunk_size < config.min_chunk_size || request.chunk_size > config.max_chunk_size {
            return Err(UploadError::InvalidChunkSize {
                size: request.chunk_size,
                min: config.min_chunk_size,
                max: config.max_chunk_size,
            });
        }

        Ok(())
    }

    // ========================================================================
    // Chunk Upload
    // ========================================================================

    /// Accept one chunk. Re-sending identical bytes is a no-op success.
    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_index: usize,
        data: &[u8],
    ) -> Result<ChunkUploadResponse, UploadError> {
        let handle = self.inner.sessions.get_by_str(upload_id).await?;
        let mut session = handle.lock().await;

        ensure_pending(&session)?;

        if chunk_index >= session.total_chunks {
            return Err(UploadError::ChunkIndexOutOfBounds {
                index: chunk_index,
                total: session.total_chunks,
            });
        }

        let expected = session.expected_chunk_len(chunk_index);
        let actual = data.len() as u64;
        if actual != expected {
            if session.received.contains(chunk_index) {
                return Err(UploadError::ChunkConflict(chunk_index));
            }
            return Err(UploadError::ChunkSizeMismatch {
                index: chunk_index,
                expected,
                actual,
            });
        }

        let chunk_hash = compute_hash(data);

        match session.check_chunk(chunk_index, &chunk_hash)? {
            ChunkDisposition::Duplicate => {
                tracing::debug!(
                    upload_id = %session.id,
                    chunk_index = chunk_index,
                    "Chunk already received, ignoring repeat"
                );
            }
            ChunkDisposition::Store => {
                let stored = self
                    .inner
                    .chunk_store
                    .store_chunk(session.id, chunk_index, data)
                    .await?;
                self.inner
                    .sessions
                    .persist_chunk(session.id, chunk_index, &stored.hash, stored.size)
                    .await?;
                session.mark_chunk_received(chunk_index, stored.hash);

                tracing::debug!(
                    upload_id = %session.id,
                    chunk_index = chunk_index,
                    uploaded = session.received.count(),
                    total_chunks = session.total_chunks,
                    progress = format!("{:.1}%", session.progress()),
                    "Chunk uploaded"
                );
            }
        }

        Ok(ChunkUploadResponse {
            chunk_index,
            chunk_hash,
            uploaded_count: session.received.count(),
            total_chunks: session.total_chunks,
            progress: session.progress(),
        })
    }

    // ========================================================================
    // Complete
    // ========================================================================

    /// Assemble the file and publish it under a share code. Idempotent.
    pub async fn complete(
        &self,
        upload_id: &str,
        request: &CompleteRequest,
    ) -> Result<CompleteResponse, UploadError> {
        let handle = self.inner.sessions.get_by_str(upload_id).await?;
        let mut session = handle.lock().await;

        if session.status == SessionStatus::Completed {
            if let Some(code) = &session.share_code {
                return Ok(CompleteResponse {
                    code: code.clone(),
                    name: session.file_name.clone(),
                });
            }
        }
        ensure_pending(&session)?;

        let policy = ExpirePolicy::parse(request.expire_value, &request.expire_style)?;
        let now = Utc::now();
        let expiry = policy.resolve(now)?;

        if !session.is_complete() {
            return Err(UploadError::IncompleteUpload(session.missing_chunks()));
        }

        tracing::info!(
            upload_id = %session.id,
            file_name = %session.file_name,
            chunks = session.total_chunks,
            "Assembling file from chunks"
        );

        let assembled = self
            .inner
            .chunk_store
            .assemble_chunks(session.id, session.total_chunks, &session.file_name)
            .await?;

        if assembled.hash != session.file_hash {
            self.inner.chunk_store.discard_file(&assembled.relative_path).await;

            // The stored chunks cannot be corrected in place
            session.status = SessionStatus::Cancelled;
            self.inner.sessions.persist_status(&session).await?;

            tracing::warn!(
                upload_id = %session.id,
                expected = %session.file_hash,
                actual = %assembled.hash,
                "Assembled file does not match declared hash"
            );
            return Err(UploadError::HashMismatch {
                expected: session.file_hash.clone(),
                actual: assembled.hash,
            });
        }

        let artifact = ArtifactRecord {
            code: String::new(),
            file_hash: session.file_hash.clone(),
            name: session.file_name.clone(),
            size: assembled.size as i64,
            storage_path: assembled.relative_path.clone(),
            expire_value: policy.value,
            expire_style: policy.style.as_str().to_string(),
            expired_at: expiry.expired_at.map(|t| t.to_rfc3339()),
            expired_count: expiry.expired_count,
            used_count: 0,
            upload_id: Some(session.id.to_string()),
            created_at: now.to_rfc3339(),
        };

        let code = match self.publish(artifact, session.file_size).await {
            Ok(code) => code,
            Err(e) => {
                // Nothing references the assembled file yet
                self.inner.chunk_store.discard_file(&assembled.relative_path).await;
                return Err(e);
            }
        };

        session.status = SessionStatus::Completed;
        session.share_code = Some(code.clone());
        session.completed_at = Some(Utc::now());
        self.inner.sessions.persist_status(&session).await?;

        if let Err(e) = self.inner.chunk_store.delete_session_chunks(session.id).await {
            tracing::warn!(upload_id = %session.id, error = %e, "Failed to delete chunks after assembly");
        }

        tracing::info!(
            upload_id = %session.id,
            file_name = %session.file_name,
            code = %code,
            size = assembled.size,
            expire_style = policy.style.as_str(),
            "Upload session completed"
        );

        Ok(CompleteResponse {
            code,
            name: session.file_name.clone(),
        })
    }

    /// Register an assembled file under a fresh share code, or return the
    /// code of an identical artifact published first
    async fn publish(&self, mut artifact: ArtifactRecord, file_size: u64) -> Result<String, UploadError> {
        if let Some(existing) = self
            .inner
            .dedup
            .check_file_exists(&artifact.file_hash, file_size)
            .await?
        {
            self.inner.chunk_store.discard_file(&artifact.storage_path).await;
            return Ok(existing);
        }

        artifact.code = self.allocate_share_code().await?;
        let code = artifact.code.clone();
        self.inner.dedup.register_file(artifact).await?;
        Ok(code)
    }

    async fn allocate_share_code(&self) -> Result<String, UploadError> {
        for _ in 0..SHARE_CODE_ATTEMPTS {
            let code = generate_share_code();
            if !self.inner.dedup.code_in_use(&code).await? {
                return Ok(code);
            }
        }
        Err(UploadError::Internal("could not allocate a unique share code".to_string()))
    }

    // ========================================================================
    // Status / Cancel / Verify
    // ========================================================================

    /// Authoritative view of a session
    pub async fn status(&self, upload_id: &str) -> Result<StatusResponse, UploadError> {
        let handle = self.inner.sessions.get_by_str(upload_id).await?;
        let session = handle.lock().await;

        let mut status = StatusResponse::from_session(&session);
        if session.is_expired() {
            status.status = SessionStatus::Expired;
        }
        Ok(status)
    }

    /// Mark a session cancelled; its chunks are removed by the sweeper
    pub async fn cancel(&self, upload_id: &str) -> Result<(), UploadError> {
        let handle = self.inner.sessions.get_by_str(upload_id).await?;
        let mut session = handle.lock().await;

        match session.status {
            SessionStatus::Cancelled => return Ok(()),
            SessionStatus::Completed => {
                return Err(UploadError::SessionCompleted(session.id.to_string()))
            }
            SessionStatus::Pending | SessionStatus::Expired => {}
        }

        session.status = SessionStatus::Cancelled;
        self.inner.sessions.persist_status(&session).await?;

        tracing::info!(
            upload_id = %session.id,
            file_name = %session.file_name,
            received = session.received.count(),
            "Upload session cancelled"
        );

        Ok(())
    }

    /// Whether the stored digest of a chunk equals `chunk_hash`
    pub async fn verify(
        &self,
        upload_id: &str,
        chunk_index: usize,
        chunk_hash: &str,
    ) -> Result<bool, UploadError> {
        let handle = self.inner.sessions.get_by_str(upload_id).await?;
        let session = handle.lock().await;

        if chunk_index >= session.total_chunks {
            return Err(UploadError::ChunkIndexOutOfBounds {
                index: chunk_index,
                total: session.total_chunks,
            });
        }

        Ok(session
            .chunk_hashes
            .get(&chunk_index)
            .is_some_and(|stored| stored.eq_ignore_ascii_case(chunk_hash.trim())))
    }
}

fn ensure_pending(session: &UploadSession) -> Result<(), UploadError> {
    let id = session.id.to_string();
    match session.status {
        SessionStatus::Completed => Err(UploadError::SessionCompleted(id)),
        SessionStatus::Cancelled => Err(UploadError::SessionCancelled(id)),
        SessionStatus::Expired => Err(UploadError::SessionExpired(id)),
        SessionStatus::Pending if session.is_expired() => Err(UploadError::SessionExpired(id)),
        SessionStatus::Pending => Ok(()),
    }
}

/// Short random share code: 12 lowercase hex characters
pub fn generate_share_code() -> String {
    let mut code = Uuid::new_v4().simple().to_string();
    code.truncate(12);
    code
}

// ============================================================================
// Tests
// ============================================================================
