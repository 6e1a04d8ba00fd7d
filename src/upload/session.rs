//! Upload Session Manager
//!
//! Manages upload sessions with:
//! - In-memory registry with one lock per session
//! - Write-through persistence to SQLite, restored on startup
//! - Background sweeper for abandoned, cancelled, and finished sessions

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::chunk_store::ChunkStore;
use super::types::{InitRequest, SessionStatus, UploadError, UploadSession};
use crate::db::SessionRepository;

/// Shared handle to a single session; holding the lock makes a
/// read-modify-write on the session atomic.
pub type SessionHandle = Arc<Mutex<UploadSession>>;

// ============================================================================
// Session Manager
// ============================================================================

/// Manages upload sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    db: SqlitePool,

    chunk_store: ChunkStore,

    /// Sessions indexed by ID
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,

    /// Sessions indexed by file hash (for resume lookup)
    sessions_by_hash: RwLock<HashMap<String, Vec<Uuid>>>,

    /// Serializes lookup-or-create in `find_or_create`
    create_lock: Mutex<()>,

    /// Lifetime of a pending session, and retention of a completed one
    ttl: chrono::Duration,
}

/// Whether `find_or_create` resumed or created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    Created,
    Resumed,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Pending sessions that passed their deadline
    pub expired: usize,
    /// Sessions removed from the registry and database
    pub purged: usize,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(db: SqlitePool, chunk_store: ChunkStore, ttl: chrono::Duration) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                db,
                chunk_store,
                sessions: RwLock::new(HashMap::new()),
                sessions_by_hash: RwLock::new(HashMap::new()),
                create_lock: Mutex::new(()),
                ttl,
            }),
        }
    }

    fn repo(&self) -> SessionRepository<'_> {
        SessionRepository::new(&self.inner.db)
    }

    /// Restore persisted sessions into the registry
    pub async fn load(&self) -> Result<usize, UploadError> {
        let restored = self.repo().load_all().await?;
        let count = restored.len();

        for session in restored {
            self.register(session).await;
        }

        tracing::info!(count = count, "Restored upload sessions");
        Ok(count)
    }

    async fn register(&self, session: UploadSession) -> SessionHandle {
        let id = session.id;
        let hash = session.file_hash.clone();
        let handle = Arc::new(Mutex::new(session));

        {
            let mut sessions = self.inner.sessions.write().await;
            sessions.insert(id, handle.clone());
        }
        {
            let mut by_hash = self.inner.sessions_by_hash.write().await;
            by_hash.entry(hash).or_default().push(id);
        }

        handle
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Resume a matching pending session, or create a new one
    pub async fn find_or_create(
        &self,
        request: &InitRequest,
    ) -> Result<(SessionHandle, SessionOrigin), UploadError> {
        let _guard = self.inner.create_lock.lock().await;

        for handle in self.find_by_hash(&request.file_hash).await {
            let session = handle.lock().await;
            if session.matches(request) {
                tracing::info!(
                    upload_id = %session.id,
                    file_name = %request.file_name,
                    received = session.received.count(),
                    total_chunks = session.total_chunks,
                    "Resuming upload session"
                );
                drop(session);
                return Ok((handle, SessionOrigin::Resumed));
            }
        }

        let session = UploadSession::new(request, self.inner.ttl);
        self.repo().insert(&session).await?;

        tracing::info!(
            upload_id = %session.id,
            file_name = %request.file_name,
            file_size = request.file_size,
            total_chunks = session.total_chunks,
            "Created upload session"
        );

        let handle = self.register(session).await;
        Ok((handle, SessionOrigin::Created))
    }

    /// Get a session by ID
    pub async fn get(&self, id: Uuid) -> Result<SessionHandle, UploadError> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))
    }

    /// Get a session by string ID
    pub async fn get_by_str(&self, id: &str) -> Result<SessionHandle, UploadError> {
        let uuid = Uuid::parse_str(id).map_err(|_| UploadError::SessionNotFound(id.to_string()))?;
        self.get(uuid).await
    }

    /// Persist a chunk that has been written to storage
    pub async fn persist_chunk(
        &self,
        session_id: Uuid,
        index: usize,
        hash: &str,
        size: u64,
    ) -> Result<(), UploadError> {
        self.repo().record_chunk(session_id, index, hash, size).await?;
        Ok(())
    }

    /// Persist a status change
    pub async fn persist_status(&self, session: &UploadSession) -> Result<(), UploadError> {
        self.repo()
            .update_status(
                session.id,
                session.status,
                session.share_code.as_deref(),
                session.completed_at,
            )
            .await?;
        Ok(())
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    /// Find sessions by file hash
    pub async fn find_by_hash(&self, file_hash: &str) -> Vec<SessionHandle> {
        let by_hash = self.inner.sessions_by_hash.read().await;
        let sessions = self.inner.sessions.read().await;

        by_hash
            .get(file_hash)
            .map(|ids| ids.iter().filter_map(|id| sessions.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        let sessions = self.inner.sessions.read().await;
        sessions.len()
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    async fn unregister(&self, id: Uuid, file_hash: &str) {
        {
            let mut sessions = self.inner.sessions.write().await;
            sessions.remove(&id);
        }

        let mut by_hash = self.inner.sessions_by_hash.write().await;
        if let Some(ids) = by_hash.get_mut(file_hash) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                by_hash.remove(file_hash);
            }
        }
    }

    /// Expire abandoned sessions and purge finished ones
    pub async fn sweep(&self) -> SweepStats {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepStats {
        let handles: Vec<SessionHandle> = {
            let sessions = self.inner.sessions.read().await;
            sessions.values().cloned().collect()
        };

        let mut stats = SweepStats::default();

        for handle in handles {
            let mut session = handle.lock().await;

            if session.status == SessionStatus::Pending && now > session.expires_at {
                session.status = SessionStatus::Expired;
                if let Err(e) = self.persist_status(&session).await {
                    tracing::warn!(upload_id = %session.id, error = %e, "Failed to mark session expired");
                    continue;
                }
                tracing::debug!(upload_id = %session.id, file_name = %session.file_name, "Upload session expired");
                stats.expired += 1;
            }

            let purge = match session.status {
                SessionStatus::Cancelled | SessionStatus::Expired => true,
                SessionStatus::Completed => session
                    .completed_at
                    .map(|done| now > done + self.inner.ttl)
                    .unwrap_or(true),
                SessionStatus::Pending => false,
            };
            if !purge {
                continue;
            }

            if session.status != SessionStatus::Completed {
                if let Err(e) = self.inner.chunk_store.delete_session_chunks(session.id).await {
                    tracing::warn!(upload_id = %session.id, error = %e, "Failed to delete session chunks");
                    continue;
                }
            }
            if let Err(e) = self.repo().delete(session.id).await {
                tracing::warn!(upload_id = %session.id, error = %e, "Failed to purge session");
                continue;
            }

            let (id, hash) = (session.id, session.file_hash.clone());
            drop(session);
            self.unregister(id, &hash).await;
            stats.purged += 1;
        }

        if stats.expired > 0 || stats.purged > 0 {
            tracing::info!(
                expired = stats.expired,
                purged = stats.purged,
                "Swept upload sessions"
            );
        }

        stats
    }

    /// Start background cleanup task
    pub fn start_cleanup_task(self, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
