//! Chunk Store
//!
//! Durable staging for uploaded chunks before assembly, plus assembly of a
//! session's chunks into its final file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::types::UploadError;

// ============================================================================
// Types
// ============================================================================

/// A chunk that has been durably written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub hash: String,
    pub size: u64,
}

/// Result of assembling a session's chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFile {
    /// Path relative to the storage root
    pub relative_path: String,
    pub size: u64,
    /// SHA-256 of the assembled bytes
    pub hash: String,
}

// ============================================================================
// Chunk Storage Trait
// ============================================================================

/// Trait for chunk storage backends
#[async_trait::async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Durably write a chunk, replacing any partial write at the same index
    async fn write_chunk(
        &self,
        session_id: Uuid,
        chunk_index: usize,
        data: &[u8],
    ) -> Result<(), UploadError>;

    /// Read a chunk back
    async fn read_chunk(&self, session_id: Uuid, chunk_index: usize) -> Result<Vec<u8>, UploadError>;

    /// Delete all chunks for a session
    async fn delete_session_chunks(&self, session_id: Uuid) -> Result<usize, UploadError>;

    /// Concatenate chunks `0..chunk_count` into a final file named after `file_name`
    async fn assemble(
        &self,
        session_id: Uuid,
        chunk_count: usize,
        file_name: &str,
    ) -> Result<AssembledFile, UploadError>;

    /// Remove an assembled file that will not be published
    async fn remove_file(&self, relative_path: &str) -> Result<(), UploadError>;
}

// ============================================================================
// Chunk Store
// ============================================================================

/// Chunk store over a pluggable backend
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    backend: Box<dyn ChunkStorage>,
}

impl ChunkStore {
    /// Create with local filesystem storage rooted at `base_path`
    pub fn with_local_storage(base_path: PathBuf) -> Self {
        Self::with_backend(Box::new(LocalChunkStorage::new(base_path)))
    }

    pub fn with_backend(backend: Box<dyn ChunkStorage>) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner { backend }),
        }
    }

    /// Hash and durably store a chunk
    pub async fn store_chunk(
        &self,
        session_id: Uuid,
        chunk_index: usize,
        data: &[u8],
    ) -> Result<StoredChunk, UploadError> {
        let hash = compute_hash(data);
        self.inner.backend.write_chunk(session_id, chunk_index, data).await?;

        tracing::debug!(
            session_id = %session_id,
            chunk_index = chunk_index,
            size = data.len(),
            "Chunk stored"
        );

        Ok(StoredChunk {
            hash,
            size: data.len() as u64,
        })
    }

    /// Delete all chunks for a session
    pub async fn delete_session_chunks(&self, session_id: Uuid) -> Result<usize, UploadError> {
        self.inner.backend.delete_session_chunks(session_id).await
    }

    /// Assemble chunks into the final file
    pub async fn assemble_chunks(
        &self,
        session_id: Uuid,
        chunk_count: usize,
        file_name: &str,
    ) -> Result<AssembledFile, UploadError> {
        self.inner.backend.assemble(session_id, chunk_count, file_name).await
    }

    /// Best-effort removal of an assembled file
    pub async fn discard_file(&self, relative_path: &str) {
        if let Err(e) = self.inner.backend.remove_file(relative_path).await {
            tracing::warn!(path = %relative_path, error = %e, "Failed to remove assembled file");
        }
    }
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem chunk storage
///
/// Chunks live at `chunks/<session>/<index>.chunk`; assembled files at
/// `files/<yyyy>/<mm>/<dd>/<uuid>-<name>`.
pub struct LocalChunkStorage {
    base_path: PathBuf,
}

impl LocalChunkStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn session_dir(&self, session_id: Uuid) -> PathBuf {
        self.base_path.join("chunks").join(session_id.to_string())
    }

    fn chunk_path(&self, session_id: Uuid, chunk_index: usize) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{:08}.chunk", chunk_index))
    }
}

fn storage_err(e: std::io::Error) -> UploadError {
    UploadError::Storage(e.to_string())
}

#[async_trait::async_trait]
impl ChunkStorage for LocalChunkStorage {
    async fn write_chunk(
        &self,
        session_id: Uuid,
        chunk_index: usize,
        data: &[u8],
    ) -> Result<(), UploadError> {
        let path = self.chunk_path(session_id, chunk_index);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(storage_err)?;
        }

        // Write aside then rename, so a crash never leaves a torn chunk in place
        let partial = path.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await.map_err(storage_err)?;
        file.write_all(data).await.map_err(storage_err)?;
        file.sync_all().await.map_err(storage_err)?;
        drop(file);

        tokio::fs::rename(&partial, &path).await.map_err(storage_err)?;
        Ok(())
    }

    async fn read_chunk(&self, session_id: Uuid, chunk_index: usize) -> Result<Vec<u8>, UploadError> {
        let path = self.chunk_path(session_id, chunk_index);
        tokio::fs::read(&path)
            .await
            .map_err(|e| UploadError::Storage(format!("Failed to read chunk {}: {}", chunk_index, e)))
    }

    async fn delete_session_chunks(&self, session_id: Uuid) -> Result<usize, UploadError> {
        let session_dir = self.session_dir(session_id);

        if !session_dir.exists() {
            return Ok(0);
        }

        let mut count = 0;
        let mut entries = tokio::fs::read_dir(&session_dir).await.map_err(storage_err)?;

        while let Some(entry) = entries.next_entry().await.map_err(storage_err)? {
            tokio::fs::remove_file(entry.path()).await.map_err(storage_err)?;
            count += 1;
        }

        let _ = tokio::fs::remove_dir(&session_dir).await;

        Ok(count)
    }

    async fn assemble(
        &self,
        session_id: Uuid,
        chunk_count: usize,
        file_name: &str,
    ) -> Result<AssembledFile, UploadError> {
        let now = Utc::now();
        let relative = Path::new("files")
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()))
            .join(format!("{:02}", now.day()))
            .join(format!("{}-{}", Uuid::new_v4(), sanitize_file_name(file_name)));
        let dest = self.base_path.join(&relative);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(storage_err)?;
        }

        let mut output = tokio::fs::File::create(&dest).await.map_err(storage_err)?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;

        for index in 0..chunk_count {
            let chunk = match self.read_chunk(session_id, index).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(output);
                    let _ = tokio::fs::remove_file(&dest).await;
                    return Err(e);
                }
            };
            hasher.update(&chunk);
            output.write_all(&chunk).await.map_err(storage_err)?;
            size += chunk.len() as u64;
        }

        output.sync_all().await.map_err(storage_err)?;

        Ok(AssembledFile {
            relative_path: relative.to_string_lossy().replace('\\', "/"),
            size,
            hash: hex::encode(hasher.finalize()),
        })
    }

    async fn remove_file(&self, relative_path: &str) -> Result<(), UploadError> {
        tokio::fs::remove_file(self.base_path.join(relative_path))
            .await
            .map_err(storage_err)
    }
}

/// Strip directory components and separators from a client-supplied name
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    match base {
        "" | "." | ".." => "file".to_string(),
        other => other.to_string(),
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Compute SHA-256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ============================================================================
// Tests
// ============================================================================
