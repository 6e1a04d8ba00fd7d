//! Upload types for the chunked upload protocol

use std::collections::HashMap;
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bitmap::ChunkBitmap;

// ============================================================================
// Constants
// ============================================================================

/// Default chunk size: 1MB
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Envelope code for a successful response
pub const SUCCESS_CODE: u16 = 200;

// ============================================================================
// Envelope
// ============================================================================

/// Uniform response envelope: `{code, message, detail}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiEnvelope<T> {
    pub code: u16,

    #[serde(default)]
    pub message: String,

    #[serde(default, alias = "data", skip_serializing_if = "Option::is_none")]
    pub detail: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn success(detail: T) -> Self {
        Self {
            code: SUCCESS_CODE,
            message: "success".to_string(),
            detail: Some(detail),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }
}

impl ApiEnvelope<serde_json::Value> {
    /// Success with a message and no payload
    pub fn ack(message: impl Into<String>) -> Self {
        Self {
            code: SUCCESS_CODE,
            message: message.into(),
            detail: None,
        }
    }
}

/// Detail carried by error envelopes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable machine-readable error kind
    pub error: String,

    /// Indices the server still needs, for `INCOMPLETE_UPLOAD`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_chunks: Option<Vec<usize>>,
}


// ============================================================================
// Init Types
// ============================================================================

/// Request to initiate (or resume) a chunked upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    /// Original file name
    pub file_name: String,

    /// Total file size in bytes
    pub file_size: u64,

    /// Chunk size the client will use
    pub chunk_size: u64,

    /// SHA-256 hash of the complete file
    pub file_hash: String,
}

/// Response to an init request
///
/// Either `{existed: true, file_code}` for a dedup hit, or the session shape
/// for a fresh or resumed upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitResponse {
    /// Whether this file already exists (instant upload)
    pub existed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<usize>,

    /// Indices the server already holds (authoritative)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_chunks: Option<Vec<usize>>,

    /// Percentage of chunks received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,

    /// Bytes already held by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_position: Option<u64>,
}

impl InitResponse {
    /// Dedup hit: the content is already stored under `code`
    pub fn existing(code: String) -> Self {
        Self {
            existed: true,
            file_code: Some(code),
            ..Self::default()
        }
    }

    /// Fresh or resumed session
    pub fn session(session: &UploadSession) -> Self {
        Self {
            existed: false,
            file_code: None,
            upload_id: Some(session.id.to_string()),
            chunk_size: Some(session.chunk_size),
            total_chunks: Some(session.total_chunks),
            uploaded_chunks: Some(session.uploaded_chunks()),
            progress: Some(session.progress()),
            resume_position: Some(session.resume_position()),
        }
    }
}

// ============================================================================
// Chunk / Complete / Status / Verify Types
// ============================================================================

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkUploadResponse {
    pub chunk_index: usize,

    /// SHA-256 of the accepted bytes
    pub chunk_hash: String,

    pub uploaded_count: usize,

    pub total_chunks: usize,

    pub progress: f64,
}

/// Request to finalize an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub expire_value: i64,
    pub expire_style: String,
}

/// Response after finalizing an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteResponse {
    /// Share code of the artifact
    pub code: String,

    /// File name of the artifact
    pub name: String,
}

/// Authoritative session status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub status: SessionStatus,
    pub total_chunks: usize,
    pub uploaded_chunks: Vec<usize>,
    #[serde(default)]
    pub missing_chunks: Vec<usize>,
    pub progress: f64,
    #[serde(default)]
    pub resume_position: u64,
}

impl StatusResponse {
    pub fn from_session(session: &UploadSession) -> Self {
        Self {
            upload_id: session.id.to_string(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            status: session.status,
            total_chunks: session.total_chunks,
            uploaded_chunks: session.uploaded_chunks(),
            missing_chunks: session.missing_chunks(),
            progress: session.progress(),
            resume_position: session.resume_position(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub chunk_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
}

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session ID
    pub id: Uuid,

    /// Original file name
    pub file_name: String,

    /// Declared file size in bytes
    pub file_size: u64,

    /// SHA-256 hash of complete file
    pub file_hash: String,

    /// Chunk size used for this upload
    pub chunk_size: u64,

    /// ceil(file_size / chunk_size)
    pub total_chunks: usize,

    /// Indices of chunks that have been received
    pub received: ChunkBitmap,

    /// Digest of each received chunk
    pub chunk_hashes: HashMap<usize, String>,

    /// Current status
    pub status: SessionStatus,

    /// Share code, memoized once the session completes
    pub share_code: Option<String>,

    pub created_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    pub expires_at: DateTime<Utc>,
}

/// What to do with an incoming chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDisposition {
    /// Not yet received; store it
    Store,
    /// Already received with identical bytes; nothing to do
    Duplicate,
}

impl UploadSession {
    /// Create a new upload session
    pub fn new(request: &InitRequest, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        let total_chunks = total_chunks_for(request.file_size, request.chunk_size);

        Self {
            id: Uuid::new_v4(),
            file_name: request.file_name.clone(),
            file_size: request.file_size,
            file_hash: request.file_hash.clone(),
            chunk_size: request.chunk_size,
            total_chunks,
            received: ChunkBitmap::new(total_chunks),
            chunk_hashes: HashMap::new(),
            status: SessionStatus::Pending,
            share_code: None,
            created_at: now,
            completed_at: None,
            expires_at: now + ttl,
        }
    }

    /// Check if session has expired
    pub fn is_expired(&self) -> bool {
        self.status == SessionStatus::Expired
            || (self.status == SessionStatus::Pending && Utc::now() > self.expires_at)
    }

    /// Check if all chunks have been received
    pub fn is_complete(&self) -> bool {
        self.received.is_full()
    }

    /// Whether an Init for `request` may resume this session
    pub fn matches(&self, request: &InitRequest) -> bool {
        self.status == SessionStatus::Pending
            && !self.is_expired()
            && self.file_hash == request.file_hash
            && self.file_size == request.file_size
            && self.chunk_size == request.chunk_size
    }

    /// Byte range of a chunk within the file
    pub fn chunk_range(&self, index: usize) -> Range<u64> {
        let start = index as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        start..end
    }

    /// Expected length of a chunk (the last one may be shorter)
    pub fn expected_chunk_len(&self, index: usize) -> u64 {
        let range = self.chunk_range(index);
        range.end - range.start
    }

    /// Decide whether a chunk should be stored, is a harmless repeat, or conflicts
    pub fn check_chunk(&self, index: usize, hash: &str) -> Result<ChunkDisposition, UploadError> {
        match self.chunk_hashes.get(&index) {
            Some(existing) if existing == hash => Ok(ChunkDisposition::Duplicate),
            Some(_) => Err(UploadError::ChunkConflict(index)),
            None if self.received.contains(index) => Err(UploadError::ChunkConflict(index)),
            None => Ok(ChunkDisposition::Store),
        }
    }

    /// Mark a chunk as received
    pub fn mark_chunk_received(&mut self, index: usize, hash: String) {
        if self.received.insert(index) {
            self.chunk_hashes.insert(index, hash);
        }
    }

    /// Indices of chunks received, ascending
    pub fn uploaded_chunks(&self) -> Vec<usize> {
        self.received.to_vec()
    }

    /// Get indices of chunks that still need to be uploaded
    pub fn missing_chunks(&self) -> Vec<usize> {
        self.received.missing().collect()
    }

    /// Calculate progress percentage
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        (self.received.count() as f64 / self.total_chunks as f64) * 100.0
    }

    /// Bytes held by the server for this session
    pub fn resume_position(&self) -> u64 {
        self.received
            .iter()
            .map(|i| self.expected_chunk_len(i))
            .sum()
    }
}

/// Number of chunks needed for `file_size` bytes
pub fn total_chunks_for(file_size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size) as usize
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting chunks
    Pending,
    /// Assembled into an artifact
    Completed,
    /// Cancelled by the client
    Cancelled,
    /// Abandoned past its TTL
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(UploadError::Internal(format!("unknown session status: {other}"))),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Session cancelled: {0}")]
    SessionCancelled(String),

    #[error("Session already completed: {0}")]
    SessionCompleted(String),

    #[error("Chunk index out of bounds: {index} (total chunks: {total})")]
    ChunkIndexOutOfBounds { index: usize, total: usize },

    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch { index: usize, expected: u64, actual: u64 },

    #[error("Chunk {0} was already received with different content")]
    ChunkConflict(usize),

    #[error("Upload incomplete, missing chunks: {0:?}")]
    IncompleteUpload(Vec<usize>),

    #[error("File hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Chunk size {size} outside allowed range {min}..={max}")]
    InvalidChunkSize { size: u64, min: u64, max: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid expiry policy: {0}")]
    InvalidExpirePolicy(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionExpired(_) => StatusCode::GONE,
            Self::SessionCancelled(_) => StatusCode::GONE,
            Self::SessionCompleted(_) => StatusCode::CONFLICT,
            Self::ChunkIndexOutOfBounds { .. } => StatusCode::BAD_REQUEST,
            Self::ChunkSizeMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::ChunkConflict(_) => StatusCode::CONFLICT,
            Self::IncompleteUpload(_) => StatusCode::BAD_REQUEST,
            Self::HashMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidChunkSize { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidExpirePolicy(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Envelope detail: the kind plus any data the client can act on
    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            error: self.kind().to_string(),
            missing_chunks: match self {
                Self::IncompleteUpload(missing) => Some(missing.clone()),
                _ => None,
            },
        }
    }

    /// Stable machine-readable kind, carried in error envelopes
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionExpired(_) => "SESSION_EXPIRED",
            Self::SessionCancelled(_) => "SESSION_CANCELLED",
            Self::SessionCompleted(_) => "SESSION_COMPLETED",
            Self::ChunkIndexOutOfBounds { .. } => "CHUNK_INDEX_OUT_OF_BOUNDS",
            Self::ChunkSizeMismatch { .. } => "CHUNK_SIZE_MISMATCH",
            Self::ChunkConflict(_) => "CHUNK_CONFLICT",
            Self::IncompleteUpload(_) => "INCOMPLETE_UPLOAD",
            Self::HashMismatch { .. } => "HASH_MISMATCH",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::InvalidChunkSize { .. } => "INVALID_CHUNK_SIZE",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidExpirePolicy(_) => "INVALID_EXPIRE_POLICY",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<crate::error::AppError> for UploadError {
    fn from(err: crate::error::AppError) -> Self {
        use crate::error::AppError;
        match err {
            AppError::Database(e) => Self::Database(e.to_string()),
            AppError::Io(e) => Self::Storage(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
