//! Client error types

use thiserror::Error;

use crate::upload::ErrorDetail;

/// Coarse classification of a [`ClientError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NetworkFailure,
    ChunkConflict,
    SessionNotFound,
    NoActiveSession,
    IncompleteUpload,
    RetriesExhausted,
    Unauthorized,
    Cancelled,
    InvalidState,
    Protocol,
    Io,
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure, timeout, or server-side (5xx) fault
    #[error("network failure: {0}")]
    Network(String),

    #[error("chunk conflict: {0}")]
    ChunkConflict(String),

    #[error("upload session not found: {0}")]
    SessionNotFound(String),

    #[error("no active upload session")]
    NoActiveSession,

    #[error("upload incomplete, missing chunks: {0:?}")]
    IncompleteUpload(Vec<usize>),

    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        index: usize,
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("upload cancelled")]
    Cancelled,

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Server rejected the request for a reason the client cannot recover from
    #[error("server rejected request ({status} {kind}): {message}")]
    Protocol {
        status: u16,
        kind: String,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::NetworkFailure,
            Self::ChunkConflict(_) => ErrorKind::ChunkConflict,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::NoActiveSession => ErrorKind::NoActiveSession,
            Self::IncompleteUpload(_) => ErrorKind::IncompleteUpload,
            Self::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Only network failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Classify a rejected request from its HTTP status and envelope detail
    ///
    /// Expired and cancelled sessions read as `SessionNotFound`: either way
    /// the client has to start over with a fresh init.
    pub fn from_server(status: u16, detail: Option<ErrorDetail>, message: String) -> Self {
        let (kind, missing) = match detail {
            Some(detail) => (Some(detail.error), detail.missing_chunks),
            None => (None, None),
        };

        match (status, kind.as_deref()) {
            (401 | 403, _) => Self::Unauthorized(message),
            (408 | 429, _) | (500..=599, _) => Self::Network(format!("HTTP {status}: {message}")),
            (_, Some("CHUNK_CONFLICT")) => Self::ChunkConflict(message),
            (_, Some("SESSION_NOT_FOUND" | "SESSION_EXPIRED" | "SESSION_CANCELLED")) => {
                Self::SessionNotFound(message)
            }
            (_, Some("INCOMPLETE_UPLOAD")) => Self::IncompleteUpload(missing.unwrap_or_default()),
            (_, kind) => Self::Protocol {
                status,
                kind: kind.unwrap_or("UNKNOWN").to_string(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}
