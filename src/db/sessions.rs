//! Upload session database operations

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::parse_timestamp;
use crate::error::{AppError, Result};
use crate::upload::{ChunkBitmap, SessionStatus, UploadSession};

/// Upload session record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_hash: String,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub status: String,
    pub share_code: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub expires_at: String,
}

/// Received chunk record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChunkRow {
    pub upload_id: String,
    pub chunk_index: i64,
    pub chunk_hash: String,
    pub chunk_size: i64,
    pub received_at: String,
}

impl SessionRow {
    /// Rebuild the in-memory session from its row and its received chunks
    pub fn into_session(self, chunks: Vec<ChunkRow>) -> Result<UploadSession> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| AppError::Internal(format!("invalid session id {:?}: {e}", self.id)))?;
        let status: SessionStatus = self
            .status
            .parse()
            .map_err(|e: crate::upload::UploadError| AppError::Internal(e.to_string()))?;
        let total_chunks = self.total_chunks as usize;

        let mut received = ChunkBitmap::new(total_chunks);
        let mut chunk_hashes = HashMap::with_capacity(chunks.len());
        for chunk in chunks {
            let index = chunk.chunk_index as usize;
            if received.insert(index) {
                chunk_hashes.insert(index, chunk.chunk_hash);
            }
        }

        Ok(UploadSession {
            id,
            file_name: self.file_name,
            file_size: self.file_size as u64,
            file_hash: self.file_hash,
            chunk_size: self.chunk_size as u64,
            total_chunks,
            received,
            chunk_hashes,
            status,
            share_code: self.share_code,
            created_at: parse_timestamp(&self.created_at)?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
            expires_at: parse_timestamp(&self.expires_at)?,
        })
    }
}

/// Session repository
pub struct SessionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SessionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a newly created session
    pub async fn insert(&self, session: &UploadSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (id, file_name, file_size, file_hash, chunk_size,
                                         total_chunks, status, share_code, created_at,
                                         completed_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id.to_string())
        .bind(&session.file_name)
        .bind(session.file_size as i64)
        .bind(&session.file_hash)
        .bind(session.chunk_size as i64)
        .bind(session.total_chunks as i64)
        .bind(session.status.as_str())
        .bind(&session.share_code)
        .bind(session.created_at.to_rfc3339())
        .bind(session.completed_at.map(|t| t.to_rfc3339()))
        .bind(session.expires_at.to_rfc3339())
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Record a durably stored chunk. Repeats are ignored.
    pub async fn record_chunk(
        &self,
        upload_id: Uuid,
        index: usize,
        hash: &str,
        size: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_chunks (upload_id, chunk_index, chunk_hash, chunk_size, received_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(upload_id, chunk_index) DO NOTHING
            "#,
        )
        .bind(upload_id.to_string())
        .bind(index as i64)
        .bind(hash)
        .bind(size as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Update status (and share code once completed)
    pub async fn update_status(
        &self,
        upload_id: Uuid,
        status: SessionStatus,
        share_code: Option<&str>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE upload_sessions
            SET status = ?, share_code = COALESCE(?, share_code),
                completed_at = COALESCE(?, completed_at)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(share_code)
        .bind(completed_at.map(|t| t.to_rfc3339()))
        .bind(upload_id.to_string())
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Delete a session and its chunk records
    pub async fn delete(&self, upload_id: Uuid) -> Result<()> {
        let id = upload_id.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM session_chunks WHERE upload_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Load every persisted session, used to restore state on startup
    pub async fn load_all(&self) -> Result<Vec<UploadSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, file_name, file_size, file_hash, chunk_size, total_chunks,
                   status, share_code, created_at, completed_at, expires_at
            FROM upload_sessions
            ORDER BY created_at
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        let chunks = sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT upload_id, chunk_index, chunk_hash, chunk_size, received_at
            FROM session_chunks
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        let mut by_session: HashMap<String, Vec<ChunkRow>> = HashMap::new();
        for chunk in chunks {
            by_session
                .entry(chunk.upload_id.clone())
                .or_default()
                .push(chunk);
        }

        rows.into_iter()
            .map(|row| {
                let chunks = by_session.remove(&row.id).unwrap_or_default();
                row.into_session(chunks)
            })
            .collect()
    }
}
