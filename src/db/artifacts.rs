//! Artifact index database operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use super::parse_timestamp;
use crate::error::Result;

/// Finalized, shareable file
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArtifactRecord {
    pub code: String,
    pub file_hash: String,
    pub name: String,
    pub size: i64,
    pub storage_path: String,
    pub expire_value: i64,
    pub expire_style: String,
    pub expired_at: Option<String>,
    pub expired_count: i64,
    pub used_count: i64,
    pub upload_id: Option<String>,
    pub created_at: String,
}

impl ArtifactRecord {
    /// Past its deadline, or out of remaining retrievals
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.expired_count == 0 {
            return true;
        }

        match self.expired_at.as_deref().map(parse_timestamp) {
            Some(Ok(deadline)) => deadline < now,
            // Unreadable deadline is treated as lapsed
            Some(Err(_)) => true,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Artifact repository
pub struct ArtifactRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ArtifactRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Newest unexpired artifact with this content hash and size
    pub async fn find_by_hash(&self, file_hash: &str, size: u64) -> Result<Option<ArtifactRecord>> {
        let candidates = sqlx::query_as::<_, ArtifactRecord>(
            r#"
            SELECT code, file_hash, name, size, storage_path, expire_value, expire_style,
                   expired_at, expired_count, used_count, upload_id, created_at
            FROM artifacts
            WHERE file_hash = ? AND size = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(file_hash)
        .bind(size as i64)
        .fetch_all(self.pool)
        .await?;

        let now = Utc::now();
        Ok(candidates.into_iter().find(|a| !a.is_expired_at(now)))
    }

    /// Get an artifact by share code
    pub async fn get(&self, code: &str) -> Result<Option<ArtifactRecord>> {
        let artifact = sqlx::query_as::<_, ArtifactRecord>(
            r#"
            SELECT code, file_hash, name, size, storage_path, expire_value, expire_style,
                   expired_at, expired_count, used_count, upload_id, created_at
            FROM artifacts
            WHERE code = ?
            "#,
        )
        .bind(code)
        .fetch_optional(self.pool)
        .await?;

        Ok(artifact)
    }

    /// Check whether a share code is taken
    pub async fn code_exists(&self, code: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artifacts WHERE code = ?")
            .bind(code)
            .fetch_one(self.pool)
            .await?;

        Ok(count > 0)
    }

    /// Insert a new artifact
    pub async fn insert(&self, artifact: &ArtifactRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO artifacts (code, file_hash, name, size, storage_path, expire_value,
                                   expire_style, expired_at, expired_count, used_count,
                                   upload_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&artifact.code)
        .bind(&artifact.file_hash)
        .bind(&artifact.name)
        .bind(artifact.size)
        .bind(&artifact.storage_path)
        .bind(artifact.expire_value)
        .bind(&artifact.expire_style)
        .bind(&artifact.expired_at)
        .bind(artifact.expired_count)
        .bind(artifact.used_count)
        .bind(&artifact.upload_id)
        .bind(&artifact.created_at)
        .execute(self.pool)
        .await?;

        Ok(())
    }
}
