//! Deduplication Service
//!
//! Whole-file deduplication keyed by SHA-256 and size. A hit lets the client
//! skip the transfer entirely (instant upload). Lookups go through a bounded
//! LRU cache in front of the artifacts table.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use super::types::UploadError;
use crate::db::{ArtifactRecord, ArtifactRepository};

type CacheKey = (String, u64);

/// Used when the configured capacity is zero
const DEFAULT_CACHE_SIZE: usize = 1024;

// ============================================================================
// Deduplication Service
// ============================================================================

/// Service for detecting duplicate files
#[derive(Clone)]
pub struct DeduplicationService {
    inner: Arc<DeduplicationServiceInner>,
}

struct DeduplicationServiceInner {
    db: SqlitePool,

    /// (file hash, size) -> artifact
    file_cache: RwLock<LruCache<CacheKey, ArtifactRecord>>,
}

impl DeduplicationService {
    pub fn new(db: SqlitePool, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size)
            .or(NonZeroUsize::new(DEFAULT_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);

        Self {
            inner: Arc::new(DeduplicationServiceInner {
                db,
                file_cache: RwLock::new(LruCache::new(capacity)),
            }),
        }
    }

    /// Share code of an unexpired artifact with this content, if any
    pub async fn check_file_exists(
        &self,
        file_hash: &str,
        size: u64,
    ) -> Result<Option<String>, UploadError> {
        let key = (file_hash.to_string(), size);

        {
            let mut cache = self.inner.file_cache.write().await;
            let cached = cache
                .get(&key)
                .map(|artifact| (artifact.is_expired(), artifact.code.clone()));
            match cached {
                Some((false, code)) => {
                    tracing::debug!(file_hash = %file_hash, code = %code, "File found in cache");
                    return Ok(Some(code));
                }
                // Stale entry
                Some((true, _)) => {
                    cache.pop(&key);
                }
                None => {}
            }
        }

        let found = ArtifactRepository::new(&self.inner.db)
            .find_by_hash(file_hash, size)
            .await?;

        match found {
            Some(artifact) => {
                let code = artifact.code.clone();
                self.inner.file_cache.write().await.put(key, artifact);
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    /// Index a newly assembled artifact
    pub async fn register_file(&self, artifact: ArtifactRecord) -> Result<(), UploadError> {
        ArtifactRepository::new(&self.inner.db).insert(&artifact).await?;

        tracing::info!(
            file_hash = %artifact.file_hash,
            code = %artifact.code,
            size = artifact.size,
            "Registered artifact"
        );

        let key = (artifact.file_hash.clone(), artifact.size as u64);
        self.inner.file_cache.write().await.put(key, artifact);

        Ok(())
    }

    /// Check whether a share code is already in use
    pub async fn code_in_use(&self, code: &str) -> Result<bool, UploadError> {
        Ok(ArtifactRepository::new(&self.inner.db).code_exists(code).await?)
    }

    #[cfg(test)]
    async fn cached(&self) -> usize {
        self.inner.file_cache.read().await.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Utc;

    fn artifact(code: &str, expired_count: i64) -> ArtifactRecord {
        artifact_for(code, "f00d", expired_count)
    }

    fn artifact_for(code: &str, file_hash: &str, expired_count: i64) -> ArtifactRecord {
        ArtifactRecord {
            code: code.to_string(),
            file_hash: file_hash.to_string(),
            name: "a.txt".to_string(),
            size: 10,
            storage_path: "files/a.txt".to_string(),
            expire_value: 1,
            expire_style: "count".to_string(),
            expired_at: None,
            expired_count,
            used_count: 0,
            upload_id: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[tokio::test]
    async fn test_register_then_hit() {
        let pool = test_pool().await;
        let service = DeduplicationService::new(pool.clone(), 16);

        assert_eq!(service.check_file_exists("f00d", 10).await.unwrap(), None);

        service.register_file(artifact("abc", -1)).await.unwrap();
        assert_eq!(
            service.check_file_exists("f00d", 10).await.unwrap().as_deref(),
            Some("abc")
        );
        assert!(service.code_in_use("abc").await.unwrap());

        // Same hash, different size is not a duplicate
        assert_eq!(service.check_file_exists("f00d", 11).await.unwrap(), None);

        // Survives a cold cache
        let cold = DeduplicationService::new(pool, 16);
        assert!(cold.check_file_exists("f00d", 10).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_artifact_is_not_a_hit() {
        let service = DeduplicationService::new(test_pool().await, 16);

        service.register_file(artifact("gone", 0)).await.unwrap();
        assert_eq!(service.check_file_exists("f00d", 10).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let service = DeduplicationService::new(test_pool().await, 2);

        for (code, hash) in [("a1", "aa"), ("b2", "bb"), ("c3", "cc")] {
            service.register_file(artifact_for(code, hash, -1)).await.unwrap();
        }
        assert_eq!(service.cached().await, 2);

        // Evicted entries are still found in the database
        assert_eq!(
            service.check_file_exists("aa", 10).await.unwrap().as_deref(),
            Some("a1")
        );
        assert_eq!(service.cached().await, 2);
    }
}
