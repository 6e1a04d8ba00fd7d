//! Reading the local file being uploaded

use std::io::{Read, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::error::ClientError;

const HASH_BUFFER_SIZE: usize = 8192;

/// Whole-file SHA-256 on a blocking thread.
///
/// Returns `Ok(None)` if `cancel` is raised before hashing finishes.
pub async fn hash_file(path: &Path, cancel: Arc<AtomicBool>) -> Result<Option<String>, ClientError> {
    let path: PathBuf = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<Option<String>, ClientError> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; HASH_BUFFER_SIZE];

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(Some(hex::encode(hasher.finalize())))
    })
    .await
    .map_err(|e| ClientError::InvalidState(format!("hashing task failed: {e}")))?
}

/// Read `len` bytes starting at `offset`
pub async fn read_range(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>, ClientError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
