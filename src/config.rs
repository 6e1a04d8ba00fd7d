//! Configuration management for the Sharebox server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Local directory holding chunk spools and assembled files
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub base_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Limits and housekeeping for the chunked upload protocol
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Largest file accepted by Init, in bytes
    pub max_file_size: u64,

    /// Smallest chunk size a client may declare
    pub min_chunk_size: u64,

    /// Largest chunk size a client may declare (also bounds request bodies)
    pub max_chunk_size: u64,

    /// Lifetime of a pending session, measured from its creation
    pub session_ttl_hours: i64,

    /// How often the expiry sweeper runs
    pub sweep_interval_secs: u64,

    /// Entries kept in the deduplication lookup cache
    pub dedup_cache_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            max_file_size: 10 * GIB,
            min_chunk_size: 64 * KIB,
            max_chunk_size: 100 * MIB,
            session_ttl_hours: 24,
            sweep_interval_secs: 300,
            dedup_cache_size: 1024,
        }
    }
}

impl UploadConfig {
    /// Reject combinations the coordinator cannot honour
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.min_chunk_size == 0 {
            problems.push("minimum chunk size must be positive".to_string());
        }
        if self.min_chunk_size > self.max_chunk_size {
            problems.push(format!(
                "minimum chunk size {} exceeds maximum {}",
                self.min_chunk_size, self.max_chunk_size
            ));
        }
        if self.max_file_size == 0 {
            problems.push("maximum file size must be positive".to_string());
        }
        if self.session_ttl_hours <= 0 {
            problems.push("session TTL must be at least one hour".to_string());
        }
        if self.sweep_interval_secs == 0 {
            problems.push("sweep interval must be positive".to_string());
        }
        if self.dedup_cache_size == 0 {
            problems.push("dedup cache size must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(AppError::Config(problems.join("; ")))
        }
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_ttl_hours)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 12345,
            },
            storage: StorageConfig {
                base_path: PathBuf::from("./data"),
            },
            database: DatabaseConfig {
                url: "sqlite:./data/sharebox.db".to_string(),
            },
            upload: UploadConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
            },
            storage: StorageConfig {
                base_path: env::var("STORAGE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.base_path),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            upload: UploadConfig {
                max_file_size: parse_var("UPLOAD_MAX_FILE_SIZE", defaults.upload.max_file_size)?,
                min_chunk_size: parse_var("UPLOAD_MIN_CHUNK_SIZE", defaults.upload.min_chunk_size)?,
                max_chunk_size: parse_var("UPLOAD_MAX_CHUNK_SIZE", defaults.upload.max_chunk_size)?,
                session_ttl_hours: parse_var(
                    "UPLOAD_SESSION_TTL_HOURS",
                    defaults.upload.session_ttl_hours,
                )?,
                sweep_interval_secs: parse_var(
                    "UPLOAD_SWEEP_INTERVAL_SECS",
                    defaults.upload.sweep_interval_secs,
                )?,
                dedup_cache_size: parse_var(
                    "UPLOAD_DEDUP_CACHE_SIZE",
                    defaults.upload.dedup_cache_size,
                )?,
            },
        };

        config.upload.validate()?;
        Ok(config)
    }
}

/// Read an optional variable, falling back to `default` when unset
fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{name} has an invalid value: {raw:?}"))),
        Err(_) => Ok(default),
    }
}
