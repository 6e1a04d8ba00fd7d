//! Chunked Upload Module
//!
//! Implements resumable large file uploads with:
//! - SHA-256 content hashing for whole-file deduplication
//! - Idempotent per-index chunk writes with conflict detection
//! - Durable sessions that survive restarts
//! - Server-side reassembly into a shareable artifact
//!
//! Protocol Flow:
//! 1. Client hashes the file and sends Init
//! 2. Server answers with an existing share code (dedup), or a fresh or
//!    resumed session listing the chunks it already holds
//! 3. Client uploads only the missing chunks
//! 4. Client sends Complete; server assembles, verifies, and returns a code

pub mod bitmap;
pub mod chunk_store;
pub mod coordinator;
pub mod deduplication;
pub mod expiry;
pub mod session;
pub mod types;

pub use bitmap::ChunkBitmap;
pub use chunk_store::{compute_hash, ChunkStore};
pub use coordinator::TransferCoordinator;
pub use deduplication::DeduplicationService;
pub use expiry::{ExpirePolicy, ExpireStyle};
pub use session::{SessionManager, SweepStats};
pub use types::*;
