//! Sharebox
//!
//! Resumable, content-addressed chunked uploads: an axum server that stages
//! chunks durably and assembles them into shareable files, and an async
//! client that drives the upload with retries, pause, resume, and cancel.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod upload;
