//! Resumable Upload Client
//!
//! Drives the chunked upload protocol from the sending side:
//! - Hashes the file and asks the server whether it already has it
//! - Uploads only the chunks the server is missing, retrying transient failures
//! - Pauses, resumes (also across process restarts), and cancels
//!
//! The protocol is reached through [`UploadTransport`]; [`HttpTransport`] speaks
//! the JSON envelope API over HTTP.

pub mod error;
pub mod http;
pub mod progress;
pub mod source;
pub mod transport;
pub mod uploader;

pub use error::{ClientError, ErrorKind};
pub use http::HttpTransport;
pub use progress::{Phase, ProgressCallback, ProgressEvent};
pub use transport::UploadTransport;
pub use uploader::{
    CompletionMode, ResumableUploader, UploadOutcome, UploadResult, UploadState, UploaderConfig,
};
