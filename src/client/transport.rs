//! Transport seam between the uploader and the server

use crate::upload::{
    ChunkUploadResponse, CompleteRequest, CompleteResponse, InitRequest, InitResponse,
    StatusResponse,
};

use super::error::ClientError;

/// The six protocol operations, independent of how they reach the server
#[async_trait::async_trait]
pub trait UploadTransport: Send + Sync {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, ClientError>;

    async fn upload_chunk(
        &self,
        upload_id: &str,
        index: usize,
        data: Vec<u8>,
    ) -> Result<ChunkUploadResponse, ClientError>;

    async fn complete(
        &self,
        upload_id: &str,
        request: &CompleteRequest,
    ) -> Result<CompleteResponse, ClientError>;

    async fn status(&self, upload_id: &str) -> Result<StatusResponse, ClientError>;

    async fn cancel(&self, upload_id: &str) -> Result<(), ClientError>;

    async fn verify(&self, upload_id: &str, index: usize, chunk_hash: &str) -> Result<bool, ClientError>;
}
