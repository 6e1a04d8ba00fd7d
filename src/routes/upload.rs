//! Upload Routes
//!
//! HTTP endpoints for the resumable chunked upload protocol.
//!
//! Endpoints (nested under `/chunk/upload`):
//! - POST /init/ - Start, resume, or dedup an upload
//! - POST /chunk/:upload_id/:index - Upload a chunk (raw body or multipart `chunk`)
//! - POST /complete/:upload_id - Assemble and publish the file
//! - GET /status/:upload_id - Get session status
//! - DELETE /cancel/:upload_id - Cancel upload
//! - POST /verify/:upload_id/:index - Compare a chunk digest

use axum::{
    async_trait,
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Request, State},
    http::header,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};

use crate::state::AppState;
use crate::upload::{
    ApiEnvelope, ChunkUploadResponse, CompleteRequest, CompleteResponse, InitRequest,
    InitResponse, StatusResponse, UploadError, VerifyRequest, VerifyResponse,
};

/// Room for multipart framing around a chunk
const MULTIPART_OVERHEAD: usize = 64 * 1024;

type ApiResult<T> = Result<Json<ApiEnvelope<T>>, UploadError>;

// ============================================================================
// Error Response
// ============================================================================

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "Upload request failed");
        } else {
            tracing::debug!(error = %self, kind = self.kind(), "Upload request rejected");
        }

        let body = Json(ApiEnvelope {
            code: status.as_u16(),
            message: self.to_string(),
            detail: Some(self.detail()),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Chunk Body Extractor
// ============================================================================

/// Chunk bytes, taken from multipart field `chunk` or the raw body
pub struct ChunkPayload(pub Bytes);

#[async_trait]
impl<S> FromRequest<S> for ChunkPayload
where
    S: Send + Sync,
{
    type Rejection = UploadError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_multipart = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("multipart/form-data"));

        if !is_multipart {
            let body = Bytes::from_request(req, state)
                .await
                .map_err(|e| UploadError::InvalidRequest(e.body_text()))?;
            return Ok(Self(body));
        }

        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(|e| UploadError::InvalidRequest(e.body_text()))?;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| UploadError::InvalidRequest(e.body_text()))?
        {
            if field.name() == Some("chunk") {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| UploadError::InvalidRequest(e.body_text()))?;
                return Ok(Self(data));
            }
        }

        Err(UploadError::InvalidRequest(
            "multipart body has no `chunk` field".to_string(),
        ))
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router(max_chunk_size: u64) -> Router<AppState> {
    let body_limit = usize::try_from(max_chunk_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/init/", post(init))
        .route("/chunk/:upload_id/:index", post(upload_chunk))
        .route("/complete/:upload_id", post(complete))
        .route("/status/:upload_id", get(status))
        .route("/cancel/:upload_id", delete(cancel))
        .route("/verify/:upload_id/:index", post(verify))
        .layer(DefaultBodyLimit::max(body_limit))
}

fn parse_index(raw: &str) -> Result<usize, UploadError> {
    raw.parse()
        .map_err(|_| UploadError::InvalidRequest(format!("invalid chunk index: {raw:?}")))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /chunk/upload/init/
async fn init(State(state): State<AppState>, Json(request): Json<InitRequest>) -> ApiResult<InitResponse> {
    let response = state.coordinator().init(request).await?;
    Ok(Json(ApiEnvelope::success(response)))
}

/// POST /chunk/upload/chunk/:upload_id/:index
async fn upload_chunk(
    State(state): State<AppState>,
    Path((upload_id, index)): Path<(String, String)>,
    ChunkPayload(data): ChunkPayload,
) -> ApiResult<ChunkUploadResponse> {
    let index = parse_index(&index)?;
    let response = state.coordinator().upload_chunk(&upload_id, index, &data).await?;
    Ok(Json(ApiEnvelope::success(response)))
}

/// POST /chunk/upload/complete/:upload_id
async fn complete(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<CompleteResponse> {
    let response = state.coordinator().complete(&upload_id, &request).await?;
    Ok(Json(ApiEnvelope::success(response)))
}

/// GET /chunk/upload/status/:upload_id
async fn status(State(state): State<AppState>, Path(upload_id): Path<String>) -> ApiResult<StatusResponse> {
    let response = state.coordinator().status(&upload_id).await?;
    Ok(Json(ApiEnvelope::success(response)))
}

/// DELETE /chunk/upload/cancel/:upload_id
async fn cancel(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.coordinator().cancel(&upload_id).await?;
    Ok(Json(ApiEnvelope::ack("upload cancelled")))
}

/// POST /chunk/upload/verify/:upload_id/:index
async fn verify(
    State(state): State<AppState>,
    Path((upload_id, index)): Path<(String, String)>,
    Json(request): Json<VerifyRequest>,
) -> ApiResult<VerifyResponse> {
    let index = parse_index(&index)?;
    let valid = state
        .coordinator()
        .verify(&upload_id, index, &request.chunk_hash)
        .await?;
    Ok(Json(ApiEnvelope::success(VerifyResponse { valid })))
}
