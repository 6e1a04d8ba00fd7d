//! Integration tests for the chunked upload HTTP API.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{chunk_request, json_request, send, sha256_hex, test_content, TestServer};
use serde_json::{json, Value};

const CHUNK: usize = 1024;

fn init_body(data: &[u8]) -> Value {
    json!({
        "file_name": "file.bin",
        "file_size": data.len(),
        "chunk_size": CHUNK,
        "file_hash": sha256_hex(data),
    })
}

async fn init(server: &TestServer, data: &[u8]) -> Value {
    let (status, body) = json_request(&server.router, "POST", "/chunk/upload/init/", Some(init_body(data))).await;
    assert_eq!(status, StatusCode::OK, "init failed: {body}");
    assert_eq!(body["code"], 200);
    body["detail"].clone()
}

async fn upload_all(server: &TestServer, upload_id: &str, data: &[u8]) {
    for (index, chunk) in data.chunks(CHUNK).enumerate() {
        let (status, body) = chunk_request(&server.router, upload_id, index, chunk).await;
        assert_eq!(status, StatusCode::OK, "chunk {index} failed: {body}");
    }
}

async fn complete(server: &TestServer, upload_id: &str) -> (StatusCode, Value) {
    json_request(
        &server.router,
        "POST",
        &format!("/chunk/upload/complete/{upload_id}"),
        Some(json!({"expire_value": 7, "expire_style": "day"})),
    )
    .await
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::new().await;

    let (status, body) = json_request(&server.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "sharebox");
}

#[tokio::test]
async fn test_full_upload_flow() {
    let server = TestServer::new().await;
    let data = test_content(2500);

    let detail = init(&server, &data).await;
    assert_eq!(detail["existed"], false);
    assert_eq!(detail["total_chunks"], 3);
    assert_eq!(detail["uploaded_chunks"], json!([]));
    let upload_id = detail["upload_id"].as_str().unwrap().to_string();

    // Out of order is fine
    for index in [2usize, 0, 1] {
        let chunk = &data[index * CHUNK..((index + 1) * CHUNK).min(data.len())];
        let (status, body) = chunk_request(&server.router, &upload_id, index, chunk).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"]["chunk_index"], index);
        assert_eq!(body["detail"]["chunk_hash"], sha256_hex(chunk));
    }

    let (status, body) = complete(&server, &upload_id).await;
    assert_eq!(status, StatusCode::OK, "complete failed: {body}");
    assert_eq!(body["detail"]["name"], "file.bin");
    let code = body["detail"]["code"].as_str().unwrap().to_string();

    assert_eq!(server.artifact_bytes(&code).await, data);

    let (status, body) = json_request(
        &server.router,
        "GET",
        &format!("/chunk/upload/status/{upload_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["detail"]["status"], "completed");
    assert_eq!(body["detail"]["uploaded_chunks"], json!([0, 1, 2]));
}

#[tokio::test]
async fn test_repeated_chunk_is_idempotent() {
    let server = TestServer::new().await;
    let data = test_content(2 * CHUNK);
    let upload_id = init(&server, &data).await["upload_id"].as_str().unwrap().to_string();

    let (first_status, first) = chunk_request(&server.router, &upload_id, 0, &data[..CHUNK]).await;
    let (second_status, second) = chunk_request(&server.router, &upload_id, 0, &data[..CHUNK]).await;

    assert_eq!(first_status, StatusCode::OK);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(first["detail"]["uploaded_count"], 1);
    assert_eq!(second["detail"]["uploaded_count"], 1);
}

#[tokio::test]
async fn test_conflicting_chunk_is_rejected() {
    let server = TestServer::new().await;
    let data = test_content(2 * CHUNK);
    let upload_id = init(&server, &data).await["upload_id"].as_str().unwrap().to_string();

    chunk_request(&server.router, &upload_id, 0, &data[..CHUNK]).await;
    let (status, body) = chunk_request(&server.router, &upload_id, 0, &data[CHUNK..]).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], 409);
    assert_eq!(body["detail"]["error"], "CHUNK_CONFLICT");
}

#[tokio::test]
async fn test_chunk_bounds_and_length_are_checked() {
    let server = TestServer::new().await;
    let data = test_content(2 * CHUNK);
    let upload_id = init(&server, &data).await["upload_id"].as_str().unwrap().to_string();

    let (status, body) = chunk_request(&server.router, &upload_id, 2, &data[..CHUNK]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["error"], "CHUNK_INDEX_OUT_OF_BOUNDS");

    let (status, body) = chunk_request(&server.router, &upload_id, 0, &data[..10]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["error"], "CHUNK_SIZE_MISMATCH");

    let (status, body) = json_request(
        &server.router,
        "POST",
        &format!("/chunk/upload/chunk/{upload_id}/abc"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["error"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_multipart_chunk_upload() {
    let server = TestServer::new().await;
    let data = test_content(CHUNK);
    let upload_id = init(&server, &data).await["upload_id"].as_str().unwrap().to_string();

    let boundary = "sharebox-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n");
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(&data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let request = Request::builder()
        .method("POST")
        .uri(format!("/chunk/upload/chunk/{upload_id}/0"))
        .header("Content-Type", format!("multipart/form-data; boundary={boundary}"))
        .body(Body::from(body))
        .unwrap();

    let (status, body) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::OK, "multipart upload failed: {body}");
    assert_eq!(body["detail"]["chunk_hash"], sha256_hex(&data));
}

#[tokio::test]
async fn test_duplicate_content_is_instant() {
    let server = TestServer::new().await;
    let data = test_content(1500);

    let upload_id = init(&server, &data).await["upload_id"].as_str().unwrap().to_string();
    upload_all(&server, &upload_id, &data).await;
    let (_, body) = complete(&server, &upload_id).await;
    let code = body["detail"]["code"].as_str().unwrap().to_string();

    let detail = init(&server, &data).await;
    assert_eq!(detail["existed"], true);
    assert_eq!(detail["file_code"], code);
    assert!(detail.get("upload_id").is_none());
}

#[tokio::test]
async fn test_init_resumes_pending_session() {
    let server = TestServer::new().await;
    let data = test_content(3 * CHUNK);

    let first = init(&server, &data).await;
    let upload_id = first["upload_id"].as_str().unwrap().to_string();
    chunk_request(&server.router, &upload_id, 1, &data[CHUNK..2 * CHUNK]).await;

    let second = init(&server, &data).await;
    assert_eq!(second["upload_id"], upload_id);
    assert_eq!(second["uploaded_chunks"], json!([1]));
    assert_eq!(second["resume_position"], CHUNK);
}

#[tokio::test]
async fn test_complete_is_idempotent() {
    let server = TestServer::new().await;
    let data = test_content(2 * CHUNK + 7);
    let upload_id = init(&server, &data).await["upload_id"].as_str().unwrap().to_string();
    upload_all(&server, &upload_id, &data).await;

    let (_, first) = complete(&server, &upload_id).await;
    let (status, second) = complete(&server, &upload_id).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["detail"], second["detail"]);
}

#[tokio::test]
async fn test_incomplete_upload_cannot_complete() {
    let server = TestServer::new().await;
    let data = test_content(3 * CHUNK);
    let upload_id = init(&server, &data).await["upload_id"].as_str().unwrap().to_string();
    chunk_request(&server.router, &upload_id, 0, &data[..CHUNK]).await;

    let (status, body) = complete(&server, &upload_id).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["error"], "INCOMPLETE_UPLOAD");
    assert_eq!(body["detail"]["missing_chunks"], json!([1, 2]));
    assert!(body["message"].as_str().unwrap().contains("[1, 2]"));
}

#[tokio::test]
async fn test_invalid_expire_policy() {
    let server = TestServer::new().await;
    let data = test_content(CHUNK);
    let upload_id = init(&server, &data).await["upload_id"].as_str().unwrap().to_string();
    upload_all(&server, &upload_id, &data).await;

    let (status, body) = json_request(
        &server.router,
        "POST",
        &format!("/chunk/upload/complete/{upload_id}"),
        Some(json!({"expire_value": 1, "expire_style": "fortnight"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["error"], "INVALID_EXPIRE_POLICY");
}

#[tokio::test]
async fn test_cancel_and_reject_further_chunks() {
    let server = TestServer::new().await;
    let data = test_content(2 * CHUNK);
    let upload_id = init(&server, &data).await["upload_id"].as_str().unwrap().to_string();

    let uri = format!("/chunk/upload/cancel/{upload_id}");
    let (status, body) = json_request(&server.router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 200);

    // Cancelling twice is fine
    let (status, _) = json_request(&server.router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = chunk_request(&server.router, &upload_id, 0, &data[..CHUNK]).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["detail"]["error"], "SESSION_CANCELLED");

    // A new Init does not resume a cancelled session
    let detail = init(&server, &data).await;
    assert_ne!(detail["upload_id"], upload_id);
}

#[tokio::test]
async fn test_verify_chunk() {
    let server = TestServer::new().await;
    let data = test_content(2 * CHUNK);
    let upload_id = init(&server, &data).await["upload_id"].as_str().unwrap().to_string();
    chunk_request(&server.router, &upload_id, 0, &data[..CHUNK]).await;

    let verify = |index: usize, hash: String| {
        let router = server.router.clone();
        let uri = format!("/chunk/upload/verify/{upload_id}/{index}");
        async move { json_request(&router, "POST", &uri, Some(json!({"chunk_hash": hash}))).await }
    };

    let (status, body) = verify(0, sha256_hex(&data[..CHUNK])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["detail"]["valid"], true);

    let (_, body) = verify(0, sha256_hex(b"something else")).await;
    assert_eq!(body["detail"]["valid"], false);

    let (_, body) = verify(1, sha256_hex(&data[CHUNK..])).await;
    assert_eq!(body["detail"]["valid"], false);
}

#[tokio::test]
async fn test_unknown_session() {
    let server = TestServer::new().await;

    for uri in [
        "/chunk/upload/status/6f1c1d3e-0000-4000-8000-000000000000",
        "/chunk/upload/status/not-a-uuid",
    ] {
        let (status, body) = json_request(&server.router, "GET", uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
        assert_eq!(body["detail"]["error"], "SESSION_NOT_FOUND");
    }
}

#[tokio::test]
async fn test_init_validation() {
    let server = TestServer::new().await;

    let (status, body) = json_request(
        &server.router,
        "POST",
        "/chunk/upload/init/",
        Some(json!({
            "file_name": "file.bin",
            "file_size": 100,
            "chunk_size": 4,
            "file_hash": sha256_hex(b"x"),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["error"], "INVALID_CHUNK_SIZE");

    let (status, body) = json_request(
        &server.router,
        "POST",
        "/chunk/upload/init/",
        Some(json!({
            "file_name": "file.bin",
            "file_size": 100,
            "chunk_size": CHUNK,
            "file_hash": "not-hex",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["error"], "INVALID_REQUEST");
}
