//! HTTP transport over reqwest

use reqwest::multipart::{Form, Part};
use reqwest::Url;
use serde::de::DeserializeOwned;

use crate::upload::{
    ApiEnvelope, ChunkUploadResponse, CompleteRequest, CompleteResponse, ErrorDetail, InitRequest,
    InitResponse, StatusResponse, VerifyRequest, VerifyResponse,
};

use super::error::ClientError;
use super::transport::UploadTransport;

#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: &str, http: reqwest::Client) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url).map_err(|e| ClientError::InvalidState(format!(
            "invalid server URL {base_url:?}: {e}"
        )))?;
        Ok(Self { http, base_url })
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::InvalidState(format!("failed to build API URL: {e}")))
    }

    /// Send a request and unwrap the `{code, message, detail}` envelope
    async fn send_envelope<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<Option<T>, ClientError> {
        let response = req.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let envelope = serde_json::from_str::<ApiEnvelope<ErrorDetail>>(&body).ok();
            let (detail, message) = match envelope {
                Some(env) => (env.detail, env.message),
                None => (None, body),
            };
            return Err(ClientError::from_server(status.as_u16(), detail, message));
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&body).map_err(|e| {
            ClientError::Protocol {
                status: status.as_u16(),
                kind: "MALFORMED_RESPONSE".to_string(),
                message: e.to_string(),
            }
        })?;

        if !envelope.is_success() {
            return Err(ClientError::from_server(envelope.code, None, envelope.message));
        }

        Ok(envelope.detail)
    }

    async fn send_detail<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, ClientError> {
        self.send_envelope(req).await?.ok_or_else(|| ClientError::Protocol {
            status: 200,
            kind: "MALFORMED_RESPONSE".to_string(),
            message: "response envelope has no detail".to_string(),
        })
    }
}

#[async_trait::async_trait]
impl UploadTransport for HttpTransport {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, ClientError> {
        let url = self.url("/chunk/upload/init/")?;
        self.send_detail(self.http.post(url).json(request)).await
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        index: usize,
        data: Vec<u8>,
    ) -> Result<ChunkUploadResponse, ClientError> {
        let url = self.url(&format!("/chunk/upload/chunk/{upload_id}/{index}"))?;
        let form = Form::new().part("chunk", Part::bytes(data).file_name("blob"));
        self.send_detail(self.http.post(url).multipart(form)).await
    }

    async fn complete(
        &self,
        upload_id: &str,
        request: &CompleteRequest,
    ) -> Result<CompleteResponse, ClientError> {
        let url = self.url(&format!("/chunk/upload/complete/{upload_id}"))?;
        self.send_detail(self.http.post(url).json(request)).await
    }

    async fn status(&self, upload_id: &str) -> Result<StatusResponse, ClientError> {
        let url = self.url(&format!("/chunk/upload/status/{upload_id}"))?;
        self.send_detail(self.http.get(url)).await
    }

    async fn cancel(&self, upload_id: &str) -> Result<(), ClientError> {
        let url = self.url(&format!("/chunk/upload/cancel/{upload_id}"))?;
        self.send_envelope::<serde_json::Value>(self.http.delete(url)).await?;
        Ok(())
    }

    async fn verify(&self, upload_id: &str, index: usize, chunk_hash: &str) -> Result<bool, ClientError> {
        let url = self.url(&format!("/chunk/upload/verify/{upload_id}/{index}"))?;
        let request = VerifyRequest {
            chunk_hash: chunk_hash.to_string(),
        };
        let response: VerifyResponse = self.send_detail(self.http.post(url).json(&request)).await?;
        Ok(response.valid)
    }
}
