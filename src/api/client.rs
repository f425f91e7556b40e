use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::error::ApiError;
use super::types::{StatusResponse, SubmitRequest, SubmitResponse};

/// The submission-side collaborator. The HTTP client is the production
/// implementation; tests and the demo inject in-process ones.
#[async_trait]
pub trait AssessmentApi: Send + Sync {
    async fn submit(&self, req: &SubmitRequest) -> Result<SubmitResponse, ApiError>;

    async fn status(&self, job_id: &str) -> Result<StatusResponse, ApiError>;
}

pub struct HttpAssessmentApi {
    token: String,
    client: Client,
    base_url: String,
}

impl HttpAssessmentApi {
    pub fn new(base_url: String, token: String, request_timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            token,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl AssessmentApi for HttpAssessmentApi {
    async fn submit(&self, req: &SubmitRequest) -> Result<SubmitResponse, ApiError> {
        debug!(key = %req.idempotency_key, label = %req.assessment_label, "POST /assessment/submit");
        let response = self
            .client
            .post(self.url("/assessment/submit"))
            .bearer_auth(&self.token)
            .header("idempotency-key", &req.idempotency_key)
            .json(req)
            .send()
            .await
            .map_err(map_transport)?;

        decode(response).await
    }

    async fn status(&self, job_id: &str) -> Result<StatusResponse, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/assessment/status/{job_id}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(map_transport)?;

        decode(response).await
    }
}

fn map_transport(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Network(err)
    }
}

pub(crate) async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(ApiError::from_status(status.as_u16(), message));
    }

    let body = response.bytes().await.map_err(map_transport)?;
    serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
}
