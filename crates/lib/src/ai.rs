//! AI reply gateway: single call, message in, generated text out.

use crate::api::{ApiError, BackendClient};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

/// Text generation seam: one fallible call per user turn.
#[async_trait]
pub trait ReplyGateway: Send + Sync {
    async fn generate(&self, message: &str) -> Result<String, ApiError>;
}

#[async_trait]
impl ReplyGateway for BackendClient {
    /// POST /ai/generate with the bearer credential; expects `{"response": ...}`.
    async fn generate(&self, message: &str) -> Result<String, ApiError> {
        let url = format!("{}/ai/generate", self.base_url());
        let res = self
            .execute(|c| c.post(&url).json(&json!({ "message": message })))
            .await?;
        let data: GenerateResponse = res.json().await?;
        data.response
            .ok_or_else(|| ApiError::Api("generation result missing response field".to_string()))
    }
}
