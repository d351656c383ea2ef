//! Typed client for the backend's conversation and message endpoints.
//!
//! Every call attaches the current bearer token. A 401 triggers exactly one
//! token refresh and one retried call; a second 401 is an authentication
//! error. The gateway holds no conversation state.

use crate::auth::{AuthGateway, IdentityProvider, SessionStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("api error: {0}")]
    Api(String),
    #[error("not authenticated")]
    Auth,
    #[error("{0}")]
    Backend(String),
}

/// Conversation summary as returned by the backend. The id may arrive under
/// either `conversation_id` or `id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConversation {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl RemoteConversation {
    /// Backend id under whichever key it arrived.
    pub fn key(&self) -> Option<&str> {
        self.conversation_id.as_deref().or(self.id.as_deref())
    }
}

/// Stored message as returned by the backend. `user_id` is the raw sender
/// identifier; role derivation happens in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// `GET /conversations/{id}/details` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationDetails {
    #[serde(default)]
    pub last_message: Option<String>,
}

/// `POST /messages/` body.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    pub user_id: String,
    pub content: String,
    pub conversation_id: String,
}

/// Conversation and message operations against the backend.
#[async_trait]
pub trait ConversationGateway: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<RemoteConversation>, ApiError>;
    async fn conversation_details(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationDetails, ApiError>;
    async fn conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<RemoteMessage>, ApiError>;
    async fn create_conversation(&self, title: &str) -> Result<RemoteConversation, ApiError>;
    async fn send_message(&self, message: &OutgoingMessage) -> Result<(), ApiError>;
}

/// HTTP implementation over the backend REST API.
pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
    session: Arc<SessionStore>,
    auth: AuthGateway,
    identity: Arc<dyn IdentityProvider>,
}

impl BackendClient {
    pub fn new(
        base_url: impl Into<String>,
        session: Arc<SessionStore>,
        auth: AuthGateway,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            session,
            auth,
            identity,
        }
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Current token, refreshing once when none is held.
    async fn bearer(&self) -> Result<String, ApiError> {
        if let Some(token) = self.session.token().await {
            return Ok(token);
        }
        log::debug!("no bearer token held, attempting refresh");
        self.session
            .refresh(&self.auth, self.identity.as_ref())
            .await
            .ok_or(ApiError::Auth)
    }

    /// Send an authenticated request. On 401, refresh the token once and retry
    /// once; a second 401 fails with an auth error.
    pub(crate) async fn execute<F>(&self, build: F) -> Result<reqwest::Response, ApiError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let token = self.bearer().await?;
        let res = build(&self.client).bearer_auth(&token).send().await?;
        if res.status() != reqwest::StatusCode::UNAUTHORIZED {
            return ok_or_api(res).await;
        }
        log::info!("401 from backend, refreshing token and retrying");
        let token = self
            .session
            .refresh(&self.auth, self.identity.as_ref())
            .await
            .ok_or(ApiError::Auth)?;
        let res = build(&self.client).bearer_auth(&token).send().await?;
        if res.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ApiError::Auth);
        }
        ok_or_api(res).await
    }
}

async fn ok_or_api(res: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(ApiError::Api(format!("{} {}", status, body)))
}

#[async_trait]
impl ConversationGateway for BackendClient {
    /// GET /conversations/ — summaries for the signed-in user.
    async fn list_conversations(&self) -> Result<Vec<RemoteConversation>, ApiError> {
        let url = format!("{}/conversations/", self.base_url);
        let res = self.execute(|c| c.get(&url)).await?;
        Ok(res.json().await?)
    }

    /// GET /conversations/{id}/details — last message and metadata.
    async fn conversation_details(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationDetails, ApiError> {
        let url = format!("{}/conversations/{}/details", self.base_url, conversation_id);
        let res = self.execute(|c| c.get(&url)).await?;
        Ok(res.json().await?)
    }

    /// GET /messages/{id} — message history, newest-first.
    async fn conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<RemoteMessage>, ApiError> {
        let url = format!("{}/messages/{}", self.base_url, conversation_id);
        let res = self.execute(|c| c.get(&url)).await?;
        Ok(res.json().await?)
    }

    /// POST /conversations/new?title=... — returns the server-assigned id.
    async fn create_conversation(&self, title: &str) -> Result<RemoteConversation, ApiError> {
        let url = format!("{}/conversations/new", self.base_url);
        let res = self
            .execute(|c| c.post(&url).query(&[("title", title)]))
            .await?;
        Ok(res.json().await?)
    }

    /// POST /messages/ — persist one message.
    async fn send_message(&self, message: &OutgoingMessage) -> Result<(), ApiError> {
        let url = format!("{}/messages/", self.base_url);
        self.execute(|c| c.post(&url).json(message)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_prefers_conversation_id() {
        let conv = RemoteConversation {
            conversation_id: Some("c1".to_string()),
            id: Some("other".to_string()),
            ..Default::default()
        };
        assert_eq!(conv.key(), Some("c1"));

        let conv = RemoteConversation {
            id: Some("c2".to_string()),
            ..Default::default()
        };
        assert_eq!(conv.key(), Some("c2"));

        assert_eq!(RemoteConversation::default().key(), None);
    }

    #[test]
    fn remote_message_parses_sparse_payload() {
        let msg: RemoteMessage =
            serde_json::from_str(r#"{"user_id":"u1","content":"hi"}"#).expect("parse message");
        assert_eq!(msg.user_id, "u1");
        assert_eq!(msg.content, "hi");
        assert!(msg.id.is_none());
        assert!(msg.timestamp.is_none());
    }
}
