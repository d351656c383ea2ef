//! Session credentials, identity, and the backend auth endpoints.
//!
//! The session store owns the bearer token; the identity provider answers
//! "who is signed in" and backs token refresh. Both persist under the config
//! directory (e.g. `~/.perch/token`, `~/.perch/identity.json`) so a new
//! process can resume the session.

use crate::api::ApiError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Provider-side session: the identity the user is signed in as.
#[derive(Debug, Clone)]
pub struct ProviderSession {
    pub uid: String,
}

/// Pluggable identity provider behind login. Callers must treat a `None`
/// session as "not authenticated", not as an error.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current provider session, if the user is signed in.
    async fn current_session(&self) -> Option<ProviderSession>;

    /// Forget the provider session at logout.
    async fn sign_out(&self);
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    uid: String,
}

/// Identity provider that remembers the uid acquired at login in a JSON file.
pub struct StoredIdentity {
    path: PathBuf,
}

impl StoredIdentity {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Persist the uid returned by a successful login or registration.
    pub fn remember(&self, uid: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let s = serde_json::to_string_pretty(&IdentityFile {
            uid: uid.to_string(),
        })?;
        std::fs::write(&self.path, s)?;
        Ok(())
    }

    fn load(&self) -> Option<String> {
        let s = std::fs::read_to_string(&self.path).ok()?;
        let file: IdentityFile = serde_json::from_str(&s).ok()?;
        let uid = file.uid.trim().to_string();
        if uid.is_empty() {
            None
        } else {
            Some(uid)
        }
    }
}

#[async_trait]
impl IdentityProvider for StoredIdentity {
    async fn current_session(&self) -> Option<ProviderSession> {
        self.load().map(|uid| ProviderSession { uid })
    }

    async fn sign_out(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("removing identity file failed: {}", e);
            }
        }
    }
}

/// Holds the bearer token for the signed-in user and persists it to a file.
pub struct SessionStore {
    token_path: PathBuf,
    inner: RwLock<Option<String>>,
}

impl SessionStore {
    /// Open the store, loading any persisted token from `token_path`.
    pub fn open(token_path: impl Into<PathBuf>) -> Self {
        let token_path = token_path.into();
        let token = std::fs::read_to_string(&token_path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self {
            token_path,
            inner: RwLock::new(token),
        }
    }

    /// Store a freshly issued bearer token (login, registration, refresh).
    pub async fn acquire(&self, token: &str) {
        *self.inner.write().await = Some(token.to_string());
        if let Some(parent) = self.token_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.token_path, token) {
            log::warn!("persisting token failed: {}", e);
        }
    }

    /// Current bearer token, if any.
    pub async fn token(&self) -> Option<String> {
        self.inner.read().await.clone()
    }

    /// Drop the token from memory and disk.
    pub async fn clear(&self) {
        *self.inner.write().await = None;
        if let Err(e) = std::fs::remove_file(&self.token_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("removing token file failed: {}", e);
            }
        }
    }

    /// Exchange the identity provider's current session for a new bearer token.
    /// Returns None when no provider session exists or the exchange fails.
    pub async fn refresh(
        &self,
        auth: &AuthGateway,
        provider: &dyn IdentityProvider,
    ) -> Option<String> {
        let session = match provider.current_session().await {
            Some(s) => s,
            None => {
                log::debug!("no identity provider session, cannot refresh token");
                return None;
            }
        };
        match auth.refresh_token(&session.uid).await {
            Ok(token) => {
                self.acquire(&token).await;
                log::info!("bearer token refreshed");
                Some(token)
            }
            Err(e) => {
                log::warn!("token refresh failed: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct CredentialsRequest<'a> {
    username: &'a str,
    password: &'a str,
    email: &'a str,
    /// Provider uid when one is already known; the backend creates or
    /// verifies the provider account itself when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    firebase_uid: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    firebase_uid: &'a str,
    refresh: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<String>,
}

/// User record echoed back by the auth endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthUser {
    pub uid: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// `POST /register` and `POST /login` response.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub user: Option<AuthUser>,
}

/// Client for the unauthenticated auth endpoints.
pub struct AuthGateway {
    base_url: String,
    client: reqwest::Client,
}

impl AuthGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// POST /register — create an account, returns the issued token.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<LoginResponse, ApiError> {
        self.credentials_call("register", username, password, email)
            .await
    }

    /// POST /login — authenticate an existing account, returns the issued token.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<LoginResponse, ApiError> {
        self.credentials_call("login", username, password, email)
            .await
    }

    async fn credentials_call(
        &self,
        endpoint: &str,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<LoginResponse, ApiError> {
        let fallback_email = format!("{}@perch.local", username);
        let body = CredentialsRequest {
            username,
            password,
            email: email.unwrap_or(&fallback_email),
            firebase_uid: None,
        };
        let url = format!("{}/{}", self.base_url, endpoint);
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            return Err(error_from_response(res).await);
        }
        Ok(res.json().await?)
    }

    /// POST /login with `refresh: true` — exchange a provider uid for a new token.
    pub async fn refresh_token(&self, uid: &str) -> Result<String, ApiError> {
        let url = format!("{}/login", self.base_url);
        let body = RefreshRequest {
            firebase_uid: uid,
            refresh: true,
        };
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            return Err(error_from_response(res).await);
        }
        let data: LoginResponse = res.json().await?;
        Ok(data.access_token)
    }
}

/// Map a non-2xx auth response: the backend's `detail` string when present,
/// otherwise status and raw body.
async fn error_from_response(res: reqwest::Response) -> ApiError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(&body) {
        if let Some(detail) = parsed.detail {
            return ApiError::Backend(detail);
        }
    }
    ApiError::Api(format!("{} {}", status, body))
}

/// Log in, store the bearer token, and remember the uid for refresh.
pub async fn sign_in(
    gateway: &AuthGateway,
    session: &SessionStore,
    identity: &StoredIdentity,
    username: &str,
    password: &str,
    email: Option<&str>,
) -> Result<LoginResponse, ApiError> {
    let response = gateway.login(username, password, email).await?;
    session.acquire(&response.access_token).await;
    if let Some(user) = &response.user {
        if let Err(e) = identity.remember(&user.uid) {
            log::warn!("persisting identity failed: {}", e);
        }
    }
    Ok(response)
}

/// Register, store the bearer token, and remember the uid for refresh.
pub async fn sign_up(
    gateway: &AuthGateway,
    session: &SessionStore,
    identity: &StoredIdentity,
    username: &str,
    password: &str,
    email: Option<&str>,
) -> Result<LoginResponse, ApiError> {
    let response = gateway.register(username, password, email).await?;
    session.acquire(&response.access_token).await;
    if let Some(user) = &response.user {
        if let Err(e) = identity.remember(&user.uid) {
            log::warn!("persisting identity failed: {}", e);
        }
    }
    Ok(response)
}

/// Clear the stored token and provider session. Local chat caches are kept —
/// they are the fallback for the next sign-in.
pub async fn sign_out(session: &SessionStore, provider: &dyn IdentityProvider) {
    session.clear().await;
    provider.sign_out().await;
}

/// Default token file path next to the given config file.
pub fn token_path(config_path: &Path) -> PathBuf {
    sibling(config_path, "token")
}

/// Default identity file path next to the given config file.
pub fn identity_path(config_path: &Path) -> PathBuf {
    sibling(config_path, "identity.json")
}

fn sibling(config_path: &Path, name: &str) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("perch-auth-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[tokio::test]
    async fn stored_identity_round_trip() {
        let dir = temp_dir();
        let identity = StoredIdentity::new(dir.join("identity.json"));
        assert!(identity.current_session().await.is_none());

        identity.remember("uid-1").expect("remember uid");
        let session = identity.current_session().await.expect("session");
        assert_eq!(session.uid, "uid-1");

        identity.sign_out().await;
        assert!(identity.current_session().await.is_none());
    }

    #[tokio::test]
    async fn session_store_persists_token_across_reopen() {
        let dir = temp_dir();
        let path = dir.join("token");

        let store = SessionStore::open(&path);
        assert_eq!(store.token().await, None);
        store.acquire("tok-1").await;
        assert_eq!(store.token().await.as_deref(), Some("tok-1"));

        let reopened = SessionStore::open(&path);
        assert_eq!(reopened.token().await.as_deref(), Some("tok-1"));

        reopened.clear().await;
        assert_eq!(reopened.token().await, None);
        assert_eq!(SessionStore::open(&path).token().await, None);
    }

    #[test]
    fn sibling_paths_resolve_next_to_config() {
        let config = Path::new("/home/user/.perch/config.json");
        assert_eq!(token_path(config), PathBuf::from("/home/user/.perch/token"));
        assert_eq!(
            identity_path(config),
            PathBuf::from("/home/user/.perch/identity.json")
        );
    }
}
