//! The 401 path end-to-end against a loopback server: one token refresh and
//! one retried call, then an auth error.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lib::api::{ApiError, BackendClient, ConversationGateway};
use lib::auth::{AuthGateway, SessionStore, StoredIdentity};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct Backend {
    /// Token the authenticated routes accept.
    valid_token: String,
    /// Token /login hands out.
    issued_token: String,
    refreshes: AtomicU32,
}

async fn login(State(backend): State<Arc<Backend>>) -> Json<serde_json::Value> {
    backend.refreshes.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "access_token": backend.issued_token,
        "user": { "uid": "u1" }
    }))
}

async fn conversations(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    let expected = format!("Bearer {}", backend.valid_token);
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);
    if authorized {
        Json(json!([])).into_response()
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

async fn spawn_backend(valid_token: &str, issued_token: &str) -> (String, Arc<Backend>) {
    let backend = Arc::new(Backend {
        valid_token: valid_token.to_string(),
        issued_token: issued_token.to_string(),
        refreshes: AtomicU32::new(0),
    });
    let app = Router::new()
        .route("/login", post(login))
        .route("/conversations/", get(conversations))
        .with_state(backend.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind free port");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{}", addr), backend)
}

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("perch-backend-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn client_for(base_url: &str, dir: &PathBuf) -> (Arc<SessionStore>, BackendClient) {
    let session = Arc::new(SessionStore::open(dir.join("token")));
    let identity = Arc::new(StoredIdentity::new(dir.join("identity.json")));
    identity.remember("u1").expect("remember uid");
    let client = BackendClient::new(
        base_url.to_string(),
        session.clone(),
        AuthGateway::new(base_url.to_string()),
        identity,
    );
    (session, client)
}

#[tokio::test]
async fn stale_token_is_refreshed_once_and_the_call_retried() {
    let (base_url, backend) = spawn_backend("tok-fresh", "tok-fresh").await;
    let dir = temp_dir();
    let (session, client) = client_for(&base_url, &dir);
    session.acquire("tok-stale").await;

    let conversations = client.list_conversations().await.expect("list after refresh");
    assert!(conversations.is_empty());
    assert_eq!(session.token().await.as_deref(), Some("tok-fresh"));
    assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_401_is_an_auth_error() {
    // The refresh hands out a token the routes still reject.
    let (base_url, backend) = spawn_backend("tok-never-issued", "tok-still-stale").await;
    let dir = temp_dir();
    let (session, client) = client_for(&base_url, &dir);
    session.acquire("tok-stale").await;

    let err = client.list_conversations().await.expect_err("second 401");
    assert!(matches!(err, ApiError::Auth));
    assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_token_triggers_an_upfront_refresh() {
    let (base_url, backend) = spawn_backend("tok-fresh", "tok-fresh").await;
    let dir = temp_dir();
    let (session, client) = client_for(&base_url, &dir);

    client.list_conversations().await.expect("list");
    assert_eq!(session.token().await.as_deref(), Some("tok-fresh"));
    assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn no_identity_session_means_not_authenticated() {
    let (base_url, _backend) = spawn_backend("tok-fresh", "tok-fresh").await;
    let dir = temp_dir();
    let session = Arc::new(SessionStore::open(dir.join("token")));
    // No identity file: refresh has nothing to exchange.
    let identity = Arc::new(StoredIdentity::new(dir.join("identity.json")));
    let client = BackendClient::new(
        base_url.clone(),
        session,
        AuthGateway::new(base_url),
        identity,
    );

    let err = client.list_conversations().await.expect_err("no session");
    assert!(matches!(err, ApiError::Auth));
}
