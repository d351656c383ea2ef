//! Chat engine: reconciles the backend, the on-disk cache, and in-memory
//! state into one chat list, and owns every mutating operation.
//!
//! Loading pulls conversations with bounded retries, enriches each one
//! concurrently, and falls back to the cache when the backend is unreachable
//! or empty. Sends are apply-then-confirm: the local append happens first and
//! background write failures never roll it back.

use crate::ai::ReplyGateway;
use crate::api::{ApiError, ConversationGateway, OutgoingMessage, RemoteConversation};
use crate::cache::ChatCache;
use crate::retry::{retry, Backoff};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Fixed reply appended when the AI gateway fails.
pub const GENERATION_APOLOGY: &str =
    "Sorry, I encountered an error while generating a response. Please try again.";

const DEFAULT_TITLE: &str = "New Chat";
const TITLE_MAX_CHARS: usize = 30;
const ASSISTANT_SENDER: &str = "assistant";

/// Who authored a message, derived from the backend's raw sender id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub text: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
}

/// A conversation: backend id, display title, and chronological messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Chat {
    pub id: String,
    pub title: String,
    pub last_message: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

/// User-visible notification from the engine; the front-end drains and
/// renders these.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Loaded { count: usize, from_cache: bool },
    Synced,
    SyncFailed(String),
    ChatCreated,
    CreateFailed(String),
    ChatSelected,
    ChatDeleted,
    NoActiveChat,
    ReplyFailed(String),
}

/// Why a send was rejected without touching any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no chat selected")]
    NoActiveChat,
    #[error("a reply is already being generated for this chat")]
    ReplyInFlight,
}

/// Map a raw backend sender id to a role. Total: unrecognized non-self ids
/// are the assistant.
pub fn derive_sender(raw: &str, self_id: &str) -> Sender {
    match raw {
        "assistant" | "ai" | "bot" | "system" => Sender::Assistant,
        _ if raw == self_id => Sender::User,
        _ => Sender::Assistant,
    }
}

/// First 30 characters of the message, with a trailing "..." when truncated.
pub fn title_from_message(text: &str) -> String {
    let prefix: String = text.chars().take(TITLE_MAX_CHARS).collect();
    if text.chars().count() > TITLE_MAX_CHARS {
        format!("{}...", prefix)
    } else {
        prefix
    }
}

/// Parse a backend or cache timestamp. Accepts RFC 3339 and naive ISO
/// datetimes (the backend emits UTC without an offset); anything else maps
/// to "now" rather than dropping the message.
pub(crate) fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                s.parse::<NaiveDateTime>()
                    .ok()
                    .map(|n| Utc.from_utc_datetime(&n))
            })
    })
    .unwrap_or_else(Utc::now)
}

/// Display title for a loaded conversation: backend title when present,
/// else the first chronological user message, else the default.
fn derive_title(backend_title: Option<&str>, messages: &[Message]) -> String {
    if let Some(title) = backend_title.filter(|t| !t.is_empty()) {
        return title.to_string();
    }
    messages
        .iter()
        .find(|m| m.sender == Sender::User)
        .map(|m| title_from_message(&m.text))
        .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}

/// Map a newest-first backend history to chronological messages. Reversal,
/// not a sort: messages sharing a timestamp keep backend-adjacent order.
fn map_messages(raw: Vec<crate::api::RemoteMessage>, self_id: &str) -> Vec<Message> {
    raw.into_iter()
        .rev()
        .map(|m| Message {
            id: m.id.unwrap_or_default(),
            sender: derive_sender(&m.user_id, self_id),
            text: m.content,
            timestamp: parse_timestamp(m.timestamp.as_deref()),
        })
        .collect()
}

#[derive(Debug)]
struct EngineState {
    chats: Vec<Chat>,
    current_id: Option<String>,
    ready: bool,
    composing: bool,
    in_flight: HashSet<String>,
    notices: Vec<Notice>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            chats: Vec::new(),
            current_id: None,
            ready: true,
            composing: false,
            in_flight: HashSet::new(),
            notices: Vec::new(),
        }
    }
}

/// The chat engine. Cheap to share: all state lives behind one lock, and
/// every mutation happens under a single held write guard.
pub struct ChatEngine {
    api: Arc<dyn ConversationGateway>,
    ai: Arc<dyn ReplyGateway>,
    cache: ChatCache,
    user_id: String,
    backoff: Backoff,
    state: Arc<RwLock<EngineState>>,
}

impl ChatEngine {
    pub fn new(
        api: Arc<dyn ConversationGateway>,
        ai: Arc<dyn ReplyGateway>,
        cache: ChatCache,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            ai,
            cache,
            user_id: user_id.into(),
            backoff: Backoff::default(),
            state: Arc::new(RwLock::new(EngineState::default())),
        }
    }

    /// Override the bulk-load retry policy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn chats(&self) -> Vec<Chat> {
        self.state.read().await.chats.clone()
    }

    pub async fn current_id(&self) -> Option<String> {
        self.state.read().await.current_id.clone()
    }

    pub async fn current_chat(&self) -> Option<Chat> {
        let st = self.state.read().await;
        let id = st.current_id.as_deref()?;
        st.chats.iter().find(|c| c.id == id).cloned()
    }

    /// True when there is nothing to show and the front-end should offer to
    /// start a new chat.
    pub async fn ready(&self) -> bool {
        self.state.read().await.ready
    }

    /// True while a reply is being generated.
    pub async fn composing(&self) -> bool {
        self.state.read().await.composing
    }

    /// Drain pending user-visible notifications.
    pub async fn take_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut self.state.write().await.notices)
    }

    /// Bulk load at sign-in: list with bounded retries, enrich concurrently,
    /// fall back to the cache, select the first chat, mirror the result.
    /// Never fails — every failure mode ends in a well-defined state.
    pub async fn load(&self) {
        let listed = retry(self.backoff, || self.api.list_conversations()).await;
        match listed {
            Ok(remote) if !remote.is_empty() => {
                let chats = self.enrich_all(&remote).await;
                {
                    let mut st = self.state.write().await;
                    st.current_id = chats.first().map(|c| c.id.clone());
                    st.ready = false;
                    st.notices.push(Notice::Loaded {
                        count: chats.len(),
                        from_cache: false,
                    });
                    st.chats = chats;
                }
                self.persist().await;
            }
            Ok(_) => {
                log::info!("no conversations on the backend, checking cache");
                self.restore_from_cache().await;
            }
            Err(e) => {
                log::warn!("conversation list failed after retries: {}", e);
                self.restore_from_cache().await;
            }
        }
    }

    /// Re-fetch everything once (no retry) and swap the set atomically.
    /// Failures keep the prior state and are reported as a notice.
    pub async fn resync(&self) {
        match self.api.list_conversations().await {
            Ok(remote) if !remote.is_empty() => {
                let chats = self.enrich_all(&remote).await;
                {
                    let mut st = self.state.write().await;
                    let current_survives = st
                        .current_id
                        .as_deref()
                        .is_some_and(|cur| chats.iter().any(|c| c.id == cur));
                    if !current_survives {
                        st.current_id = chats.first().map(|c| c.id.clone());
                    }
                    st.ready = false;
                    st.chats = chats;
                    st.notices.push(Notice::Synced);
                }
                self.persist().await;
            }
            Ok(_) => {
                log::info!("resync: backend returned no conversations, keeping current set");
            }
            Err(e) => {
                log::warn!("resync failed: {}", e);
                self.state
                    .write()
                    .await
                    .notices
                    .push(Notice::SyncFailed(e.to_string()));
            }
        }
    }

    /// Create a conversation on the backend and select it. With an initial
    /// message the user turn is applied locally first and a reply follows.
    pub async fn create_chat(&self, initial_message: Option<&str>) {
        let title = initial_message
            .map(title_from_message)
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());
        let created = match self.api.create_conversation(&title).await {
            Ok(c) => c,
            Err(e) => {
                log::warn!("create conversation failed: {}", e);
                self.state
                    .write()
                    .await
                    .notices
                    .push(Notice::CreateFailed(e.to_string()));
                return;
            }
        };
        // Transient fallback only; the backend normally assigns the id.
        let id = created
            .key()
            .map(str::to_string)
            .unwrap_or_else(|| format!("local-{}", uuid::Uuid::new_v4()));

        let mut messages = Vec::new();
        if let Some(text) = initial_message {
            messages.push(Message {
                id: format!("user-{}", uuid::Uuid::new_v4()),
                text: text.to_string(),
                sender: Sender::User,
                timestamp: Utc::now(),
            });
            self.write_behind(OutgoingMessage {
                user_id: self.user_id.clone(),
                content: text.to_string(),
                conversation_id: id.clone(),
            });
        }
        let chat = Chat {
            id: id.clone(),
            title,
            last_message: initial_message.unwrap_or("New chat started").to_string(),
            created_at: Utc::now(),
            messages,
        };
        {
            let mut st = self.state.write().await;
            st.chats.insert(0, chat);
            st.current_id = Some(id.clone());
            st.ready = false;
            st.notices.push(Notice::ChatCreated);
        }
        self.persist().await;

        if let Some(text) = initial_message {
            self.request_reply(&id, text).await;
        }
    }

    /// Send a user message in the selected chat: optimistic local append,
    /// background backend write, then the reply flow. Rejected when no chat
    /// is selected or a reply is already in flight for it.
    pub async fn send_message(&self, text: &str) -> Result<(), SendError> {
        let chat_id = {
            let mut st = self.state.write().await;
            let id = match st.current_id.clone() {
                Some(id) => id,
                None => {
                    st.notices.push(Notice::NoActiveChat);
                    return Err(SendError::NoActiveChat);
                }
            };
            if st.in_flight.contains(&id) {
                return Err(SendError::ReplyInFlight);
            }
            let message = Message {
                id: format!("user-{}", uuid::Uuid::new_v4()),
                text: text.to_string(),
                sender: Sender::User,
                timestamp: Utc::now(),
            };
            if let Some(chat) = st.chats.iter_mut().find(|c| c.id == id) {
                // First user message names the chat; a real title is never
                // overwritten.
                if chat.title == DEFAULT_TITLE {
                    chat.title = title_from_message(text);
                }
                chat.messages.push(message);
                chat.last_message = text.to_string();
            }
            id
        };
        self.persist().await;
        self.write_behind(OutgoingMessage {
            user_id: self.user_id.clone(),
            content: text.to_string(),
            conversation_id: chat_id.clone(),
        });
        self.request_reply(&chat_id, text).await;
        Ok(())
    }

    /// Remove a chat locally (the backend has no delete endpoint). Deleting
    /// the current chat selects the first remaining one.
    pub async fn delete_chat(&self, chat_id: &str) {
        {
            let mut st = self.state.write().await;
            st.chats.retain(|c| c.id != chat_id);
            if st.current_id.as_deref() == Some(chat_id) {
                st.current_id = st.chats.first().map(|c| c.id.clone());
                st.ready = st.current_id.is_none();
            }
            st.notices.push(Notice::ChatDeleted);
        }
        // The removal reaches the cache through the mirror write.
        self.persist().await;
    }

    /// Select a chat by id. Pure state transition, no network effect.
    /// Returns false when the id is unknown.
    pub async fn select_chat(&self, chat_id: &str) -> bool {
        let mut st = self.state.write().await;
        if !st.chats.iter().any(|c| c.id == chat_id) {
            return false;
        }
        st.current_id = Some(chat_id.to_string());
        st.ready = false;
        st.notices.push(Notice::ChatSelected);
        true
    }

    async fn enrich_all(&self, remote: &[RemoteConversation]) -> Vec<Chat> {
        futures_util::future::join_all(remote.iter().map(|r| self.enrich_conversation(r))).await
    }

    /// Fetch details and history for one conversation. Enrichment failures
    /// degrade to an empty message list and best-effort title; the
    /// conversation is never dropped.
    async fn enrich_conversation(&self, remote: &RemoteConversation) -> Chat {
        let id = remote.key().unwrap_or_default().to_string();
        let created_at = parse_timestamp(remote.created_at.as_deref());
        let backend_title = remote.title.as_deref().filter(|t| !t.is_empty());

        match self.try_enrich(&id).await {
            Ok((last_message, messages)) => Chat {
                title: derive_title(backend_title, &messages),
                id,
                last_message,
                created_at,
                messages,
            },
            Err(e) => {
                log::warn!("enrichment failed for conversation {}: {}", id, e);
                // Details are gone, but the history may still yield a title.
                let title = match self.api.conversation_messages(&id).await {
                    Ok(raw) => derive_title(backend_title, &map_messages(raw, &self.user_id)),
                    Err(me) => {
                        log::debug!("message fetch for title failed for {}: {}", id, me);
                        backend_title
                            .map(str::to_string)
                            .unwrap_or_else(|| DEFAULT_TITLE.to_string())
                    }
                };
                Chat {
                    id,
                    title,
                    last_message: String::new(),
                    created_at,
                    messages: Vec::new(),
                }
            }
        }
    }

    async fn try_enrich(&self, id: &str) -> Result<(String, Vec<Message>), ApiError> {
        let details = self.api.conversation_details(id).await?;
        let raw = self.api.conversation_messages(id).await?;
        Ok((
            details.last_message.unwrap_or_default(),
            map_messages(raw, &self.user_id),
        ))
    }

    async fn restore_from_cache(&self) {
        let cached = self.cache.load(&self.user_id);
        let mut st = self.state.write().await;
        match cached {
            Some(chats) if !chats.is_empty() => {
                log::info!("loaded {} chats from cache", chats.len());
                st.current_id = chats.first().map(|c| c.id.clone());
                st.ready = false;
                st.notices.push(Notice::Loaded {
                    count: chats.len(),
                    from_cache: true,
                });
                st.chats = chats;
            }
            _ => {
                st.chats = Vec::new();
                st.current_id = None;
                st.ready = true;
            }
        }
    }

    /// One reply per send: flag composing, call the gateway, append the
    /// assistant turn (or the fixed apology on failure), mirror, unflag.
    async fn request_reply(&self, chat_id: &str, user_text: &str) {
        {
            let mut st = self.state.write().await;
            st.composing = true;
            st.in_flight.insert(chat_id.to_string());
        }
        let generated = self.ai.generate(user_text).await;
        let failed = generated.as_ref().err().map(|e| e.to_string());
        let text = match generated {
            Ok(reply) => reply,
            Err(_) => GENERATION_APOLOGY.to_string(),
        };
        let message = Message {
            id: format!("assistant-{}", uuid::Uuid::new_v4()),
            text: text.clone(),
            sender: Sender::Assistant,
            timestamp: Utc::now(),
        };
        {
            let mut st = self.state.write().await;
            if let Some(chat) = st.chats.iter_mut().find(|c| c.id == chat_id) {
                chat.last_message = message.text.clone();
                chat.messages.push(message);
            }
            if let Some(reason) = &failed {
                log::warn!("reply generation failed: {}", reason);
                st.notices.push(Notice::ReplyFailed(reason.clone()));
            }
            st.composing = false;
            st.in_flight.remove(chat_id);
        }
        self.persist().await;
        if failed.is_none() {
            self.write_behind(OutgoingMessage {
                user_id: ASSISTANT_SENDER.to_string(),
                content: text,
                conversation_id: chat_id.to_string(),
            });
        }
    }

    /// Fire-and-forget backend write; failures are logged and the applied
    /// local state stands.
    fn write_behind(&self, message: OutgoingMessage) {
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            if let Err(e) = api.send_message(&message).await {
                log::warn!(
                    "background write failed for conversation {}: {}",
                    message.conversation_id,
                    e
                );
            }
        });
    }

    /// Mirror the in-memory set to the per-user cache.
    async fn persist(&self) {
        let chats = self.state.read().await.chats.clone();
        if let Err(e) = self.cache.save(&self.user_id, &chats) {
            log::warn!("chat cache write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RemoteMessage;

    #[test]
    fn sender_derivation_is_total() {
        assert_eq!(derive_sender("u1", "u1"), Sender::User);
        for raw in ["assistant", "ai", "bot", "system"] {
            assert_eq!(derive_sender(raw, "u1"), Sender::Assistant);
        }
        // Unrecognized non-self ids default to the assistant.
        assert_eq!(derive_sender("someone-else", "u1"), Sender::Assistant);
        assert_eq!(derive_sender("", "u1"), Sender::Assistant);
    }

    #[test]
    fn self_named_like_a_bot_is_still_the_bot() {
        // The reserved names win even when they collide with the user's id.
        assert_eq!(derive_sender("assistant", "assistant"), Sender::Assistant);
    }

    #[test]
    fn title_truncates_past_thirty_chars() {
        assert_eq!(title_from_message("short"), "short");
        let exactly = "a".repeat(30);
        assert_eq!(title_from_message(&exactly), exactly);
        let long = "b".repeat(31);
        assert_eq!(title_from_message(&long), format!("{}...", "b".repeat(30)));
    }

    #[test]
    fn title_counts_characters_not_bytes() {
        let text = "å".repeat(31);
        assert_eq!(title_from_message(&text), format!("{}...", "å".repeat(30)));
    }

    #[test]
    fn title_derivation_is_idempotent() {
        let first = title_from_message("what is the weather like in Rotterdam today");
        let second = title_from_message("what is the weather like in Rotterdam today");
        assert_eq!(first, second);
    }

    #[test]
    fn backend_title_wins_over_derivation() {
        let messages = vec![Message {
            id: "m1".to_string(),
            text: "hello there".to_string(),
            sender: Sender::User,
            timestamp: Utc::now(),
        }];
        assert_eq!(derive_title(Some("Kept title"), &messages), "Kept title");
        assert_eq!(derive_title(Some(""), &messages), "hello there");
        assert_eq!(derive_title(None, &messages), "hello there");
        assert_eq!(derive_title(None, &[]), "New Chat");
    }

    #[test]
    fn title_skips_assistant_messages() {
        let messages = vec![
            Message {
                id: "m1".to_string(),
                text: "welcome back".to_string(),
                sender: Sender::Assistant,
                timestamp: Utc::now(),
            },
            Message {
                id: "m2".to_string(),
                text: "plan my week".to_string(),
                sender: Sender::User,
                timestamp: Utc::now(),
            },
        ];
        assert_eq!(derive_title(None, &messages), "plan my week");
    }

    #[test]
    fn parse_timestamp_accepts_rfc3339_and_naive() {
        let t = parse_timestamp(Some("2024-03-01T09:00:00+00:00"));
        assert_eq!(t.to_rfc3339(), "2024-03-01T09:00:00+00:00");
        // The backend emits naive UTC datetimes.
        let t = parse_timestamp(Some("2024-03-01T09:00:00.500000"));
        assert_eq!(t.timestamp_millis(), 1709283600500);
    }

    #[test]
    fn map_messages_reverses_newest_first() {
        let raw = vec![
            RemoteMessage {
                id: Some("m3".to_string()),
                user_id: "assistant".to_string(),
                content: "third".to_string(),
                timestamp: Some("2024-03-01T09:00:03".to_string()),
                conversation_id: None,
            },
            RemoteMessage {
                id: Some("m2".to_string()),
                user_id: "u1".to_string(),
                content: "second".to_string(),
                timestamp: Some("2024-03-01T09:00:01".to_string()),
                conversation_id: None,
            },
            RemoteMessage {
                id: Some("m1".to_string()),
                user_id: "u1".to_string(),
                content: "first".to_string(),
                timestamp: Some("2024-03-01T09:00:01".to_string()),
                conversation_id: None,
            },
        ];
        let messages = map_messages(raw, "u1");
        assert_eq!(messages.len(), 3);
        assert!(messages
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
        // Equal timestamps keep backend-adjacent order after reversal.
        assert_eq!(messages[0].id, "m1");
        assert_eq!(messages[1].id, "m2");
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[2].sender, Sender::Assistant);
    }
}
