//! Per-user on-disk snapshot of the chat set.
//!
//! Mirrors the in-memory set whenever it changes and is read back as a
//! fallback when the backend cannot be reached. Timestamps are stored as
//! RFC 3339 strings and rehydrated on load.

use crate::chat::{parse_timestamp, Chat, Message, Sender};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct CachedMessage {
    id: String,
    text: String,
    sender: Sender,
    timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedChat {
    id: String,
    title: String,
    #[serde(default)]
    last_message: String,
    created_at: String,
    #[serde(default)]
    messages: Vec<CachedMessage>,
}

impl From<&Chat> for CachedChat {
    fn from(chat: &Chat) -> Self {
        Self {
            id: chat.id.clone(),
            title: chat.title.clone(),
            last_message: chat.last_message.clone(),
            created_at: chat.created_at.to_rfc3339(),
            messages: chat
                .messages
                .iter()
                .map(|m| CachedMessage {
                    id: m.id.clone(),
                    text: m.text.clone(),
                    sender: m.sender,
                    timestamp: m.timestamp.to_rfc3339(),
                })
                .collect(),
        }
    }
}

impl From<CachedChat> for Chat {
    fn from(cached: CachedChat) -> Self {
        Self {
            id: cached.id,
            title: cached.title,
            last_message: cached.last_message,
            created_at: parse_timestamp(Some(&cached.created_at)),
            messages: cached
                .messages
                .into_iter()
                .map(|m| Message {
                    id: m.id,
                    text: m.text,
                    sender: m.sender,
                    timestamp: parse_timestamp(Some(&m.timestamp)),
                })
                .collect(),
        }
    }
}

/// On-disk chat cache: one JSON file per user id under the cache directory.
pub struct ChatCache {
    dir: PathBuf,
}

impl ChatCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("chats_{}.json", user_id))
    }

    /// Load the cached chat set for a user. Missing or unparsable files are
    /// treated as no cache.
    pub fn load(&self, user_id: &str) -> Option<Vec<Chat>> {
        let path = self.path_for(user_id);
        let s = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<Vec<CachedChat>>(&s) {
            Ok(cached) => Some(cached.into_iter().map(Chat::from).collect()),
            Err(e) => {
                log::warn!("discarding unparsable chat cache {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Write the chat set for a user, replacing any previous snapshot.
    pub fn save(&self, user_id: &str, chats: &[Chat]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating cache dir {}", self.dir.display()))?;
        let cached: Vec<CachedChat> = chats.iter().map(CachedChat::from).collect();
        let s = serde_json::to_string_pretty(&cached)?;
        let path = self.path_for(user_id);
        std::fs::write(&path, s).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn temp_cache() -> ChatCache {
        let dir = std::env::temp_dir().join(format!("perch-cache-test-{}", uuid::Uuid::new_v4()));
        ChatCache::new(dir)
    }

    fn sample_chat() -> Chat {
        Chat {
            id: "c1".to_string(),
            title: "First chat".to_string(),
            last_message: "see you".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
            messages: vec![
                Message {
                    id: "m1".to_string(),
                    text: "hi".to_string(),
                    sender: Sender::User,
                    timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 1).unwrap(),
                },
                Message {
                    id: "m2".to_string(),
                    text: "hello".to_string(),
                    sender: Sender::Assistant,
                    timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 2).unwrap(),
                },
            ],
        }
    }

    #[test]
    fn round_trip_preserves_chats() {
        let cache = temp_cache();
        let chats = vec![sample_chat()];
        cache.save("u1", &chats).expect("save");
        let loaded = cache.load("u1").expect("load");
        assert_eq!(loaded, chats);
    }

    #[test]
    fn cache_is_keyed_by_user() {
        let cache = temp_cache();
        cache.save("u1", &[sample_chat()]).expect("save");
        assert!(cache.load("u2").is_none());
    }

    #[test]
    fn missing_file_is_none() {
        let cache = temp_cache();
        assert!(cache.load("nobody").is_none());
    }

    #[test]
    fn unparsable_file_is_none() {
        let cache = temp_cache();
        std::fs::create_dir_all(cache.dir()).expect("create dir");
        std::fs::write(cache.path_for("u1"), b"not json").expect("write garbage");
        assert!(cache.load("u1").is_none());
    }

    #[test]
    fn empty_set_round_trips() {
        let cache = temp_cache();
        cache.save("u1", &[]).expect("save empty");
        assert_eq!(cache.load("u1"), Some(Vec::new()));
    }
}
