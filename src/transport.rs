use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::resolver::ChatRef;

/// Rate limiting is expected control flow, not a failure: it carries the
/// server-mandated wait and the caller decides whether the wait is worth it.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("rate limited for {0}s")]
    FloodWait(u64),
    #[error("{0}")]
    Unavailable(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Channel,
    Supergroup,
    Chat,
    User,
}

impl ChatKind {
    /// Collapsed type name used against `allow_types`: broadcast-like kinds
    /// are "channel", every group flavor is "supergroup".
    pub fn canonical(&self) -> &'static str {
        match self {
            ChatKind::Channel => "channel",
            ChatKind::Supergroup | ChatKind::Chat => "supergroup",
            ChatKind::User => "user",
        }
    }

    pub fn joinable(&self) -> bool {
        !matches!(self, ChatKind::User)
    }
}

/// A resolved chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntity {
    pub chat_id: i64,
    pub username: Option<String>,
    pub title: String,
    pub kind: ChatKind,
}

impl ChatEntity {
    pub fn username_lower(&self) -> Option<String> {
        self.username.as_ref().map(|u| u.to_lowercase())
    }
}

/// Minimal message view the ingest paths operate on. The transport adapter
/// fills `text` from whichever attribute the wire message carries it in
/// (plain text or media caption).
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub text: String,
}

/// A live new-message event as delivered on the update bus.
#[derive(Debug, Clone)]
pub struct LiveEvent {
    pub chat: ChatEntity,
    pub message: MessageRecord,
}

/// The slice of the Telegram client the ingestion engine depends on.
/// `history` and `search_channels` return newest-first, as the wire does.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolve a reference to a chat. `Ok(None)` means the reference does not
    /// exist or cannot be resolved without joining (invite links).
    async fn resolve(&self, reference: &ChatRef) -> TransportResult<Option<ChatEntity>>;

    async fn join(&self, entity: &ChatEntity) -> TransportResult<()>;

    async fn accept_invite(&self, hash: &str) -> TransportResult<()>;

    /// Up to `limit` recent messages, newest first, stopping early once ids
    /// fall to `min_id` or below. Pass `min_id = 0` for no lower bound.
    async fn history(&self, entity: &ChatEntity, limit: usize, min_id: i64) -> TransportResult<Vec<MessageRecord>>;

    /// Global search for public channels matching a query.
    async fn search_channels(&self, query: &str, limit: usize) -> TransportResult<Vec<ChatEntity>>;

    /// Participant count from full-channel info, when the server exposes it.
    async fn participant_count(&self, entity: &ChatEntity) -> TransportResult<Option<i64>>;

    /// Chats the account has already joined.
    async fn joined_dialogs(&self) -> TransportResult<Vec<ChatEntity>>;
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};

    use super::*;

    pub fn entity(chat_id: i64, username: &str, kind: ChatKind) -> ChatEntity {
        ChatEntity {
            chat_id,
            username: (!username.is_empty()).then(|| username.to_string()),
            title: format!("{username} title"),
            kind,
        }
    }

    pub fn message(id: i64, text: &str) -> MessageRecord {
        MessageRecord {
            id,
            date: Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(id),
            text: text.to_string(),
        }
    }

    /// Scriptable in-memory transport for deterministic pipeline tests.
    #[derive(Default)]
    pub struct MockTransport {
        pub entities: Mutex<HashMap<String, ChatEntity>>,
        pub history: Mutex<HashMap<i64, Vec<MessageRecord>>>,
        pub search_results: Mutex<HashMap<String, Vec<ChatEntity>>>,
        pub participant_counts: Mutex<HashMap<i64, i64>>,
        pub dialogs: Mutex<Vec<ChatEntity>>,
        /// Errors served (in order) before resolution succeeds, per username.
        pub resolve_errors: Mutex<HashMap<String, VecDeque<TransportError>>>,
        /// Errors served (in order) before a search succeeds, per query.
        pub search_errors: Mutex<HashMap<String, VecDeque<TransportError>>>,
        pub resolve_calls: Mutex<Vec<String>>,
        pub joined: Mutex<Vec<i64>>,
        pub accepted_invites: Mutex<Vec<String>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a resolvable chat along with its recent history
        /// (newest-first).
        pub fn add_chat(&self, entity: ChatEntity, messages: Vec<MessageRecord>) {
            if let Some(key) = entity.username_lower() {
                self.entities.lock().unwrap().insert(key, entity.clone());
            }
            self.history.lock().unwrap().insert(entity.chat_id, messages);
        }

        pub fn script_resolve_error(&self, username: &str, err: TransportError) {
            self.resolve_errors
                .lock()
                .unwrap()
                .entry(username.to_lowercase())
                .or_default()
                .push_back(err);
        }

        pub fn script_search_error(&self, query: &str, err: TransportError) {
            self.search_errors
                .lock()
                .unwrap()
                .entry(query.to_string())
                .or_default()
                .push_back(err);
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn resolve(&self, reference: &ChatRef) -> TransportResult<Option<ChatEntity>> {
            let Some(username) = reference.username() else {
                return Ok(None);
            };
            self.resolve_calls.lock().unwrap().push(username.to_string());

            if let Some(queue) = self.resolve_errors.lock().unwrap().get_mut(username)
                && let Some(err) = queue.pop_front()
            {
                return Err(err);
            }

            Ok(self.entities.lock().unwrap().get(username).cloned())
        }

        async fn join(&self, entity: &ChatEntity) -> TransportResult<()> {
            self.joined.lock().unwrap().push(entity.chat_id);
            Ok(())
        }

        async fn accept_invite(&self, hash: &str) -> TransportResult<()> {
            self.accepted_invites.lock().unwrap().push(hash.to_string());
            Ok(())
        }

        async fn history(&self, entity: &ChatEntity, limit: usize, min_id: i64) -> TransportResult<Vec<MessageRecord>> {
            let history = self.history.lock().unwrap();
            let messages = history.get(&entity.chat_id).cloned().unwrap_or_default();
            Ok(messages
                .into_iter()
                .take_while(|m| m.id > min_id)
                .take(limit)
                .collect())
        }

        async fn search_channels(&self, query: &str, _limit: usize) -> TransportResult<Vec<ChatEntity>> {
            if let Some(queue) = self.search_errors.lock().unwrap().get_mut(query)
                && let Some(err) = queue.pop_front()
            {
                return Err(err);
            }
            Ok(self.search_results.lock().unwrap().get(query).cloned().unwrap_or_default())
        }

        async fn participant_count(&self, entity: &ChatEntity) -> TransportResult<Option<i64>> {
            Ok(self.participant_counts.lock().unwrap().get(&entity.chat_id).copied())
        }

        async fn joined_dialogs(&self) -> TransportResult<Vec<ChatEntity>> {
            Ok(self.dialogs.lock().unwrap().clone())
        }
    }
}
