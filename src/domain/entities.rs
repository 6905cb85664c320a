//! Domain entities. Pure data structures for the core business.
//!
//! No Telegram/IO types here: adapters map wire formats into these.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Conversation endpoint identity. The unit of ordering.
pub type ChatId = i64;

/// Sender identity inside a chat.
pub type UserId = i64;

/// Monotonic id of an update in the global (chat-independent) feed.
pub type UpdateId = i64;

/// An inbound event. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: UpdateId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    /// Unix seconds as reported by the platform.
    pub timestamp: i64,
    pub payload: Payload,
}

impl Update {
    /// Returns the command name when the payload is a `/command`.
    pub fn command(&self) -> Option<&str> {
        match &self.payload {
            Payload::Command { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }

    /// Plain text (or the raw command line) carried by the update.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(t) => Some(t.as_str()),
            Payload::Command { raw, .. } => Some(raw.as_str()),
            Payload::Media(m) => m.caption.as_deref(),
            Payload::Callback { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    /// `/name@bot args`. `name` is lowercased and stripped of the bot suffix.
    Command {
        name: String,
        args: String,
        raw: String,
    },
    /// Inline keyboard press.
    Callback {
        query_id: String,
        data: String,
        /// Message the keyboard was attached to, when the platform reports it.
        message_id: Option<i64>,
    },
    Media(MediaReference),
}

impl Payload {
    /// Parse message text into `Command` when it starts with `/`, otherwise `Text`.
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Payload::Text(text.to_string());
        };
        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((h, a)) => (h, a.trim()),
            None => (rest, ""),
        };
        let name = head.split('@').next().unwrap_or(head);
        if name.is_empty() {
            return Payload::Text(text.to_string());
        }
        Payload::Command {
            name: name.to_lowercase(),
            args: args.to_string(),
            raw: trimmed.to_string(),
        }
    }
}

/// Reference to platform-hosted media. Only the handle travels through the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaReference {
    pub media_type: MediaType,
    /// Opaque handle the platform resolves (e.g. Bot API `file_id`).
    pub file_id: String,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    Other,
}

/// Conversation state of a chat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateTag {
    #[default]
    New,
    AwaitingName,
    AwaitingApiKey,
    Ready,
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateTag::New => "NEW",
            StateTag::AwaitingName => "AWAITING_NAME",
            StateTag::AwaitingApiKey => "AWAITING_API_KEY",
            StateTag::Ready => "READY",
        };
        f.write_str(s)
    }
}

/// Scalar or blob stored in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Text(s)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::Int(n)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

/// Per-chat conversational state.
///
/// Created lazily with `StateTag::New`. Writes go through the store's
/// compare-and-swap on `version`; the store bumps `version` on every commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub chat_id: ChatId,
    pub state: StateTag,
    pub attributes: BTreeMap<String, AttrValue>,
    pub last_active_at: DateTime<Utc>,
    pub version: u64,
    /// Highest update applied to this session. Redelivered updates at or below it are skipped.
    pub last_update_id: Option<UpdateId>,
}

impl Session {
    pub fn new(chat_id: ChatId, now: DateTime<Utc>) -> Self {
        Self {
            chat_id,
            state: StateTag::default(),
            attributes: BTreeMap::new(),
            last_active_at: now,
            version: 0,
            last_update_id: None,
        }
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    pub fn text_attr(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(AttrValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<AttrValue> {
        self.attributes.remove(key)
    }

    /// True when `update_id` was already applied to this session.
    pub fn has_applied(&self, update_id: UpdateId) -> bool {
        self.last_update_id.is_some_and(|last| update_id <= last)
    }
}

/// Outbound operation kind, for logs and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Message,
    Edit,
    CallbackAnswer,
    Media,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Message => "message",
            ActionKind::Edit => "edit",
            ActionKind::CallbackAnswer => "callback_answer",
            ActionKind::Media => "media",
        };
        f.write_str(s)
    }
}

/// What a handler asks the platform to do. Chat and idempotency key are added by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionPayload {
    Message {
        text: String,
    },
    Edit {
        message_id: i64,
        text: String,
    },
    CallbackAnswer {
        query_id: String,
        text: Option<String>,
    },
    Media {
        media: MediaReference,
    },
}

impl ActionPayload {
    pub fn message(text: impl Into<String>) -> Self {
        ActionPayload::Message { text: text.into() }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Message { .. } => ActionKind::Message,
            ActionPayload::Edit { .. } => ActionKind::Edit,
            ActionPayload::CallbackAnswer { .. } => ActionKind::CallbackAnswer,
            ActionPayload::Media { .. } => ActionKind::Media,
        }
    }
}

/// An action owned by the dispatcher until acknowledged or exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundAction {
    pub chat_id: ChatId,
    pub payload: ActionPayload,
    pub idempotency_key: String,
}

impl OutboundAction {
    pub fn new(chat_id: ChatId, payload: ActionPayload, idempotency_key: impl Into<String>) -> Self {
        Self {
            chat_id,
            payload,
            idempotency_key: idempotency_key.into(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing_strips_bot_suffix() {
        let p = Payload::from_text("/Start@my_bot hello there");
        assert_eq!(
            p,
            Payload::Command {
                name: "start".to_string(),
                args: "hello there".to_string(),
                raw: "/Start@my_bot hello there".to_string(),
            }
        );
    }

    #[test]
    fn test_plain_text_and_bare_slash() {
        assert_eq!(Payload::from_text("hi"), Payload::Text("hi".to_string()));
        assert_eq!(Payload::from_text("/"), Payload::Text("/".to_string()));
    }

    #[test]
    fn test_session_has_applied() {
        let mut s = Session::new(1, Utc::now());
        assert!(!s.has_applied(5));
        s.last_update_id = Some(5);
        assert!(s.has_applied(5));
        assert!(s.has_applied(4));
        assert!(!s.has_applied(6));
    }

    #[test]
    fn test_state_tag_display() {
        assert_eq!(StateTag::AwaitingName.to_string(), "AWAITING_NAME");
        assert_eq!(StateTag::default(), StateTag::New);
    }
}
