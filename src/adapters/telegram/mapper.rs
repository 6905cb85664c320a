//! Map Bot API wire types to domain entities, and HTTP replies to outcomes.
//!
//! Only the fields the engine uses are modelled; unknown fields are ignored.

use crate::domain::{
    ActionPayload, DomainError, MediaReference, MediaType, Payload, Update, UpdateId,
};
use crate::ports::SendOutcome;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

/// Used when a 429 carries no `retry_after`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Envelope of every Bot API reply.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub error_code: Option<u16>,
    #[serde(default)]
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
}

impl<T> ApiResponse<T> {
    fn retry_after(&self) -> Duration {
        self.parameters
            .as_ref()
            .and_then(|p| p.retry_after)
            .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs)
    }

    fn describe(&self, status: u16) -> String {
        format!(
            "{} {}",
            self.error_code.unwrap_or(status),
            self.description.as_deref().unwrap_or("no description")
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct TgUpdate {
    pub update_id: UpdateId,
    pub message: Option<TgMessage>,
    pub edited_message: Option<TgMessage>,
    pub callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TgChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TgFile {
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub date: i64,
    pub chat: TgChat,
    pub from: Option<TgUser>,
    pub text: Option<String>,
    pub caption: Option<String>,
    /// Sizes ascending; the last is the largest.
    pub photo: Option<Vec<TgFile>>,
    pub video: Option<TgFile>,
    pub document: Option<TgFile>,
    pub audio: Option<TgFile>,
    pub voice: Option<TgFile>,
    pub sticker: Option<TgFile>,
}

#[derive(Debug, Deserialize)]
pub struct TgCallbackQuery {
    pub id: String,
    pub from: TgUser,
    pub message: Option<TgMessage>,
    pub data: Option<String>,
}

fn media_of(m: &TgMessage) -> Option<(MediaType, &str)> {
    if let Some(largest) = m.photo.as_ref().and_then(|sizes| sizes.last()) {
        return Some((MediaType::Photo, largest.file_id.as_str()));
    }
    let typed = [
        (MediaType::Video, &m.video),
        (MediaType::Document, &m.document),
        (MediaType::Audio, &m.audio),
        (MediaType::Voice, &m.voice),
        (MediaType::Sticker, &m.sticker),
    ];
    typed
        .into_iter()
        .find_map(|(kind, file)| file.as_ref().map(|f| (kind, f.file_id.as_str())))
}

fn message_to_domain(update_id: UpdateId, m: &TgMessage) -> Option<Update> {
    let payload = if let Some(text) = &m.text {
        Payload::from_text(text)
    } else if let Some((media_type, file_id)) = media_of(m) {
        Payload::Media(MediaReference {
            media_type,
            file_id: file_id.to_string(),
            caption: m.caption.clone(),
        })
    } else {
        return None;
    };
    Some(Update {
        update_id,
        chat_id: m.chat.id,
        // Channel posts have no sender; attribute them to the chat.
        sender_id: m.from.as_ref().map_or(m.chat.id, |u| u.id),
        timestamp: m.date,
        payload,
    })
}

/// Map a wire update. `None` for kinds the engine does not handle (they still advance the offset).
pub fn update_to_domain(u: &TgUpdate) -> Option<Update> {
    if let Some(m) = u.message.as_ref().or(u.edited_message.as_ref()) {
        return message_to_domain(u.update_id, m);
    }
    let cb = u.callback_query.as_ref()?;
    // Without the originating message there is no chat to route to.
    let source = cb.message.as_ref()?;
    Some(Update {
        update_id: u.update_id,
        chat_id: source.chat.id,
        sender_id: cb.from.id,
        timestamp: source.date,
        payload: Payload::Callback {
            query_id: cb.id.clone(),
            data: cb.data.clone().unwrap_or_default(),
            message_id: Some(source.message_id),
        },
    })
}

/// Classify a failed `getUpdates` / `getMe`. 401 and 404 mean the token is wrong.
pub fn feed_error<T>(status: u16, body: Option<&ApiResponse<T>>) -> DomainError {
    let describe = |b: Option<&ApiResponse<T>>| match b {
        Some(b) => b.describe(status),
        None => format!("HTTP {}", status),
    };
    match status {
        401 | 404 => DomainError::Auth(describe(body)),
        429 => DomainError::RateLimited {
            retry_after: body.map_or(DEFAULT_RETRY_AFTER, |b| b.retry_after()),
        },
        // 409: another poller or a webhook holds the updates; usually clears up.
        409 | 500..=599 => DomainError::Transport(describe(body)),
        _ => DomainError::Remote(describe(body)),
    }
}

/// Classify a send reply.
pub fn send_outcome(status: u16, body: Option<&ApiResponse<Value>>) -> SendOutcome {
    if (200..300).contains(&status) && body.is_some_and(|b| b.ok) {
        return SendOutcome::Accepted;
    }
    let describe = || body.map_or_else(|| format!("HTTP {}", status), |b| b.describe(status));
    match status {
        429 => SendOutcome::RateLimited {
            retry_after: body.map_or(DEFAULT_RETRY_AFTER, |b| b.retry_after()),
        },
        500..=599 => SendOutcome::TransientError(describe()),
        // 2xx with ok=false or an unparseable body.
        200..=299 => SendOutcome::TransientError(describe()),
        _ => SendOutcome::PermanentError(describe()),
    }
}

/// Bot API method and JSON body for an action.
pub fn action_request(chat_id: i64, action: &ActionPayload) -> (&'static str, Value) {
    match action {
        ActionPayload::Message { text } => ("sendMessage", json!({ "chat_id": chat_id, "text": text })),
        ActionPayload::Edit { message_id, text } => (
            "editMessageText",
            json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
        ),
        ActionPayload::CallbackAnswer { query_id, text } => {
            let mut body = json!({ "callback_query_id": query_id });
            if let Some(text) = text {
                body["text"] = json!(text);
            }
            ("answerCallbackQuery", body)
        }
        ActionPayload::Media { media } => {
            let (method, field) = match media.media_type {
                MediaType::Photo => ("sendPhoto", "photo"),
                MediaType::Video => ("sendVideo", "video"),
                MediaType::Audio => ("sendAudio", "audio"),
                MediaType::Voice => ("sendVoice", "voice"),
                MediaType::Sticker => ("sendSticker", "sticker"),
                MediaType::Document | MediaType::Other => ("sendDocument", "document"),
            };
            let mut body = json!({ "chat_id": chat_id });
            body[field] = json!(media.file_id);
            if let Some(caption) = &media.caption {
                body["caption"] = json!(caption);
            }
            (method, body)
        }
    }
}
