//! Telegram Bot API over HTTPS. Long-poll update feed and message delivery.
//!
//! The token is part of every URL, so transport errors are logged without URLs.

use super::mapper::{self, ApiResponse, TgUpdate};
use crate::domain::{ChatId, DomainError, OutboundAction, UpdateId};
use crate::ports::{FeedBatch, Messenger, SendOutcome, UpdateFeed};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Slack on top of the long-poll wait before the HTTP request itself times out.
const POLL_SLACK: Duration = Duration::from_secs(10);

#[derive(serde::Deserialize)]
struct BotUser {
    id: i64,
    username: Option<String>,
}

pub struct TelegramBotApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
    request_timeout: Duration,
}

impl TelegramBotApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Per-request timeout for sends and `getMe`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    /// POST a method call. Returns the HTTP status and the parsed envelope (if it parsed).
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<(u16, Option<ApiResponse<T>>), reqwest::Error> {
        let response = self
            .client
            .post(self.method_url(method))
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let parsed = serde_json::from_str::<ApiResponse<T>>(&text).ok();
        if parsed.is_none() {
            warn!(method, status, body_len = text.len(), "unparseable Bot API reply");
        }
        Ok((status, parsed))
    }
}

fn transport(e: reqwest::Error) -> DomainError {
    DomainError::Transport(e.without_url().to_string())
}

#[async_trait::async_trait]
impl UpdateFeed for TelegramBotApi {
    async fn connect(&self) -> Result<(), DomainError> {
        let (status, body) = self
            .call::<BotUser>("getMe", &json!({}), self.request_timeout)
            .await
            .map_err(transport)?;
        match body {
            Some(ApiResponse {
                ok: true,
                result: Some(me),
                ..
            }) => {
                info!(bot_id = me.id, username = ?me.username, "connected to Bot API");
                Ok(())
            }
            other => Err(mapper::feed_error(status, other.as_ref())),
        }
    }

    async fn fetch(&self, offset: Option<UpdateId>, wait: Duration) -> Result<FeedBatch, DomainError> {
        let mut params = json!({
            "timeout": wait.as_secs(),
            "allowed_updates": ["message", "edited_message", "callback_query"],
        });
        if let Some(offset) = offset {
            params["offset"] = json!(offset);
        }
        let (status, body) = self
            .call::<Vec<TgUpdate>>("getUpdates", &params, wait + POLL_SLACK)
            .await
            .map_err(transport)?;
        let raw = match body {
            Some(ApiResponse {
                ok: true,
                result: Some(updates),
                ..
            }) => updates,
            other => return Err(mapper::feed_error(status, other.as_ref())),
        };

        let highest_seen = raw.iter().map(|u| u.update_id).max();
        let updates: Vec<_> = raw.iter().filter_map(mapper::update_to_domain).collect();
        if raw.len() != updates.len() {
            debug!(skipped = raw.len() - updates.len(), "skipped unsupported update kinds");
        }
        Ok(FeedBatch {
            updates,
            highest_seen,
        })
    }
}

#[async_trait::async_trait]
impl Messenger for TelegramBotApi {
    async fn send(&self, chat_id: ChatId, action: &OutboundAction) -> SendOutcome {
        let (method, body) = mapper::action_request(chat_id, &action.payload);
        match self.call::<Value>(method, &body, self.request_timeout).await {
            Ok((status, reply)) => mapper::send_outcome(status, reply.as_ref()),
            Err(e) => SendOutcome::TransientError(e.without_url().to_string()),
        }
    }
}
