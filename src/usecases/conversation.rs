//! Bundled conversation: onboarding (name, API key), help, cancel and assistant queries.
//!
//! Plugged into the engine as an ordinary [`Router`]; nothing in the engine
//! depends on these handlers.

use crate::domain::{ActionPayload, HandlerError, Payload, Session, StateTag, Update};
use crate::ports::{Assistant, CredentialStore, Handler, HandlerOutput};
use crate::usecases::router::{Route, Router};
use std::sync::Arc;
use tracing::info;

pub const HELP_TEXT: &str = "I'm an assistant bot. Here is what I can do:\n\n\
/start - set up your profile and API key\n\
/help - show this message\n\
/cancel - cancel the current operation\n\n\
Once your API key is saved, just send me a request in plain language.";

pub const START_PROMPT: &str = "Hi! Let's get you set up. What should I call you?";
pub const CANCELLED: &str = "Action cancelled.";
pub const INVALID_KEY: &str = "That doesn't look like a valid API key. It should be 64 hexadecimal characters.";
pub const KEY_SAVED: &str = "Your API key has been saved! You can now send me requests.";
pub const NO_KEY: &str = "Your API key is not configured yet. Use /start to add it.";
pub const PROCESSING: &str = "Processing your request";
pub const UNKNOWN_COMMAND: &str = "Unknown command. Use /help.";
pub const UNSUPPORTED: &str = "I can only handle text messages. Use /help.";

/// Callback data of the inline "cancel" button.
pub const CANCEL_CALLBACK: &str = "cancel";

const NAME_ATTR: &str = "name";

/// Personal API tokens are 64 hex characters.
pub fn is_valid_api_key(key: &str) -> bool {
    key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit())
}

/// Back to READY when the user already has a key, otherwise to NEW with onboarding data cleared.
async fn reset(
    credentials: &dyn CredentialStore,
    update: &Update,
    mut session: Session,
) -> Result<Session, HandlerError> {
    if credentials.api_key(update.sender_id).await?.is_some() {
        session.state = StateTag::Ready;
    } else {
        session.state = StateTag::New;
        session.remove_attr(NAME_ATTR);
    }
    Ok(session)
}

struct Start;

#[async_trait::async_trait]
impl Handler for Start {
    async fn handle(&self, update: &Update, mut session: Session) -> Result<HandlerOutput, HandlerError> {
        info!(chat_id = update.chat_id, user_id = update.sender_id, "onboarding started");
        session.state = StateTag::AwaitingName;
        Ok(HandlerOutput::new(session).reply(START_PROMPT))
    }
}

struct Help;

#[async_trait::async_trait]
impl Handler for Help {
    async fn handle(&self, _update: &Update, session: Session) -> Result<HandlerOutput, HandlerError> {
        Ok(HandlerOutput::new(session).reply(HELP_TEXT))
    }
}

struct Cancel {
    credentials: Arc<dyn CredentialStore>,
}

#[async_trait::async_trait]
impl Handler for Cancel {
    async fn handle(&self, update: &Update, session: Session) -> Result<HandlerOutput, HandlerError> {
        info!(chat_id = update.chat_id, user_id = update.sender_id, "action cancelled");
        let session = reset(self.credentials.as_ref(), update, session).await?;
        Ok(HandlerOutput::new(session).reply(CANCELLED))
    }
}

/// Inline "cancel" button: acknowledge the press and rewrite the keyboard message.
struct CancelButton {
    credentials: Arc<dyn CredentialStore>,
}

#[async_trait::async_trait]
impl Handler for CancelButton {
    async fn handle(&self, update: &Update, session: Session) -> Result<HandlerOutput, HandlerError> {
        let Payload::Callback {
            query_id,
            message_id,
            ..
        } = &update.payload
        else {
            return Err(HandlerError::Unexpected("cancel button routed without a callback".into()));
        };
        let session = reset(self.credentials.as_ref(), update, session).await?;
        let mut out = HandlerOutput::new(session).with(ActionPayload::CallbackAnswer {
            query_id: query_id.clone(),
            text: None,
        });
        if let Some(message_id) = *message_id {
            out = out.with(ActionPayload::Edit {
                message_id,
                text: "Cancelled.".to_string(),
            });
        }
        Ok(out)
    }
}

struct Name;

#[async_trait::async_trait]
impl Handler for Name {
    async fn handle(&self, update: &Update, mut session: Session) -> Result<HandlerOutput, HandlerError> {
        let name = update.text().unwrap_or_default().trim();
        if name.is_empty() {
            return Ok(HandlerOutput::new(session).reply(START_PROMPT));
        }
        let prompt = format!(
            "Nice to meet you, {name}! Now send me your personal API token (64 hexadecimal characters)."
        );
        session.set_attr(NAME_ATTR, name);
        session.state = StateTag::AwaitingApiKey;
        Ok(HandlerOutput::new(session).reply(prompt))
    }
}

struct ApiKey {
    credentials: Arc<dyn CredentialStore>,
}

#[async_trait::async_trait]
impl Handler for ApiKey {
    async fn handle(&self, update: &Update, mut session: Session) -> Result<HandlerOutput, HandlerError> {
        let key = update.text().unwrap_or_default().trim();
        if !is_valid_api_key(key) {
            return Ok(HandlerOutput::new(session).reply(INVALID_KEY));
        }
        self.credentials.save_api_key(update.sender_id, key).await?;
        info!(chat_id = update.chat_id, user_id = update.sender_id, "API key saved");
        session.state = StateTag::Ready;
        Ok(HandlerOutput::new(session).reply(KEY_SAVED))
    }
}

struct Query {
    credentials: Arc<dyn CredentialStore>,
    assistant: Arc<dyn Assistant>,
}

#[async_trait::async_trait]
impl Handler for Query {
    async fn handle(&self, update: &Update, mut session: Session) -> Result<HandlerOutput, HandlerError> {
        let Some(api_key) = self.credentials.api_key(update.sender_id).await? else {
            return Ok(HandlerOutput::new(session).reply(NO_KEY));
        };
        let query = update.text().unwrap_or_default();
        info!(chat_id = update.chat_id, user_id = update.sender_id, query_len = query.len(), "assistant query");
        let thread_id = update.sender_id.to_string();
        let answer = self.assistant.answer(&api_key, query, &thread_id).await?;
        // A key saved outside onboarding (e.g. another chat) still makes this chat READY.
        session.state = StateTag::Ready;
        Ok(HandlerOutput::new(session).reply(PROCESSING).reply(answer))
    }
}

struct Fallback;

#[async_trait::async_trait]
impl Handler for Fallback {
    async fn handle(&self, update: &Update, session: Session) -> Result<HandlerOutput, HandlerError> {
        let reply = match update.payload {
            Payload::Command { .. } => UNKNOWN_COMMAND,
            _ => UNSUPPORTED,
        };
        Ok(HandlerOutput::new(session).reply(reply))
    }
}

/// Routes of the bundled conversation, in evaluation order.
pub fn router(credentials: Arc<dyn CredentialStore>, assistant: Arc<dyn Assistant>) -> Router {
    Router::new()
        .with(Route::command(
            "cancel",
            Arc::new(Cancel {
                credentials: Arc::clone(&credentials),
            }),
        ))
        .with(Route::command("start", Arc::new(Start)))
        .with(Route::command("help", Arc::new(Help)))
        .with(Route::text("name", Arc::new(Name)).in_state(StateTag::AwaitingName))
        .with(
            Route::text(
                "api key",
                Arc::new(ApiKey {
                    credentials: Arc::clone(&credentials),
                }),
            )
            .in_state(StateTag::AwaitingApiKey),
        )
        .with(Route::callback(
            "cancel button",
            Some(CANCEL_CALLBACK),
            Arc::new(CancelButton {
                credentials: Arc::clone(&credentials),
            }),
        ))
        .with(Route::text(
            "query",
            Arc::new(Query {
                credentials,
                assistant,
            }),
        ))
        .fallback(Arc::new(Fallback))
}
