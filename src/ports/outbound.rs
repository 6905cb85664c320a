//! Outbound ports. The engine calls into infrastructure.
//!
//! Implemented by adapters.

use crate::domain::{ChatId, DomainError, OutboundAction, Session, UpdateId, UserId};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Result of one delivery attempt to the remote messaging platform.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Accepted,
    RateLimited { retry_after: Duration },
    TransientError(String),
    PermanentError(String),
}

impl From<DomainError> for SendOutcome {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::RateLimited { retry_after } => SendOutcome::RateLimited { retry_after },
            DomainError::Transport(msg) => SendOutcome::TransientError(msg),
            other => SendOutcome::PermanentError(other.to_string()),
        }
    }
}

/// Remote delivery boundary. The only contact point with the messaging platform for sends.
#[async_trait::async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, chat_id: ChatId, action: &OutboundAction) -> SendOutcome;
}

/// Predicate telling the store whether a chat has work in flight.
pub type InFlightCheck<'a> = &'a (dyn Fn(ChatId) -> bool + Send + Sync);

/// Per-chat session storage with optimistic concurrency.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the chat's session, creating a default one (version 0) on first access.
    async fn get_or_create(&self, chat_id: ChatId) -> Result<Session, DomainError>;

    /// Replace the stored session if its version equals `expected_version`.
    /// The stored copy gets `version = expected_version + 1`.
    /// Returns `false` on conflict, including when the session was evicted meanwhile.
    async fn compare_and_swap(
        &self,
        chat_id: ChatId,
        expected_version: u64,
        new: Session,
    ) -> Result<bool, DomainError>;

    /// Remove sessions idle since before `cutoff` whose chat has nothing in flight.
    /// Returns the evicted chat ids.
    async fn evict_idle(
        &self,
        cutoff: DateTime<Utc>,
        in_flight: InFlightCheck<'_>,
    ) -> Result<Vec<ChatId>, DomainError>;

    async fn len(&self) -> usize;
}

/// Persisted per-user API credentials (the bot's onboarding result).
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    async fn save_api_key(&self, user_id: UserId, api_key: &str) -> Result<(), DomainError>;

    async fn api_key(&self, user_id: UserId) -> Result<Option<String>, DomainError>;
}

/// Durable acknowledged-update watermark, so a restart resumes where processing stopped.
#[async_trait::async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self) -> Result<Option<UpdateId>, DomainError>;

    async fn store(&self, watermark: UpdateId) -> Result<(), DomainError>;
}

/// Backend answering free-text queries for configured users.
#[async_trait::async_trait]
pub trait Assistant: Send + Sync {
    async fn answer(&self, api_key: &str, query: &str, thread_id: &str) -> Result<String, DomainError>;

    /// Release backend sessions. Called once after the engine stops.
    async fn shutdown(&self) -> Result<(), DomainError> {
        Ok(())
    }
}
