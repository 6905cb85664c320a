//! Shared test doubles for engine scenarios.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tg_lanes::adapters::persistence::InMemorySessionStore;
use tg_lanes::domain::{
    ActionPayload, ChatId, DomainError, OutboundAction, Payload, Session, Update, UpdateId,
};
use tg_lanes::ports::{
    FeedBatch, InFlightCheck, Messenger, SendOutcome, SessionStore, UpdateFeed, WatermarkStore,
};
use tg_lanes::shared::EngineConfig;
use tokio::time::Instant;

pub fn update(update_id: UpdateId, chat_id: ChatId, text: &str) -> Update {
    Update {
        update_id,
        chat_id,
        sender_id: chat_id * 10,
        timestamp: 1_700_000_000,
        payload: Payload::from_text(text),
    }
}

/// Defaults with lanes that outlive any test.
pub fn config() -> EngineConfig {
    EngineConfig {
        lane_idle: Duration::from_secs(3600),
        ..EngineConfig::default()
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub chat_id: ChatId,
    pub key: String,
    pub payload: ActionPayload,
    pub at: Instant,
}

/// Records accepted sends. Per-chat outcomes can be scripted; unscripted sends are accepted.
#[derive(Default)]
pub struct RecordingMessenger {
    script: Mutex<HashMap<ChatId, VecDeque<SendOutcome>>>,
    delivered: Mutex<Vec<Delivery>>,
}

impl RecordingMessenger {
    pub fn script(&self, chat_id: ChatId, outcomes: Vec<SendOutcome>) {
        self.script.lock().unwrap().insert(chat_id, outcomes.into());
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn for_chat(&self, chat_id: ChatId) -> Vec<Delivery> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.chat_id == chat_id)
            .collect()
    }

    pub fn texts(&self, chat_id: ChatId) -> Vec<String> {
        self.for_chat(chat_id)
            .into_iter()
            .filter_map(|d| match d.payload {
                ActionPayload::Message { text } => Some(text),
                ActionPayload::Edit { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Poll until at least `n` sends were accepted.
    pub async fn wait_for(&self, n: usize) {
        while self.delivered.lock().unwrap().len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait::async_trait]
impl Messenger for RecordingMessenger {
    async fn send(&self, chat_id: ChatId, action: &OutboundAction) -> SendOutcome {
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&chat_id)
            .and_then(|q| q.pop_front());
        let outcome = scripted.unwrap_or(SendOutcome::Accepted);
        if outcome == SendOutcome::Accepted {
            self.delivered.lock().unwrap().push(Delivery {
                chat_id,
                key: action.idempotency_key.clone(),
                payload: action.payload.clone(),
                at: Instant::now(),
            });
        }
        outcome
    }
}

/// Feed replaying scripted fetch results, then idling like an empty long-poll.
#[derive(Default)]
pub struct ScriptedFeed {
    connect_error: Option<DomainError>,
    script: Mutex<VecDeque<Result<FeedBatch, DomainError>>>,
}

impl ScriptedFeed {
    pub fn new(script: Vec<Result<FeedBatch, DomainError>>) -> Self {
        Self {
            connect_error: None,
            script: Mutex::new(script.into()),
        }
    }

    pub fn failing_connect(error: DomainError) -> Self {
        Self {
            connect_error: Some(error),
            script: Mutex::new(VecDeque::new()),
        }
    }
}

#[async_trait::async_trait]
impl UpdateFeed for ScriptedFeed {
    async fn connect(&self) -> Result<(), DomainError> {
        match &self.connect_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn fetch(&self, _offset: Option<UpdateId>, wait: Duration) -> Result<FeedBatch, DomainError> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(r) => r,
            None => {
                tokio::time::sleep(wait).await;
                Ok(FeedBatch::default())
            }
        }
    }
}

/// Feed with Bot API offset semantics: fetching with `offset` confirms, and forgets,
/// every id below it. Everything else is returned again on each fetch.
pub struct ConfirmingFeed {
    held: Mutex<Vec<Update>>,
}

impl ConfirmingFeed {
    pub fn new(updates: Vec<Update>) -> Self {
        Self {
            held: Mutex::new(updates),
        }
    }

    pub fn remaining(&self) -> Vec<UpdateId> {
        self.held.lock().unwrap().iter().map(|u| u.update_id).collect()
    }
}

#[async_trait::async_trait]
impl UpdateFeed for ConfirmingFeed {
    async fn fetch(&self, offset: Option<UpdateId>, wait: Duration) -> Result<FeedBatch, DomainError> {
        let held = {
            let mut held = self.held.lock().unwrap();
            if let Some(offset) = offset {
                held.retain(|u| u.update_id >= offset);
            }
            held.clone()
        };
        if held.is_empty() {
            tokio::time::sleep(wait).await;
            return Ok(FeedBatch::default());
        }
        Ok(FeedBatch::new(held))
    }
}

/// Session store whose first `conflicts` compare-and-swaps report a conflict.
pub struct ConflictingStore {
    pub inner: InMemorySessionStore,
    conflicts: AtomicU32,
}

impl ConflictingStore {
    pub fn new(conflicts: u32) -> Self {
        Self {
            inner: InMemorySessionStore::new(),
            conflicts: AtomicU32::new(conflicts),
        }
    }
}

#[async_trait::async_trait]
impl SessionStore for ConflictingStore {
    async fn get_or_create(&self, chat_id: ChatId) -> Result<Session, DomainError> {
        self.inner.get_or_create(chat_id).await
    }

    async fn compare_and_swap(
        &self,
        chat_id: ChatId,
        expected_version: u64,
        new: Session,
    ) -> Result<bool, DomainError> {
        let conflicted = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            return Ok(false);
        }
        self.inner.compare_and_swap(chat_id, expected_version, new).await
    }

    async fn evict_idle(
        &self,
        cutoff: DateTime<Utc>,
        in_flight: InFlightCheck<'_>,
    ) -> Result<Vec<ChatId>, DomainError> {
        self.inner.evict_idle(cutoff, in_flight).await
    }

    async fn len(&self) -> usize {
        self.inner.len().await
    }
}

#[derive(Default)]
pub struct MemoryWatermarks {
    value: Mutex<Option<UpdateId>>,
}

impl MemoryWatermarks {
    pub fn get(&self) -> Option<UpdateId> {
        *self.value.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl WatermarkStore for MemoryWatermarks {
    async fn load(&self) -> Result<Option<UpdateId>, DomainError> {
        Ok(self.get())
    }

    async fn store(&self, watermark: UpdateId) -> Result<(), DomainError> {
        *self.value.lock().unwrap() = Some(watermark);
        Ok(())
    }
}
