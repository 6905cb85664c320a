//! Push-style feed. Whatever receives webhooks hands updates to a [`WebhookSink`];
//! the engine drains them through [`ChannelFeed`] like any other feed.
//!
//! Pushed updates may arrive out of id order, so the offset is not used to filter;
//! the update source decides what is new. Updates are gone once handed out, so a
//! restart cannot replay them.

use crate::domain::{DomainError, Update, UpdateId};
use crate::ports::{FeedBatch, UpdateFeed};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// Most updates handed out per fetch.
const MAX_BATCH: usize = 100;

/// Cloneable producer side.
#[derive(Clone)]
pub struct WebhookSink {
    tx: mpsc::Sender<Update>,
}

impl WebhookSink {
    /// Waits while the buffer is full. Fails once the feed is gone.
    pub async fn push(&self, update: Update) -> Result<(), DomainError> {
        self.tx
            .send(update)
            .await
            .map_err(|_| DomainError::Transport("update feed closed".into()))
    }
}

pub struct ChannelFeed {
    rx: Mutex<mpsc::Receiver<Update>>,
}

impl ChannelFeed {
    /// Feed plus its sink, buffering up to `capacity` updates.
    pub fn new(capacity: usize) -> (Self, WebhookSink) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                rx: Mutex::new(rx),
            },
            WebhookSink { tx },
        )
    }
}

#[async_trait::async_trait]
impl UpdateFeed for ChannelFeed {
    async fn fetch(&self, _offset: Option<UpdateId>, wait: Duration) -> Result<FeedBatch, DomainError> {
        let mut rx = self.rx.lock().await;
        let first = match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(update)) => update,
            Ok(None) => {
                // Every sink dropped: behave like an idle long-poll.
                drop(rx);
                tokio::time::sleep(wait).await;
                return Ok(FeedBatch::default());
            }
            Err(_) => return Ok(FeedBatch::default()),
        };
        let mut updates = vec![first];
        while updates.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(update) => updates.push(update),
                Err(_) => break,
            }
        }
        Ok(FeedBatch::new(updates))
    }
}
