//! Inbound port. Raw event feed the update source pulls from.

use crate::domain::{DomainError, Update, UpdateId};
use std::time::Duration;

/// One fetch from a feed.
#[derive(Debug, Default, Clone)]
pub struct FeedBatch {
    pub updates: Vec<Update>,
    /// Highest id the feed consumed, including updates it could not map (no chat, unknown kind).
    /// Those ids count as acknowledged so the watermark can move past them.
    pub highest_seen: Option<UpdateId>,
}

impl FeedBatch {
    pub fn new(updates: Vec<Update>) -> Self {
        let highest_seen = updates.iter().map(|u| u.update_id).max();
        Self {
            updates,
            highest_seen,
        }
    }
}

/// Connectivity-specific feed (long-poll endpoint, webhook sink).
///
/// May return duplicates, ids below `offset`, or ids out of order; the update source dedups.
/// A feed may treat `offset` as confirmation of every lower id; the update source only
/// passes an offset once everything below it is acknowledged.
#[async_trait::async_trait]
pub trait UpdateFeed: Send + Sync {
    /// Validate credentials / reach the platform once before RUNNING.
    async fn connect(&self) -> Result<(), DomainError> {
        Ok(())
    }

    /// Fetch the next updates with id >= `offset` (None = from wherever the feed is).
    /// Waits at most `wait` for new events.
    async fn fetch(&self, offset: Option<UpdateId>, wait: Duration) -> Result<FeedBatch, DomainError>;
}
