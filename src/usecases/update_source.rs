//! Update source: turns a raw feed into a de-duplicated, restartable stream of updates.
//!
//! - Never yields the same `update_id` twice
//! - Every fetch resumes right after the acknowledged watermark, so a feed that
//!   confirms ids below the offset (Bot API) never loses unprocessed updates
//! - Ids above the watermark may arrive in any order; only ids at or below it are stale
//! - Transient feed failures are retried with full-jitter backoff
//! - Auth/config failures are returned so the engine can halt

use crate::domain::{DomainError, Update, UpdateId};
use crate::ports::{FeedBatch, UpdateFeed, WatermarkStore};
use crate::shared::{Backoff, EngineMetrics};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest wait before polling again when a fetch returned only work still in progress.
const REDELIVERY_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct SourceState {
    /// Every id at or below is acknowledged (or was never routable).
    floor: Option<UpdateId>,
    /// Highest id the feed reported, mapped or not.
    highest_seen: Option<UpdateId>,
    /// Yielded but not yet acknowledged.
    in_flight: BTreeSet<UpdateId>,
    /// Acknowledged above the floor, held back by a lower in-flight id.
    done: BTreeSet<UpdateId>,
    /// Last watermark written to the store.
    persisted: Option<UpdateId>,
}

impl SourceState {
    fn is_stale(&self, id: UpdateId) -> bool {
        self.floor.is_some_and(|floor| id <= floor)
    }

    fn is_known(&self, id: UpdateId) -> bool {
        self.in_flight.contains(&id) || self.done.contains(&id)
    }

    /// Move the floor over everything settled below the lowest in-flight id.
    fn advance_floor(&mut self) {
        let lowest = self.in_flight.first().copied();
        let acked = match lowest {
            Some(lowest) => self.done.range(..lowest).next_back().copied(),
            None => self.done.last().copied(),
        };
        let seen = self
            .highest_seen
            .filter(|&seen| lowest.is_none_or(|lowest| seen < lowest));
        self.floor = self.floor.max(acked).max(seen);
        if let Some(floor) = self.floor {
            self.done = self.done.split_off(&(floor + 1));
        }
    }
}

pub struct UpdateSource {
    feed: Arc<dyn UpdateFeed>,
    watermarks: Option<Arc<dyn WatermarkStore>>,
    backoff: Backoff,
    poll_timeout: Duration,
    metrics: Arc<EngineMetrics>,
    state: Mutex<SourceState>,
    acked: Notify,
}

impl UpdateSource {
    pub fn new(
        feed: Arc<dyn UpdateFeed>,
        watermarks: Option<Arc<dyn WatermarkStore>>,
        backoff: Backoff,
        poll_timeout: Duration,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            feed,
            watermarks,
            backoff,
            poll_timeout,
            metrics,
            state: Mutex::new(SourceState::default()),
            acked: Notify::new(),
        }
    }

    /// Reach the feed and restore the persisted watermark.
    pub async fn connect(&self) -> Result<(), DomainError> {
        self.feed.connect().await?;
        let restored = match &self.watermarks {
            Some(store) => store.load().await?,
            None => None,
        };
        let mut state = self.state.lock().await;
        if let Some(wm) = restored {
            state.floor = state.floor.max(Some(wm));
            state.highest_seen = state.highest_seen.max(Some(wm));
            state.persisted = Some(wm);
            info!(watermark = wm, "resuming from persisted watermark");
        }
        Ok(())
    }

    /// Next batch of fresh updates, sorted by id. May be empty when the long-poll times out.
    ///
    /// Retries transient failures until `cancel` fires (`DomainError::Cancelled`).
    /// Fatal failures are returned immediately.
    pub async fn next_batch(&self, cancel: &CancellationToken) -> Result<Vec<Update>, DomainError> {
        let mut retry = 0u32;
        loop {
            let offset = self.state.lock().await.floor.map(|floor| floor + 1);
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DomainError::Cancelled),
                r = self.feed.fetch(offset, self.poll_timeout) => r,
            };
            match fetched {
                Ok(batch) => {
                    let had_content = !batch.updates.is_empty() || batch.highest_seen.is_some();
                    let (fresh, waiting) = self.admit(batch).await;
                    if fresh.is_empty() && had_content && waiting {
                        // The feed keeps returning work still in progress; poll again once it moves.
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(DomainError::Cancelled),
                            _ = self.acked.notified() => {}
                            _ = tokio::time::sleep(REDELIVERY_PAUSE) => {}
                        }
                    }
                    return Ok(fresh);
                }
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "update feed failed unrecoverably");
                    return Err(e);
                }
                Err(e) => {
                    EngineMetrics::incr(&self.metrics.source_reconnects);
                    let delay = match &e {
                        DomainError::RateLimited { retry_after } => *retry_after,
                        _ => self.backoff.jittered(retry),
                    };
                    retry = retry.saturating_add(1);
                    warn!(error = %e, retry, delay_ms = delay.as_millis() as u64, "update feed error; reconnecting");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(DomainError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Keep ids not seen before. Returns them plus whether work is still in flight.
    async fn admit(&self, batch: FeedBatch) -> (Vec<Update>, bool) {
        let mut state = self.state.lock().await;
        let mut updates = batch.updates;
        updates.sort_by_key(|u| u.update_id);
        updates.dedup_by_key(|u| u.update_id);

        let mut stale = 0u64;
        updates.retain(|u| {
            if state.is_stale(u.update_id) {
                stale += 1;
                info!(update_id = u.update_id, chat_id = u.chat_id, watermark = ?state.floor, "discarding update at or below the watermark");
                return false;
            }
            !state.is_known(u.update_id)
        });
        if stale > 0 {
            EngineMetrics::add(&self.metrics.updates_stale, stale);
        }

        let batch_max = updates.last().map(|u| u.update_id);
        state.highest_seen = state.highest_seen.max(batch.highest_seen).max(batch_max);
        state.in_flight.extend(updates.iter().map(|u| u.update_id));
        state.advance_floor();
        if let Some(first) = updates.first() {
            debug!(count = updates.len(), first = first.update_id, "fetched updates");
        }
        (updates, !state.in_flight.is_empty())
    }

    /// Mark an update as fully processed. Unknown ids are ignored.
    pub async fn acknowledge(&self, update_id: UpdateId) {
        {
            let mut state = self.state.lock().await;
            if !state.in_flight.remove(&update_id) {
                return;
            }
            state.done.insert(update_id);
            state.advance_floor();
        }
        self.acked.notify_waiters();
    }

    pub async fn watermark(&self) -> Option<UpdateId> {
        self.state.lock().await.floor
    }

    /// Persist the watermark if it moved. Storage failures are logged, not fatal.
    pub async fn checkpoint(&self) {
        let Some(store) = &self.watermarks else {
            return;
        };
        let wm = {
            let state = self.state.lock().await;
            match state.floor {
                Some(wm) if Some(wm) != state.persisted => wm,
                _ => return,
            }
        };
        match store.store(wm).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.persisted = state.persisted.max(Some(wm));
            }
            Err(e) => warn!(watermark = wm, error = %e, "failed to persist watermark"),
        }
    }
}
