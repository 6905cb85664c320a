//! Outbound dispatcher: per-chat ordered delivery with retries and rate-limit pauses.
//!
//! - One lane per chat drains that chat's actions in order
//! - At most `concurrency` delivery attempts run at once across chats
//! - `RateLimited` pauses only the affected chat's lane
//! - Transient failures back off exponentially, then the action is marked failed
//! - Idempotency keys are remembered so a retried/redelivered action is sent once

use crate::domain::{ChatId, OutboundAction};
use crate::ports::{Messenger, SendOutcome};
use crate::shared::{EngineMetrics, OutboundPolicy};
use crate::usecases::lanes::{LaneWorker, Lanes};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Consecutive rate-limit pauses tolerated for one action before it is failed.
const MAX_RATE_LIMIT_PAUSES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Queued,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct KeyEntry {
    status: KeyStatus,
    at: Instant,
}

struct DeliveryWorker {
    messenger: Arc<dyn Messenger>,
    policy: OutboundPolicy,
    permits: Semaphore,
    keys: Arc<DashMap<String, KeyEntry>>,
    metrics: Arc<EngineMetrics>,
}

impl DeliveryWorker {
    fn mark(&self, key: &str, status: KeyStatus) {
        self.keys.insert(
            key.to_string(),
            KeyEntry {
                status,
                at: Instant::now(),
            },
        );
    }

    async fn attempt(&self, chat_id: ChatId, action: &OutboundAction) -> SendOutcome {
        // Permit is held only for the attempt itself, never across a pause.
        let _permit = self.permits.acquire().await.ok();
        match tokio::time::timeout(self.policy.attempt_timeout, self.messenger.send(chat_id, action)).await {
            Ok(outcome) => outcome,
            Err(_) => SendOutcome::TransientError(format!(
                "attempt timed out after {:?}",
                self.policy.attempt_timeout
            )),
        }
    }

    fn give_up(&self, chat_id: ChatId, action: &OutboundAction, attempts: u32, reason: &str) {
        EngineMetrics::incr(&self.metrics.actions_failed);
        self.mark(&action.idempotency_key, KeyStatus::Failed);
        error!(
            chat_id,
            idempotency_key = %action.idempotency_key,
            kind = %action.kind(),
            attempts,
            reason,
            "outbound action permanently failed"
        );
    }
}

#[async_trait::async_trait]
impl LaneWorker<OutboundAction> for DeliveryWorker {
    async fn process(&self, chat_id: ChatId, action: OutboundAction) {
        let mut failures = 0u32;
        let mut pauses = 0u32;
        loop {
            match self.attempt(chat_id, &action).await {
                SendOutcome::Accepted => {
                    EngineMetrics::incr(&self.metrics.actions_delivered);
                    self.mark(&action.idempotency_key, KeyStatus::Delivered);
                    debug!(chat_id, idempotency_key = %action.idempotency_key, kind = %action.kind(), "delivered");
                    return;
                }
                SendOutcome::RateLimited { retry_after } => {
                    EngineMetrics::incr(&self.metrics.rate_limited);
                    pauses += 1;
                    if pauses > MAX_RATE_LIMIT_PAUSES {
                        self.give_up(chat_id, &action, failures + pauses, "rate limited too many times");
                        return;
                    }
                    warn!(chat_id, retry_after_ms = retry_after.as_millis() as u64, "rate limited; pausing chat queue");
                    tokio::time::sleep(retry_after).await;
                }
                SendOutcome::TransientError(e) => {
                    failures += 1;
                    if failures >= self.policy.max_attempts {
                        self.give_up(chat_id, &action, failures, &e);
                        return;
                    }
                    EngineMetrics::incr(&self.metrics.delivery_retries);
                    let delay = self.policy.retry.delay(failures - 1);
                    warn!(
                        chat_id,
                        idempotency_key = %action.idempotency_key,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "delivery failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                SendOutcome::PermanentError(e) => {
                    self.give_up(chat_id, &action, failures + 1, &e);
                    return;
                }
            }
        }
    }
}

pub struct Dispatcher {
    worker: Arc<DeliveryWorker>,
    lanes: Lanes<OutboundAction, DeliveryWorker>,
}

impl Dispatcher {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        policy: OutboundPolicy,
        lane_idle: Duration,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let worker = Arc::new(DeliveryWorker {
            messenger,
            permits: Semaphore::new(policy.concurrency.max(1)),
            policy,
            keys: Arc::new(DashMap::new()),
            metrics,
        });
        let lanes = Lanes::new(Arc::clone(&worker), lane_idle);
        Self { worker, lanes }
    }

    /// Queue an action behind the chat's earlier actions.
    /// Returns `false` if its idempotency key was already seen or the dispatcher is closed.
    pub fn enqueue(&self, chat_id: ChatId, action: OutboundAction) -> bool {
        let key = action.idempotency_key.clone();
        match self.worker.keys.entry(key.clone()) {
            Entry::Occupied(existing) => {
                EngineMetrics::incr(&self.worker.metrics.actions_deduplicated);
                debug!(chat_id, idempotency_key = %key, status = ?existing.get().status, "duplicate action dropped");
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(KeyEntry {
                    status: KeyStatus::Queued,
                    at: Instant::now(),
                });
            }
        }
        if self.lanes.push(chat_id, action).is_err() {
            self.worker.keys.remove(&key);
            warn!(chat_id, idempotency_key = %key, "dispatcher closed; action dropped");
            return false;
        }
        EngineMetrics::incr(&self.worker.metrics.actions_enqueued);
        true
    }

    /// Wait until everything queued for the chat has been delivered or failed.
    pub async fn flush(&self, chat_id: ChatId) {
        self.lanes.wait_idle(chat_id).await;
    }

    /// Wait until every chat's queue is empty.
    pub async fn flush_all(&self) {
        self.lanes.wait_all_idle().await;
    }

    /// Wait until every chat's queue is empty, then stop the lanes.
    pub async fn drain(&self) {
        self.lanes.wait_all_idle().await;
        self.lanes.close();
        self.lanes.wait_stopped().await;
    }

    /// Drop all queued actions and stop immediately.
    pub fn abort_all(&self) {
        self.lanes.abort_all();
    }

    pub fn key_status(&self, key: &str) -> Option<KeyStatus> {
        self.worker.keys.get(key).map(|e| e.status)
    }

    /// Forget settled keys older than the dedup TTL. Returns how many were removed.
    pub fn prune_keys(&self) -> usize {
        let ttl = self.worker.policy.dedup_ttl;
        let before = self.worker.keys.len();
        self.worker
            .keys
            .retain(|_, e| e.status == KeyStatus::Queued || e.at.elapsed() < ttl);
        before.saturating_sub(self.worker.keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ActionPayload;
    use crate::shared::Backoff;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Messenger returning scripted outcomes per chat (default: accepted).
    #[derive(Default)]
    struct Scripted {
        outcomes: Mutex<std::collections::HashMap<ChatId, VecDeque<SendOutcome>>>,
        sent: Mutex<Vec<(ChatId, String, Instant)>>,
    }

    impl Scripted {
        fn script(&self, chat_id: ChatId, outcomes: Vec<SendOutcome>) {
            self.outcomes.lock().unwrap().insert(chat_id, outcomes.into());
        }

        fn delivered(&self, chat_id: ChatId) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _, _)| *c == chat_id)
                .map(|(_, k, _)| k.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Messenger for Scripted {
        async fn send(&self, chat_id: ChatId, action: &OutboundAction) -> SendOutcome {
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .get_mut(&chat_id)
                .and_then(|q| q.pop_front())
                .unwrap_or(SendOutcome::Accepted);
            if outcome == SendOutcome::Accepted {
                self.sent
                    .lock()
                    .unwrap()
                    .push((chat_id, action.idempotency_key.clone(), Instant::now()));
            }
            outcome
        }
    }

    fn action(chat_id: ChatId, key: &str) -> OutboundAction {
        OutboundAction::new(chat_id, ActionPayload::message(key), key)
    }

    fn dispatcher(messenger: Arc<Scripted>) -> (Dispatcher, Arc<EngineMetrics>) {
        let metrics = Arc::new(EngineMetrics::default());
        let policy = OutboundPolicy {
            retry: Backoff::delivery(),
            ..OutboundPolicy::default()
        };
        (
            Dispatcher::new(messenger, policy, Duration::from_secs(60), Arc::clone(&metrics)),
            metrics,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_preserved_within_chat() {
        let m = Arc::new(Scripted::default());
        let (d, _) = dispatcher(Arc::clone(&m));
        for i in 0..5 {
            assert!(d.enqueue(1, action(1, &format!("k{i}"))));
        }
        d.flush(1).await;
        assert_eq!(m.delivered(1), vec!["k0", "k1", "k2", "k3", "k4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_key_sent_once() {
        let m = Arc::new(Scripted::default());
        let (d, metrics) = dispatcher(Arc::clone(&m));
        assert!(d.enqueue(1, action(1, "same")));
        d.flush(1).await;
        assert!(!d.enqueue(1, action(1, "same")));
        d.flush(1).await;
        assert_eq!(m.delivered(1), vec!["same"]);
        assert_eq!(metrics.snapshot().actions_deduplicated, 1);
        assert_eq!(d.key_status("same"), Some(KeyStatus::Delivered));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_after_five_attempts() {
        let m = Arc::new(Scripted::default());
        m.script(
            1,
            (0..5)
                .map(|_| SendOutcome::TransientError("502".into()))
                .collect(),
        );
        let (d, metrics) = dispatcher(Arc::clone(&m));
        let started = Instant::now();
        d.enqueue(1, action(1, "doomed"));
        d.enqueue(1, action(1, "next"));
        d.flush(1).await;
        // 500 + 1000 + 2000 + 4000 ms of backoff between the five attempts.
        assert!(started.elapsed() >= Duration::from_millis(7_500));
        let snap = metrics.snapshot();
        assert_eq!(snap.actions_failed, 1);
        assert_eq!(snap.delivery_retries, 4);
        assert_eq!(d.key_status("doomed"), Some(KeyStatus::Failed));
        // The lane is not blocked beyond the failed action.
        assert_eq!(m.delivered(1), vec!["next"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let m = Arc::new(Scripted::default());
        m.script(1, vec![SendOutcome::PermanentError("403 blocked by user".into())]);
        let (d, metrics) = dispatcher(Arc::clone(&m));
        d.enqueue(1, action(1, "a"));
        d.flush(1).await;
        assert_eq!(metrics.snapshot().actions_failed, 1);
        assert_eq!(metrics.snapshot().delivery_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_pauses_only_that_chat() {
        let m = Arc::new(Scripted::default());
        m.script(
            2,
            vec![SendOutcome::RateLimited {
                retry_after: Duration::from_secs(5),
            }],
        );
        let (d, _) = dispatcher(Arc::clone(&m));
        let started = Instant::now();
        d.enqueue(2, action(2, "c2"));
        for i in 0..3 {
            d.enqueue(3, action(3, &format!("c3-{i}")));
        }
        d.flush(3).await;
        assert_eq!(m.delivered(3).len(), 3);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(m.delivered(2).is_empty());

        d.flush(2).await;
        let sent = m.sent.lock().unwrap().clone();
        let (_, _, at) = sent.iter().find(|(c, _, _)| *c == 2).unwrap();
        assert!(at.duration_since(started) >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_forgets_settled_keys_after_ttl() {
        let m = Arc::new(Scripted::default());
        let (d, _) = dispatcher(Arc::clone(&m));
        d.enqueue(1, action(1, "old"));
        d.flush(1).await;
        assert_eq!(d.prune_keys(), 0);
        tokio::time::advance(OutboundPolicy::default().dedup_ttl + Duration::from_secs(1)).await;
        assert_eq!(d.prune_keys(), 1);
        assert_eq!(d.key_status("old"), None);
    }
}
