//! Engine core: lifecycle state machine and the per-update pipeline.
//!
//! STARTING -> RUNNING -> DRAINING -> STOPPED, or FAILED when the update
//! source reports an unrecoverable error. Each update flows through
//! session get -> route -> execute -> compare-and-swap -> enqueue -> acknowledge
//! on its chat's lane.

use crate::domain::{ChatId, DomainError, Update};
use crate::ports::{Messenger, SessionStore, UpdateFeed, WatermarkStore};
use crate::shared::{EngineConfig, EngineMetrics};
use crate::usecases::dispatcher::Dispatcher;
use crate::usecases::executor::{HandlerExecutor, failure_notice};
use crate::usecases::lanes::{LaneWorker, Lanes};
use crate::usecases::router::Router;
use crate::usecases::update_source::UpdateSource;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Failed)
    }

    /// 0 for a clean stop, 1 otherwise.
    pub fn exit_code(self) -> u8 {
        match self {
            EngineState::Stopped => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Starting => "STARTING",
            EngineState::Running => "RUNNING",
            EngineState::Draining => "DRAINING",
            EngineState::Stopped => "STOPPED",
            EngineState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Runs one update end to end on its chat's lane.
struct UpdateWorker {
    router: Arc<Router>,
    sessions: Arc<dyn SessionStore>,
    executor: HandlerExecutor,
    dispatcher: Arc<Dispatcher>,
    source: Arc<UpdateSource>,
    pool: Semaphore,
    conflict_retries: u32,
    metrics: Arc<EngineMetrics>,
}

#[async_trait::async_trait]
impl LaneWorker<Update> for UpdateWorker {
    async fn process(&self, _chat_id: ChatId, update: Update) {
        {
            let _permit = self.pool.acquire().await.ok();
            self.process_update(&update).await;
        }
        self.source.acknowledge(update.update_id).await;
    }
}

impl UpdateWorker {
    async fn process_update(&self, update: &Update) {
        let chat_id = update.chat_id;
        let update_id = update.update_id;

        for attempt in 0..=self.conflict_retries {
            let session = match self.sessions.get_or_create(chat_id).await {
                Ok(s) => s,
                Err(e) => {
                    error!(chat_id, update_id, error = %e, "session load failed");
                    self.dispatcher.enqueue(chat_id, failure_notice(update, "failure"));
                    return;
                }
            };
            if session.has_applied(update_id) {
                EngineMetrics::incr(&self.metrics.updates_duplicate);
                debug!(chat_id, update_id, "update already applied; skipping");
                return;
            }

            let expected = session.version;
            let decision = self.router.route(update, session.state);
            let Some(handler) = decision.handler() else {
                EngineMetrics::incr(&self.metrics.updates_unrouted);
                info!(chat_id, update_id, state = %session.state, "no route matched");
                return;
            };
            debug!(chat_id, update_id, route = decision.label(), state = %session.state, attempt, "dispatching");

            let execution = match self.executor.execute(Arc::clone(handler), update, session).await {
                Ok(exec) => exec,
                Err(failure) => {
                    self.dispatcher.enqueue(chat_id, failure.notice);
                    return;
                }
            };

            let mut next = execution.session;
            next.chat_id = chat_id;
            next.last_update_id = Some(update_id);
            next.last_active_at = Utc::now();
            match self.sessions.compare_and_swap(chat_id, expected, next).await {
                Ok(true) => {
                    for action in execution.actions {
                        self.dispatcher.enqueue(chat_id, action);
                    }
                    return;
                }
                Ok(false) => {
                    EngineMetrics::incr(&self.metrics.write_conflicts);
                    warn!(chat_id, update_id, attempt, "session write conflict; re-running handler");
                }
                Err(e) => {
                    error!(chat_id, update_id, error = %e, "session commit failed");
                    self.dispatcher.enqueue(chat_id, failure_notice(update, "failure"));
                    return;
                }
            }
        }

        EngineMetrics::incr(&self.metrics.conflict_exhausted);
        error!(
            chat_id,
            update_id,
            retries = self.conflict_retries,
            "write conflicts exhausted; update failed"
        );
        self.dispatcher.enqueue(chat_id, failure_notice(update, "conflict"));
    }
}

pub struct Engine {
    config: EngineConfig,
    source: Arc<UpdateSource>,
    sessions: Arc<dyn SessionStore>,
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
    lanes: Lanes<Update, UpdateWorker>,
    metrics: Arc<EngineMetrics>,
    state: watch::Sender<EngineState>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        feed: Arc<dyn UpdateFeed>,
        watermarks: Option<Arc<dyn WatermarkStore>>,
        sessions: Arc<dyn SessionStore>,
        router: Router,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        let metrics = Arc::new(EngineMetrics::default());
        let source = Arc::new(UpdateSource::new(
            feed,
            watermarks,
            config.source_backoff,
            config.poll_timeout,
            Arc::clone(&metrics),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            messenger,
            config.outbound.clone(),
            config.lane_idle,
            Arc::clone(&metrics),
        ));
        let router = Arc::new(router);
        let worker = Arc::new(UpdateWorker {
            router: Arc::clone(&router),
            sessions: Arc::clone(&sessions),
            executor: HandlerExecutor::new(config.handler_deadline, Arc::clone(&metrics)),
            dispatcher: Arc::clone(&dispatcher),
            source: Arc::clone(&source),
            pool: Semaphore::new(config.worker_pool_size.max(1)),
            conflict_retries: config.conflict_retries,
            metrics: Arc::clone(&metrics),
        });
        let lanes = Lanes::new(worker, config.lane_idle);
        let (state, _) = watch::channel(EngineState::Starting);
        Self {
            config,
            source,
            sessions,
            router,
            dispatcher,
            lanes,
            metrics,
            state,
        }
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: EngineState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, "engine state changed");
        }
    }

    /// Queue an update on its chat's lane, bypassing the feed.
    /// Returns `false` once the engine is draining.
    pub fn submit(&self, update: Update) -> bool {
        EngineMetrics::incr(&self.metrics.updates_received);
        let chat_id = update.chat_id;
        match self.lanes.push(chat_id, update) {
            Ok(()) => true,
            Err(rejected) => {
                debug!(chat_id, update_id = rejected.update_id, "engine draining; update left unacknowledged");
                false
            }
        }
    }

    /// Wait until every queued update has been processed and its actions settled.
    pub async fn settle(&self) {
        self.lanes.wait_all_idle().await;
        self.dispatcher.flush_all().await;
    }

    /// Evict idle sessions whose chats have nothing in flight. Returns how many were removed.
    pub async fn sweep_once(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let Some(cutoff) = Utc::now().checked_sub_signed(ttl) else {
            return 0;
        };
        let busy = |chat_id: ChatId| self.lanes.is_busy(chat_id);
        let evicted = match self.sessions.evict_idle(cutoff, &busy).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "session sweep failed");
                return 0;
            }
        };
        let pruned = self.dispatcher.prune_keys();
        if !evicted.is_empty() || pruned > 0 {
            EngineMetrics::add(&self.metrics.sessions_evicted, evicted.len() as u64);
            info!(evicted = evicted.len(), pruned_keys = pruned, "sweep complete");
        }
        evicted.len()
    }

    async fn sweep_loop(&self) {
        let period = self.config.sweep_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// Run until `shutdown` fires (-> STOPPED) or the feed fails for good (-> FAILED).
    pub async fn run(&self, shutdown: CancellationToken) -> EngineState {
        self.set_state(EngineState::Starting);
        match self.connect(&shutdown).await {
            Ok(()) => {}
            Err(DomainError::Cancelled) => {
                self.set_state(EngineState::Stopped);
                return EngineState::Stopped;
            }
            Err(e) => {
                error!(error = %e, "engine failed to start");
                self.set_state(EngineState::Failed);
                return EngineState::Failed;
            }
        }
        let sessions = self.sessions.len().await;
        info!(
            routes = self.router.route_count(),
            sessions,
            workers = self.config.worker_pool_size,
            "engine running"
        );
        self.set_state(EngineState::Running);

        let outcome = tokio::select! {
            r = self.pump(&shutdown) => r,
            _ = self.sweep_loop() => Ok(()),
        };

        self.set_state(EngineState::Draining);
        self.drain().await;
        self.source.checkpoint().await;

        let snapshot = self.metrics.snapshot();
        let watermark = self.source.watermark().await;
        let last = match outcome {
            Ok(()) => EngineState::Stopped,
            Err(e) => {
                error!(error = %e, "update source failed unrecoverably");
                EngineState::Failed
            }
        };
        info!(metrics = ?snapshot, watermark = ?watermark, "engine stopped");
        self.set_state(last);
        last
    }

    async fn connect(&self, shutdown: &CancellationToken) -> Result<(), DomainError> {
        let mut retry = 0u32;
        loop {
            let connected = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(DomainError::Cancelled),
                r = self.source.connect() => r,
            };
            match connected {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let delay = self.config.source_backoff.jittered(retry);
                    retry = retry.saturating_add(1);
                    warn!(error = %e, retry, delay_ms = delay.as_millis() as u64, "connect failed; retrying");
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Err(DomainError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Pull batches and fan them out to lanes. `Ok` on shutdown, `Err` on a fatal feed error.
    async fn pump(&self, shutdown: &CancellationToken) -> Result<(), DomainError> {
        loop {
            match self.source.next_batch(shutdown).await {
                Ok(updates) => {
                    for update in updates {
                        self.submit(update);
                    }
                    self.source.checkpoint().await;
                }
                Err(DomainError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Let in-flight work finish within the grace period, then force-stop.
    async fn drain(&self) {
        self.lanes.close();
        let graceful = tokio::time::timeout(self.config.drain_grace, async {
            self.lanes.wait_stopped().await;
            self.dispatcher.drain().await;
        })
        .await;
        if graceful.is_err() {
            warn!(
                grace_secs = self.config.drain_grace.as_secs(),
                "drain grace period elapsed; aborting remaining work"
            );
            self.lanes.abort_all();
            self.dispatcher.abort_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(EngineState::Stopped.exit_code(), 0);
        assert_eq!(EngineState::Failed.exit_code(), 1);
        assert!(EngineState::Failed.is_terminal());
        assert!(!EngineState::Draining.is_terminal());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(EngineState::Draining.to_string(), "DRAINING");
    }
}
