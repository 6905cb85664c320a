//! Per-chat sequential lanes.
//!
//! Every chat gets one FIFO queue drained by exactly one task, so work for a
//! chat never interleaves while different chats run concurrently. Lane tasks
//! are spawned on first use and torn down after sitting idle.
//!
//! Used by the engine (updates) and by the outbound dispatcher (actions).

use crate::domain::ChatId;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

/// Work performed for one queued item of a chat.
#[async_trait::async_trait]
pub trait LaneWorker<T: Send + 'static>: Send + Sync + 'static {
    async fn process(&self, chat_id: ChatId, item: T);
}

struct Lane<T> {
    tx: mpsc::UnboundedSender<T>,
    /// Items queued or in progress. Incremented under the map entry lock.
    pending: Arc<watch::Sender<usize>>,
    abort: Option<AbortHandle>,
}

/// Set of per-chat lanes sharing one worker.
pub struct Lanes<T, W> {
    map: Arc<DashMap<ChatId, Lane<T>>>,
    worker: Arc<W>,
    idle: Duration,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl<T, W> Lanes<T, W>
where
    T: Send + 'static,
    W: LaneWorker<T>,
{
    pub fn new(worker: Arc<W>, idle: Duration) -> Self {
        Self {
            map: Arc::new(DashMap::new()),
            worker,
            idle,
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Queue `item` on the chat's lane, spawning the lane if needed.
    /// Returns the item back once the lanes are closed.
    pub fn push(&self, chat_id: ChatId, item: T) -> Result<(), T> {
        if self.stop.is_cancelled() {
            return Err(item);
        }
        let mut entry = self.map.entry(chat_id).or_insert_with(|| self.spawn_lane(chat_id));
        entry.pending.send_modify(|n| *n += 1);
        if let Err(mpsc::error::SendError(item)) = entry.tx.send(item) {
            // Lane task already gone (aborted); replace it and retry once.
            entry.pending.send_modify(|n| *n = n.saturating_sub(1));
            *entry = self.spawn_lane(chat_id);
            entry.pending.send_modify(|n| *n += 1);
            if let Err(mpsc::error::SendError(item)) = entry.tx.send(item) {
                entry.pending.send_modify(|n| *n = n.saturating_sub(1));
                return Err(item);
            }
        }
        Ok(())
    }

    fn spawn_lane(&self, chat_id: ChatId) -> Lane<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);
        let pending = Arc::new(pending);
        let handle = self.tracker.spawn(run_lane(
            chat_id,
            rx,
            Arc::clone(&pending),
            Arc::clone(&self.worker),
            Arc::clone(&self.map),
            self.idle,
            self.stop.clone(),
        ));
        debug!(chat_id, "lane started");
        Lane {
            tx,
            pending,
            abort: Some(handle.abort_handle()),
        }
    }

    /// True when the chat has queued or running work.
    pub fn is_busy(&self, chat_id: ChatId) -> bool {
        self.map
            .get(&chat_id)
            .is_some_and(|lane| *lane.pending.borrow() > 0)
    }

    pub fn active_lanes(&self) -> usize {
        self.map.len()
    }

    /// Wait until the chat's lane has nothing queued or running.
    pub async fn wait_idle(&self, chat_id: ChatId) {
        let rx = self.map.get(&chat_id).map(|lane| lane.pending.subscribe());
        if let Some(mut rx) = rx {
            // Sender dropped means the lane is gone, which is idle too.
            let _ = rx.wait_for(|n| *n == 0).await;
        }
    }

    /// Wait until every lane is idle.
    pub async fn wait_all_idle(&self) {
        loop {
            let receivers: Vec<_> = self
                .map
                .iter()
                .filter(|lane| *lane.pending.borrow() > 0)
                .map(|lane| lane.pending.subscribe())
                .collect();
            if receivers.is_empty() {
                return;
            }
            for mut rx in receivers {
                let _ = rx.wait_for(|n| *n == 0).await;
            }
        }
    }

    /// Stop accepting work. Lanes finish the item they are on, drop the rest, and exit.
    pub fn close(&self) {
        self.stop.cancel();
        self.tracker.close();
    }

    /// Wait for all lane tasks to exit. Call after [`Lanes::close`].
    pub async fn wait_stopped(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Abort every lane task immediately.
    pub fn abort_all(&self) {
        self.stop.cancel();
        self.tracker.close();
        let chats: Vec<ChatId> = self.map.iter().map(|lane| *lane.key()).collect();
        for chat_id in chats {
            if let Some((_, lane)) = self.map.remove(&chat_id) {
                if let Some(abort) = lane.abort {
                    abort.abort();
                }
                lane.pending.send_replace(0);
            }
        }
    }
}

async fn run_lane<T, W>(
    chat_id: ChatId,
    mut rx: mpsc::UnboundedReceiver<T>,
    pending: Arc<watch::Sender<usize>>,
    worker: Arc<W>,
    map: Arc<DashMap<ChatId, Lane<T>>>,
    idle: Duration,
    stop: CancellationToken,
) where
    T: Send + 'static,
    W: LaneWorker<T>,
{
    let is_self = |lane: &Lane<T>| Arc::ptr_eq(&lane.pending, &pending);
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            received = tokio::time::timeout(idle, rx.recv()) => match received {
                Ok(item) => item,
                Err(_) => {
                    // Remove only if still ours and nothing was pushed meanwhile.
                    let removed = map
                        .remove_if(&chat_id, |_, lane| is_self(lane) && *lane.pending.borrow() == 0)
                        .is_some();
                    if removed {
                        trace!(chat_id, "lane idle, torn down");
                        return;
                    }
                    continue;
                }
            },
        };
        let Some(item) = next else {
            break;
        };
        worker.process(chat_id, item).await;
        pending.send_modify(|n| *n = n.saturating_sub(1));
    }
    map.remove_if(&chat_id, |_, lane| is_self(lane));
    pending.send_replace(0);
    debug!(chat_id, "lane stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<(ChatId, u32)>>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl LaneWorker<u32> for Recorder {
        async fn process(&self, chat_id: ChatId, item: u32) {
            tokio::time::sleep(self.delay).await;
            self.seen.lock().unwrap().push((chat_id, item));
        }
    }

    fn recorder(delay_ms: u64) -> Arc<Recorder> {
        Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            delay: Duration::from_millis(delay_ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_processed_in_push_order_per_chat() {
        let worker = recorder(5);
        let lanes = Lanes::new(Arc::clone(&worker), Duration::from_secs(1));
        for i in 0..10 {
            lanes.push(1, i).unwrap();
            lanes.push(2, 100 + i).unwrap();
        }
        lanes.wait_all_idle().await;
        let seen = worker.seen.lock().unwrap().clone();
        let chat1: Vec<u32> = seen.iter().filter(|(c, _)| *c == 1).map(|(_, i)| *i).collect();
        let chat2: Vec<u32> = seen.iter().filter(|(c, _)| *c == 2).map(|(_, i)| *i).collect();
        assert_eq!(chat1, (0..10).collect::<Vec<_>>());
        assert_eq!(chat2, (100..110).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_lane_is_torn_down_and_respawned() {
        let worker = recorder(0);
        let lanes = Lanes::new(Arc::clone(&worker), Duration::from_millis(50));
        lanes.push(7, 1).unwrap();
        lanes.wait_idle(7).await;
        assert_eq!(lanes.active_lanes(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(lanes.active_lanes(), 0);
        lanes.push(7, 2).unwrap();
        lanes.wait_idle(7).await;
        assert_eq!(worker.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_lanes_reject_and_finish_current_item() {
        let worker = recorder(100);
        let lanes = Lanes::new(Arc::clone(&worker), Duration::from_secs(1));
        lanes.push(1, 1).unwrap();
        lanes.push(1, 2).unwrap();
        // Let the lane pick up the first item.
        tokio::time::sleep(Duration::from_millis(10)).await;
        lanes.close();
        assert_eq!(lanes.push(1, 3), Err(3));
        lanes.wait_stopped().await;
        assert_eq!(*worker.seen.lock().unwrap(), vec![(1, 1)]);
        assert!(!lanes.is_busy(1));
    }
}
