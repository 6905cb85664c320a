//! Handler executor: runs one handler under a deadline and contains its failures.
//!
//! The handler runs in its own task so a panic is caught as a `JoinError`
//! instead of unwinding through the lane. On timeout the task is aborted and
//! whatever session it was computing is dropped.

use crate::domain::{ActionPayload, HandlerError, OutboundAction, Session, Update};
use crate::ports::Handler;
use crate::shared::EngineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Generic notice sent to a chat when its update could not be handled.
pub const FAILURE_NOTICE: &str = "Sorry, something went wrong while handling your message. Please try again later.";

/// Why a handler run produced no committable result.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// Exceeded the deadline; partial work discarded.
    Timeout(Duration),
    /// Handler returned a classified error.
    Handler(String),
    /// Panic or unclassified error: a programming defect, still contained.
    Defect(String),
}

/// A contained failure plus the notice to send in its place.
#[derive(Debug, Clone)]
pub struct ExecutionFailure {
    pub cause: FailureCause,
    pub notice: OutboundAction,
}

/// Successful run: the session to commit and the keyed actions, in handler order.
#[derive(Debug, Clone)]
pub struct Execution {
    pub session: Session,
    pub actions: Vec<OutboundAction>,
}

pub struct HandlerExecutor {
    deadline: Duration,
    metrics: Arc<EngineMetrics>,
}

impl HandlerExecutor {
    pub fn new(deadline: Duration, metrics: Arc<EngineMetrics>) -> Self {
        Self { deadline, metrics }
    }

    pub async fn execute(
        &self,
        handler: Arc<dyn Handler>,
        update: &Update,
        session: Session,
    ) -> Result<Execution, ExecutionFailure> {
        let owned = update.clone();
        let mut task = tokio::spawn(async move { handler.handle(&owned, session).await });

        let cause = match tokio::time::timeout(self.deadline, &mut task).await {
            Ok(Ok(Ok(output))) => {
                let actions = output
                    .actions
                    .into_iter()
                    .enumerate()
                    .map(|(seq, payload)| {
                        OutboundAction::new(update.chat_id, payload, action_key(update, seq))
                    })
                    .collect();
                return Ok(Execution {
                    session: output.session,
                    actions,
                });
            }
            Ok(Ok(Err(e))) => {
                if e.is_defect() {
                    EngineMetrics::incr(&self.metrics.handler_defects);
                    error!(chat_id = update.chat_id, update_id = update.update_id, error = %e, "handler defect");
                    FailureCause::Defect(e.to_string())
                } else {
                    EngineMetrics::incr(&self.metrics.handler_failures);
                    warn!(chat_id = update.chat_id, update_id = update.update_id, error = %e, "handler failed");
                    FailureCause::Handler(e.to_string())
                }
            }
            Ok(Err(join)) => {
                EngineMetrics::incr(&self.metrics.handler_defects);
                let msg = if join.is_panic() {
                    panic_message(join.into_panic())
                } else {
                    "handler task cancelled".to_string()
                };
                error!(chat_id = update.chat_id, update_id = update.update_id, panic = %msg, "handler panicked");
                FailureCause::Defect(msg)
            }
            Err(_) => {
                task.abort();
                EngineMetrics::incr(&self.metrics.handler_timeouts);
                warn!(
                    chat_id = update.chat_id,
                    update_id = update.update_id,
                    deadline_ms = self.deadline.as_millis() as u64,
                    "handler exceeded deadline; changes discarded"
                );
                FailureCause::Timeout(self.deadline)
            }
        };
        Err(ExecutionFailure {
            cause,
            notice: failure_notice(update, "failure"),
        })
    }
}

/// Deterministic per-update key, so a redelivered update reproduces the same keys.
pub fn action_key(update: &Update, seq: usize) -> String {
    format!("{}:{}", update.update_id, seq)
}

/// Generic failure notice for `update`, keyed by `reason`.
pub fn failure_notice(update: &Update, reason: &str) -> OutboundAction {
    OutboundAction::new(
        update.chat_id,
        ActionPayload::message(FAILURE_NOTICE),
        format!("{}:{}", update.update_id, reason),
    )
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
