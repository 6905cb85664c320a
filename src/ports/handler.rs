//! Handler port. Domain logic plugged into the router.

use crate::domain::{ActionPayload, HandlerError, Session, Update};

/// Result of a successful handler run: the session to commit and the actions to send, in order.
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    pub session: Session,
    pub actions: Vec<ActionPayload>,
}

impl HandlerOutput {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            actions: Vec::new(),
        }
    }

    /// Append an action (builder style).
    pub fn with(mut self, action: ActionPayload) -> Self {
        self.actions.push(action);
        self
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.with(ActionPayload::message(text))
    }
}

/// Handler invoked for a matched update.
///
/// Receives an owned copy of the session; nothing is committed unless the
/// handler returns `Ok` within the engine's deadline.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, update: &Update, session: Session) -> Result<HandlerOutput, HandlerError>;
}
