//! Echo assistant for development and tests.
//!
//! Answers without calling any backend. Simulates latency with a configurable delay.

use crate::domain::DomainError;
use crate::ports::Assistant;
use std::time::Duration;
use tracing::{debug, info};

pub struct EchoAssistant {
    delay: Duration,
}

impl EchoAssistant {
    /// No simulated latency.
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoAssistant {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Assistant for EchoAssistant {
    async fn answer(&self, _api_key: &str, query: &str, thread_id: &str) -> Result<String, DomainError> {
        debug!(thread_id, query_len = query.len(), "[ECHO] answering");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(format!("You said: {}", query.trim()))
    }

    async fn shutdown(&self) -> Result<(), DomainError> {
        info!("[ECHO] assistant sessions closed");
        Ok(())
    }
}
