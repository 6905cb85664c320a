//! Domain errors. Used by ports and use cases.
//!
//! Adapters map infrastructure errors into these. Each layer classifies at its
//! own boundary; only fatal errors (`Auth`, `Config`) cross the engine upward.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// Connectivity failure, timeout or remote 5xx. Retried with backoff.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote asked us to slow down; retry after the given duration.
    #[error("Rate limited: retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Credentials rejected. Fatal: the engine transitions to FAILED.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Invalid startup configuration. Fatal.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote rejected the request for good (bad request, forbidden).
    #[error("Remote rejected request: {0}")]
    Remote(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Assistant error: {0}")]
    Assistant(String),

    /// Operation abandoned because shutdown was requested.
    #[error("Cancelled")]
    Cancelled,
}

impl DomainError {
    /// Class (a): worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DomainError::Transport(_) | DomainError::RateLimited { .. }
        )
    }

    /// Class (d): unrecoverable, halts the engine.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DomainError::Auth(_) | DomainError::Config(_))
    }
}

/// Error returned by a handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Expected failure in the handler's own domain (invalid input it cannot recover from, etc.).
    #[error("{0}")]
    Domain(String),

    /// A port the handler called failed.
    #[error(transparent)]
    Port(#[from] DomainError),

    /// Anything the handler did not classify. Treated as a programming defect.
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl HandlerError {
    pub fn is_defect(&self) -> bool {
        matches!(self, HandlerError::Unexpected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(DomainError::Transport("reset".into()).is_transient());
        assert!(
            DomainError::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(DomainError::Auth("401".into()).is_fatal());
        assert!(!DomainError::Remote("400".into()).is_transient());
        assert!(!DomainError::Remote("400".into()).is_fatal());
    }

    #[test]
    fn test_handler_error_defect() {
        assert!(HandlerError::Unexpected("boom".into()).is_defect());
        assert!(!HandlerError::Domain("nope".into()).is_defect());
        assert!(!HandlerError::from(DomainError::Storage("x".into())).is_defect());
    }
}
