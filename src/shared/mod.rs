//! Cross-cutting concerns: configuration, logging, backoff, counters.

pub mod backoff;
pub mod config;
pub mod logging;
pub mod metrics;

pub use backoff::Backoff;
pub use config::{AppConfig, EngineConfig, OutboundPolicy};
pub use metrics::{EngineMetrics, MetricsSnapshot};
