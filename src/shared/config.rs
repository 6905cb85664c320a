//! Application configuration. Bot credentials, engine timings, pool sizes, paths.
//!
//! Loaded once at startup and immutable for the process lifetime.

use crate::domain::DomainError;
use crate::shared::backoff::Backoff;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.telegram.org";

/// How long an idle per-chat lane lingers before its task is torn down.
pub const LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AppConfig {
    /// Bot API token. Read from TG_LANES_BOT_TOKEN or TELEGRAM_BOT_TOKEN.
    #[serde(default)]
    pub bot_token: Option<String>,

    /// Bot API base URL (override for local Bot API servers).
    #[serde(default)]
    pub api_base_url: Option<String>,

    /// Long-poll wait in seconds for getUpdates.
    #[serde(default)]
    pub poll_timeout_secs: Option<u64>,

    #[serde(default)]
    pub handler_deadline_secs: Option<u64>,

    /// Sessions idle longer than this are evicted.
    #[serde(default)]
    pub session_ttl_secs: Option<u64>,

    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,

    /// Max chats processed concurrently.
    #[serde(default)]
    pub worker_pool_size: Option<usize>,

    /// Max chats delivering outbound actions concurrently.
    #[serde(default)]
    pub outbound_concurrency: Option<usize>,

    #[serde(default)]
    pub outbound_retry_base_ms: Option<u64>,

    #[serde(default)]
    pub outbound_retry_cap_ms: Option<u64>,

    #[serde(default)]
    pub outbound_max_attempts: Option<u32>,

    #[serde(default)]
    pub outbound_attempt_timeout_secs: Option<u64>,

    #[serde(default)]
    pub drain_grace_secs: Option<u64>,

    /// Handler re-runs allowed after a session write conflict.
    #[serde(default)]
    pub conflict_retries: Option<u32>,

    /// Directory for users.db and watermark.json.
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Optional log file (in addition to stderr).
    #[serde(default)]
    pub log_file: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();
        let mut c = config::Config::builder();
        c = c.add_source(config::Environment::with_prefix("TG_LANES"));
        if let Ok(path) = std::env::var("TG_LANES_CONFIG") {
            c = c.add_source(config::File::with_name(&path));
        }
        let mut cfg: Self = c.build()?.try_deserialize()?;
        // TELEGRAM_BOT_TOKEN is read directly (no prefix) so existing deployments keep working
        if cfg.bot_token.is_none() {
            cfg.bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty());
        }
        Ok(cfg)
    }

    pub fn api_base_url_or_default(&self) -> String {
        self.api_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
    }

    /// Long-poll wait. Defaults to 30s.
    pub fn poll_timeout_secs_or_default(&self) -> u64 {
        self.poll_timeout_secs.unwrap_or(30)
    }

    pub fn handler_deadline_secs_or_default(&self) -> u64 {
        self.handler_deadline_secs.unwrap_or(10)
    }

    /// Defaults to 24h.
    pub fn session_ttl_secs_or_default(&self) -> u64 {
        self.session_ttl_secs.unwrap_or(24 * 60 * 60)
    }

    pub fn sweep_interval_secs_or_default(&self) -> u64 {
        self.sweep_interval_secs.unwrap_or(300)
    }

    pub fn worker_pool_size_or_default(&self) -> usize {
        self.worker_pool_size.unwrap_or(16)
    }

    pub fn outbound_concurrency_or_default(&self) -> usize {
        self.outbound_concurrency.unwrap_or(8)
    }

    pub fn outbound_max_attempts_or_default(&self) -> u32 {
        self.outbound_max_attempts.unwrap_or(5)
    }

    pub fn outbound_attempt_timeout_secs_or_default(&self) -> u64 {
        self.outbound_attempt_timeout_secs.unwrap_or(10)
    }

    pub fn drain_grace_secs_or_default(&self) -> u64 {
        self.drain_grace_secs.unwrap_or(30)
    }

    pub fn conflict_retries_or_default(&self) -> u32 {
        self.conflict_retries.unwrap_or(3)
    }

    pub fn data_dir_or_default(&self) -> PathBuf {
        PathBuf::from(self.data_dir.as_deref().unwrap_or("./data"))
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_file.as_deref().map(PathBuf::from)
    }

    /// Typed engine settings. Rejects values the engine cannot run with.
    pub fn engine_config(&self) -> Result<EngineConfig, DomainError> {
        let defaults = Backoff::delivery();
        let retry = Backoff::new(
            self.outbound_retry_base_ms
                .map_or(defaults.base, Duration::from_millis),
            self.outbound_retry_cap_ms
                .map_or(defaults.cap, Duration::from_millis),
        );
        let cfg = EngineConfig {
            poll_timeout: Duration::from_secs(self.poll_timeout_secs_or_default()),
            handler_deadline: Duration::from_secs(self.handler_deadline_secs_or_default()),
            session_ttl: Duration::from_secs(self.session_ttl_secs_or_default()),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs_or_default()),
            worker_pool_size: self.worker_pool_size_or_default(),
            conflict_retries: self.conflict_retries_or_default(),
            drain_grace: Duration::from_secs(self.drain_grace_secs_or_default()),
            lane_idle: LANE_IDLE_TIMEOUT,
            source_backoff: Backoff::reconnect(),
            outbound: OutboundPolicy {
                concurrency: self.outbound_concurrency_or_default(),
                retry,
                max_attempts: self.outbound_max_attempts_or_default(),
                attempt_timeout: Duration::from_secs(
                    self.outbound_attempt_timeout_secs_or_default(),
                ),
                dedup_ttl: DEFAULT_DEDUP_TTL,
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

/// How long delivered idempotency keys are remembered.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Outbound retry policy and delivery limits.
#[derive(Debug, Clone)]
pub struct OutboundPolicy {
    pub concurrency: usize,
    pub retry: Backoff,
    /// Total attempts per action, including the first.
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub dedup_ttl: Duration,
}

impl Default for OutboundPolicy {
    fn default() -> Self {
        Self {
            concurrency: 8,
            retry: Backoff::delivery(),
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(10),
            dedup_ttl: DEFAULT_DEDUP_TTL,
        }
    }
}

/// Engine settings with typed durations.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_timeout: Duration,
    pub handler_deadline: Duration,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub worker_pool_size: usize,
    pub conflict_retries: u32,
    pub drain_grace: Duration,
    pub lane_idle: Duration,
    pub source_backoff: Backoff,
    pub outbound: OutboundPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
            handler_deadline: Duration::from_secs(10),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(300),
            worker_pool_size: 16,
            conflict_retries: 3,
            drain_grace: Duration::from_secs(30),
            lane_idle: LANE_IDLE_TIMEOUT,
            source_backoff: Backoff::reconnect(),
            outbound: OutboundPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.worker_pool_size == 0 {
            return Err(DomainError::Config("worker_pool_size must be > 0".into()));
        }
        if self.outbound.concurrency == 0 {
            return Err(DomainError::Config("outbound_concurrency must be > 0".into()));
        }
        if self.outbound.max_attempts == 0 {
            return Err(DomainError::Config("outbound_max_attempts must be > 0".into()));
        }
        if self.handler_deadline.is_zero() {
            return Err(DomainError::Config("handler_deadline_secs must be > 0".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(DomainError::Config("sweep_interval_secs must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default().engine_config().unwrap();
        assert_eq!(cfg.handler_deadline, Duration::from_secs(10));
        assert_eq!(cfg.session_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.drain_grace, Duration::from_secs(30));
        assert_eq!(cfg.conflict_retries, 3);
        assert_eq!(cfg.outbound.max_attempts, 5);
        assert_eq!(cfg.outbound.retry, Backoff::delivery());
        assert_eq!(cfg.source_backoff, Backoff::reconnect());
    }

    #[test]
    fn test_zero_pool_rejected() {
        let app = AppConfig {
            worker_pool_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(app.engine_config(), Err(DomainError::Config(_))));
    }

    #[test]
    fn test_retry_overrides() {
        let app = AppConfig {
            outbound_retry_base_ms: Some(100),
            outbound_retry_cap_ms: Some(1_000),
            ..Default::default()
        };
        let cfg = app.engine_config().unwrap();
        assert_eq!(cfg.outbound.retry.base, Duration::from_millis(100));
        assert_eq!(cfg.outbound.retry.cap, Duration::from_secs(1));
    }
}
