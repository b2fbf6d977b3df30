//! Dispatcher configuration.

use std::time::Duration;

/// Default retry ceiling per event.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// How often the outbox is scanned.
    pub process_interval: Duration,
    /// Maximum events picked per scan.
    pub batch_size: usize,
    /// Events sent concurrently within a batch.
    pub parallelism: usize,
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt after that.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Events older than this many days are deleted by the cleanup task.
    pub retention_days: i64,
    pub cleanup_interval: Duration,
    /// Targets for health alerts.
    pub alert_urls: Vec<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            process_interval: Duration::from_secs(5),
            batch_size: 50,
            parallelism: 10,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            retention_days: 30,
            cleanup_interval: Duration::from_secs(3600),
            alert_urls: Vec::new(),
        }
    }
}

impl WebhookConfig {
    pub fn with_process_interval(mut self, interval: Duration) -> Self {
        self.process_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_alert_urls(mut self, urls: Vec<String>) -> Self {
        self.alert_urls = urls;
        self
    }
}

/// Wait before attempt number `attempt` (1-based). The first attempt is immediate.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let exponent = (attempt - 2).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}
