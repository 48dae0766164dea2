//! Configuration for the sync engine.

use std::time::Duration;
use tidesync_core::{PipelineConfig, DEFAULT_MAX_SIZE};

/// Configuration for a synchronization session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Application area sent in the handshake.
    pub area: String,
    /// Module identifier sent in the handshake.
    pub module_id: String,
    /// Upper bound, in encoded bytes, of the un-acknowledged request buffer.
    pub max_size: usize,
    /// Rows merged per `poll` while loading; 0 loads everything at once.
    pub load_batch_rows: usize,
    /// Interval of the background heartbeat.
    pub heartbeat_interval: Duration,
    /// Whether the heartbeat resynchronizes on its own once the hub is back.
    pub auto_reconnect: bool,
    /// Backoff between failed resynchronization attempts.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(area: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            module_id: module_id.into(),
            max_size: DEFAULT_MAX_SIZE,
            load_batch_rows: 500,
            heartbeat_interval: Duration::from_secs(5),
            auto_reconnect: true,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the buffer bound.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the number of rows loaded per poll.
    pub fn with_load_batch_rows(mut self, rows: usize) -> Self {
        self.load_batch_rows = rows;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Enables or disables automatic resynchronization.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Pipeline configuration derived from this one.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig::new().with_max_size(self.max_size)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// Configuration for reconnect behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of failed attempts before giving up; 0 never gives up.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    /// Retries on every heartbeat, forever.
    pub fn immediate() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Whether `failures` consecutive failures exhaust the budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts != 0 && failures >= self.max_attempts
    }

    /// Delay to wait after `failures` consecutive failures.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(0)
    }
}
