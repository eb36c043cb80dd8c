/**
 * Configuration constants for the reflector and dispatcher
 */
use std::time::Duration;

/// Maximum number of consecutive failed list/watch attempts before the
/// reflector gives up and reports a terminal error
pub const MAX_WATCH_RESTARTS: u32 = 50;

/// Maximum backoff time in seconds between restart attempts
pub const MAX_BACKOFF_SECONDS: u64 = 60;

/// Initial backoff time in milliseconds
pub const INITIAL_BACKOFF_MILLIS: u64 = 1000;

/// Watch stream timeout in seconds (294 vs 300 to allow 6 seconds for graceful shutdown)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// Per-handler notification queue capacity
pub const DEFAULT_HANDLER_QUEUE_CAPACITY: usize = 1024;

/// How long a dispatch may wait for queue space under the blocking policy
pub const DEFAULT_BLOCK_TIMEOUT_MILLIS: u64 = 5000;

/// What a dispatch does when a handler's queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Wait up to `timeout` for space, then drop the notification for that handler
    Block { timeout: Duration },
    /// Never wait; the oldest queued notifications are discarded
    DropOldest,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::Block {
            timeout: Duration::from_millis(DEFAULT_BLOCK_TIMEOUT_MILLIS),
        }
    }
}

/// Configuration for the list/watch sync loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectorConfig {
    /// First delay after a failure; doubled on each consecutive failure
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures tolerated before the loop terminates
    pub max_consecutive_failures: u32,
    /// Interval at which every cached object is replayed as an update
    pub resync_period: Option<Duration>,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MILLIS),
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECONDS),
            max_consecutive_failures: MAX_WATCH_RESTARTS,
            resync_period: None,
        }
    }
}

impl ReflectorConfig {
    #[must_use]
    pub const fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    #[must_use]
    pub const fn max_consecutive_failures(mut self, attempts: u32) -> Self {
        self.max_consecutive_failures = attempts;
        self
    }

    /// Enable periodic resync; a zero period disables it
    #[must_use]
    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = (!period.is_zero()).then_some(period);
        self
    }
}

/// Configuration for handler notification queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Notifications buffered per handler. Under `DropOldest` the queue is a
    /// broadcast ring, whose size is this value rounded up to the next power
    /// of two (3 holds 4).
    pub queue_capacity: usize,
    pub policy: BackpressurePolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_HANDLER_QUEUE_CAPACITY,
            policy: BackpressurePolicy::default(),
        }
    }
}

impl DispatcherConfig {
    /// See [`DispatcherConfig::queue_capacity`] for the `DropOldest` rounding
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(MAX_WATCH_RESTARTS > 0, "MAX_WATCH_RESTARTS must be greater than 0");
    assert!(MAX_BACKOFF_SECONDS > 0, "MAX_BACKOFF_SECONDS must be greater than 0");
    assert!(INITIAL_BACKOFF_MILLIS > 0, "INITIAL_BACKOFF_MILLIS must be greater than 0");
    assert!(
        INITIAL_BACKOFF_MILLIS <= MAX_BACKOFF_SECONDS * 1000,
        "INITIAL_BACKOFF_MILLIS must not exceed MAX_BACKOFF_SECONDS"
    );
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
    assert!(WATCH_TIMEOUT_SECONDS < 295, "the API server rejects watch timeouts of 295s and above");
    assert!(DEFAULT_HANDLER_QUEUE_CAPACITY > 0, "DEFAULT_HANDLER_QUEUE_CAPACITY must be greater than 0");
    assert!(DEFAULT_BLOCK_TIMEOUT_MILLIS > 0, "DEFAULT_BLOCK_TIMEOUT_MILLIS must be greater than 0");
};
