//! Runtime configuration for net handlers.
//!
//! `NetConfig` is a plain value passed to each handler at construction.
//! Defaults match the behavior of the production deployment this core was
//! extracted from: 10 ms retry cadence, no timeouts unless asked for, no
//! connection throttle.

use std::time::Duration;

/// Default block size for chain buffers created by [`crate::buf::chain_buffer`].
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Configuration for a [`crate::NetHandler`].
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Delay before retrying an operation that failed to acquire a lock
    /// (timeout delivery, out-of-band retries).
    pub retry_delay: Duration,
    /// Timeout handed to the poller on each [`crate::NetHandler::run_once`]
    /// pass when the caller does not supply one.
    pub poll_timeout: Duration,
    /// Inactivity timeout armed on newly accepted connections. `None`
    /// leaves the deadline disarmed.
    pub default_inactivity_timeout: Option<Duration>,
    /// Absolute activity timeout armed on newly accepted connections.
    pub default_active_timeout: Option<Duration>,
    /// Upper bound on simultaneously open connections; outbound connects
    /// beyond it fail with `NET_EVENT_OPEN_FAILED(-ENET_THROTTLING)`.
    pub max_open_connections: Option<usize>,
}

impl NetConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            retry_delay: Duration::from_millis(10),
            poll_timeout: Duration::from_millis(10),
            default_inactivity_timeout: None,
            default_active_timeout: None,
            max_open_connections: None,
        }
    }

    /// Sets the lock-retry delay.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the default poll timeout.
    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the inactivity timeout armed on accepted connections.
    #[must_use]
    pub fn with_default_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.default_inactivity_timeout = Some(timeout);
        self
    }

    /// Sets the activity timeout armed on accepted connections.
    #[must_use]
    pub fn with_default_active_timeout(mut self, timeout: Duration) -> Self {
        self.default_active_timeout = Some(timeout);
        self
    }

    /// Caps the number of simultaneously open connections.
    #[must_use]
    pub fn with_max_open_connections(mut self, max: usize) -> Self {
        self.max_open_connections = Some(max);
        self
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::new()
    }
}
