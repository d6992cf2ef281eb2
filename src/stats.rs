//! Atomic counters and gauges for the net core.
//!
//! A single [`NetStats`] is shared (via `Arc`) by every handler in the
//! process. The open-connection gauge is load-bearing: the connect-time
//! throttle reads it, and migration must leave it unchanged across the
//! close/re-populate pair.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increments the counter by 1.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Adds a value to the counter.
    pub fn add(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that can go up and down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Increments the gauge by 1.
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the gauge by 1.
    pub fn decrement(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Statistics maintained by the read/write paths and connection lifecycle.
#[derive(Debug, Default)]
pub struct NetStats {
    /// Read syscalls issued (one per `readv` attempt).
    pub calls_to_read: Counter,
    /// Read passes that ended in `EAGAIN`/`ENOTCONN`.
    pub calls_to_read_nodata: Counter,
    /// Write syscalls issued.
    pub calls_to_write: Counter,
    /// Write drain entries taken from a readiness poll.
    pub calls_to_write_afterpoll: Counter,
    /// Write passes that ended in `EAGAIN`/`ENOTCONN`.
    pub calls_to_write_nodata: Counter,
    /// Total bytes moved from sockets into read buffers.
    pub read_bytes: Counter,
    /// Total bytes moved from write buffers into sockets.
    pub write_bytes: Counter,
    /// Connections currently open across all handlers.
    pub connections_currently_open: Gauge,
    /// Outbound connects refused by the throttle.
    pub connections_throttled_out: Counter,
}

impl NetStats {
    /// Creates a zeroed stats block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
