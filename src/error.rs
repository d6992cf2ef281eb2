//! Error types for the connection bring-up surface.
//!
//! Data-path failures never travel through these types: inside the I/O
//! paths a syscall result is folded into a single signed value (negative
//! errno, zero for end-of-stream, positive for bytes moved) and delivered
//! to the continuation as an event. `NetError` covers the operations that
//! have an ordinary `Result` shape: socket setup, poller registration,
//! connect, and misuse of an already-closed connection.

use std::io;
use thiserror::Error;

/// Base for synthetic network error codes that must not collide with OS
/// errno values.
pub const NET_ERRNO_BASE: i32 = 1200;

/// Sentinel delivered as `NET_EVENT_OPEN_FAILED` payload (negated) when a
/// connect attempt is refused by the open-connection throttle.
pub const ENET_THROTTLING: i32 = NET_ERRNO_BASE + 1;

/// Errors surfaced by connection setup and control operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// The open-connection throttle refused a new outbound connection.
    #[error("connection limit reached, connect throttled")]
    Throttled,

    /// Registering the socket with the readiness poller failed. Fatal for
    /// the connection being brought up.
    #[error("failed to register socket with the poller")]
    Register(#[source] io::Error),

    /// Creating or configuring the socket failed.
    #[error("socket setup failed")]
    Socket(#[source] io::Error),

    /// The non-blocking connect could not be initiated.
    #[error("connect failed")]
    Connect(#[source] io::Error),

    /// The operation targeted a connection whose close was already
    /// requested.
    #[error("operation on a closed connection")]
    Closed,

    /// The connection id did not resolve to a live connection (already
    /// freed, or owned by a different handler).
    #[error("virtual connection not found")]
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_sentinel_clears_errno_range() {
        // Real errno values are small; the sentinel must be distinguishable.
        assert!(ENET_THROTTLING > 1000);
    }

    #[test]
    fn error_display() {
        let err = NetError::Register(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(err.to_string().contains("poller"));
    }
}
