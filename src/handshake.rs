//! Handshake hook for secured transports.
//!
//! The I/O core is oblivious to TLS except at one call point: while a
//! connection's [`Handshaker`] reports the handshake incomplete, the
//! write path hands control to [`Handshaker::start_handshake`] and
//! interprets its result as a scheduling directive. No record-layer
//! behavior is assumed.

use crate::sock::Connection;

/// Which side of the handshake this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    /// Outbound connection.
    Client,
    /// Accepted connection.
    Server,
}

/// Outcome of one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResult {
    /// Fatal failure; the payload becomes the connection's `lerrno` and
    /// an error event is delivered on the write side.
    Error(i32),
    /// Needs socket readability before progressing.
    WantRead,
    /// Server side needs readability to accept.
    WantAccept,
    /// Needs socket writability before progressing.
    WantWrite,
    /// Client side needs writability to connect.
    WantConnect,
    /// Handshake finished; normal write processing may proceed.
    Done,
    /// No progress this pass; try again on the next write drain.
    Retry,
}

/// Transport handshake driven at the write path's hook point.
pub trait Handshaker: Send {
    /// True once the handshake finished and I/O should flow normally.
    fn handshake_complete(&self) -> bool;

    /// Advances the handshake as far as the non-blocking socket allows.
    fn start_handshake(&mut self, mode: HandshakeMode, con: &mut Connection) -> HandshakeResult;
}
