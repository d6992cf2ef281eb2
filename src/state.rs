//! Per-direction connection state.
//!
//! Each virtual connection carries one [`NetState`] per direction. The
//! flags gate the ready-list machinery:
//!
//! - `enabled`: the direction wants progress. Flipped by VIO re-enables
//!   and the disable paths.
//! - `triggered`: the poller observed readiness not yet drained by a
//!   syscall returning `EAGAIN`.
//! - `in_ready_list`: the connection sits on the handler's ready list for
//!   this direction. A connection is ready-listed iff
//!   `triggered && enabled` (the drain maintains this).
//!
//! The cross-thread `in_enabled_list` flag lives in [`EnableFlags`], an
//! `Arc`'d pair of atomics, because the claiming thread does not hold the
//! handler lock when it pushes onto the enable list.

use std::sync::atomic::AtomicBool;

use crate::cont::ContRef;
use crate::poll::Interest;
use crate::vio::Vio;

/// A transfer direction on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Socket to buffer.
    Read,
    /// Buffer to socket.
    Write,
}

impl Direction {
    /// The poller interest corresponding to this direction.
    #[must_use]
    pub(crate) fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

/// State of one direction of a virtual connection.
#[derive(Debug)]
pub(crate) struct NetState {
    pub(crate) vio: Vio,
    pub(crate) enabled: bool,
    pub(crate) triggered: bool,
    pub(crate) in_ready_list: bool,
}

impl NetState {
    pub(crate) fn new(own_mutex: ContRef) -> Self {
        Self {
            vio: Vio::new(own_mutex),
            enabled: false,
            triggered: false,
            in_ready_list: false,
        }
    }
}

/// Cross-thread "already on the enable list" claims, one per direction.
#[derive(Debug, Default)]
pub(crate) struct EnableFlags {
    pub(crate) read: AtomicBool,
    pub(crate) write: AtomicBool,
}

impl EnableFlags {
    pub(crate) fn flag(&self, dir: Direction) -> &AtomicBool {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }
}
