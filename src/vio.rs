//! The virtual I/O descriptor.
//!
//! A [`Vio`] is one unit of work: "move `nbytes` bytes through this
//! buffer, notifying this continuation". The connection owns one per
//! direction; continuations reach theirs through the connection reference
//! passed to every callback, or from another thread through a
//! [`VioHandle`].
//!
//! `nbytes == 0` means "until end-of-stream": `ntodo` never reaches zero
//! and a completion event is never emitted, only `Eos` when the peer
//! closes.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::buf::BufHandle;
use crate::cont::ContRef;
use crate::handler::NetHandler;
use crate::slot::VcId;
use crate::state::{Direction, EnableFlags};
use crate::vconn::{reenable_entry, reenable_re_entry};

/// Operation a VIO is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VioOp {
    /// No operation installed.
    #[default]
    None,
    /// Reading from the socket into the buffer.
    Read,
    /// Writing from the buffer to the socket.
    Write,
}

/// A read-or-write work item.
pub struct Vio {
    pub(crate) op: VioOp,
    pub(crate) nbytes: i64,
    pub(crate) ndone: i64,
    pub(crate) cont: Option<ContRef>,
    pub(crate) mutex: ContRef,
    pub(crate) buffer: Option<BufHandle>,
}

impl std::fmt::Debug for Vio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vio")
            .field("op", &self.op)
            .field("nbytes", &self.nbytes)
            .field("ndone", &self.ndone)
            .field("cont", &self.cont.is_some())
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl Vio {
    pub(crate) fn new(own_mutex: ContRef) -> Self {
        Self {
            op: VioOp::None,
            nbytes: 0,
            ndone: 0,
            cont: None,
            mutex: own_mutex,
            buffer: None,
        }
    }

    /// The configured operation.
    #[must_use]
    pub fn op(&self) -> VioOp {
        self.op
    }

    /// Total bytes requested. Zero means "until end-of-stream".
    #[must_use]
    pub fn nbytes(&self) -> i64 {
        self.nbytes
    }

    /// Bytes completed so far. Monotone non-decreasing for the life of
    /// the VIO.
    #[must_use]
    pub fn ndone(&self) -> i64 {
        self.ndone
    }

    /// Adjusts the byte target mid-stream (e.g. once a header reveals the
    /// body length).
    pub fn set_nbytes(&mut self, nbytes: i64) {
        self.nbytes = nbytes;
    }

    /// Bytes still to move: `nbytes - ndone`, unbounded for
    /// `nbytes == 0`, and zero when no operation is installed.
    #[must_use]
    pub fn ntodo(&self) -> i64 {
        match self.op {
            VioOp::None => 0,
            VioOp::Read | VioOp::Write => {
                if self.nbytes == 0 {
                    i64::MAX
                } else {
                    self.nbytes - self.ndone
                }
            }
        }
    }

    /// The buffer this VIO moves bytes through.
    #[must_use]
    pub fn buffer(&self) -> Option<&BufHandle> {
        self.buffer.as_ref()
    }

    /// Resets to the no-operation state, dropping buffer and continuation.
    pub(crate) fn clear(&mut self) {
        self.op = VioOp::None;
        self.nbytes = 0;
        self.buffer = None;
        self.cont = None;
    }
}

/// Cross-thread re-enable entry for one direction of one connection.
///
/// Returned by `do_io_read` / `do_io_write`; cloneable and sendable. The
/// id inside is generation-checked, so a handle outliving its connection
/// is inert.
#[derive(Debug, Clone)]
pub struct VioHandle {
    pub(crate) nh: Weak<NetHandler>,
    pub(crate) id: VcId,
    pub(crate) dir: Direction,
    pub(crate) flags: Arc<EnableFlags>,
}

impl VioHandle {
    /// The connection this handle re-enables.
    #[must_use]
    pub fn id(&self) -> VcId {
        self.id
    }

    /// The direction this handle re-enables.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.dir
    }

    /// Re-enables the direction: the poll interest is (re)installed and
    /// the connection lands on the proper ready list.
    ///
    /// When the handler lock can be taken the effect is immediate.
    /// Otherwise the connection is pushed onto the handler's enable list
    /// (at most once, guarded by the claim flag) and the owning thread is
    /// woken to pick it up on its next pass.
    pub fn reenable(&self) {
        let Some(nh) = self.nh.upgrade() else { return };
        if let Some(mut core) = nh.try_lock_core() {
            reenable_entry(&mut core, self.id, self.dir);
        } else {
            if !self.flags.flag(self.dir).swap(true, Ordering::AcqRel) {
                nh.push_enable(self.dir, self.id);
            }
            nh.wake();
        };
    }

    /// Like [`reenable`](Self::reenable), but when the handler lock is
    /// available the I/O path runs immediately instead of merely queuing,
    /// collapsing a drain-pass of latency.
    pub fn reenable_re(&self) {
        let Some(nh) = self.nh.upgrade() else { return };
        let locked = nh.try_lock_core();
        match locked {
            Some(mut core) => {
                reenable_re_entry(&mut core, self.id, self.dir);
            }
            None => {
                self.reenable();
            }
        }
    }
}
