//! Continuations, user-visible events, and the lock discipline around
//! their delivery.
//!
//! A continuation is a caller-supplied object that receives events. It is
//! inseparable from its mutex: [`ContRef`] is the continuation *behind*
//! its mutex, so "acquire the VIO mutex" and "get mutable access to the
//! continuation" are the same try-lock, and a continuation swapping the
//! VIO mutex mid-callback is detected by pointer identity
//! ([`ContLock::matches`]).
//!
//! Every I/O entry point try-locks; a miss reschedules the connection on
//! its ready list and never blocks, which keeps per-thread forward
//! progress independent of what other threads hold.

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::sync::Arc;

use crate::vconn::NetVConnection;

/// Events delivered to continuations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEvent {
    /// Bytes arrived in the read buffer; more may follow.
    ReadReady,
    /// The read VIO reached its byte target. Emitted at most once per VIO.
    ReadComplete,
    /// Room or appetite for more bytes on the write side.
    WriteReady,
    /// The write VIO reached its byte target. Emitted at most once per VIO.
    WriteComplete,
    /// The peer closed the stream.
    Eos,
    /// A hard I/O error; the errno is readable via
    /// [`NetVConnection::lerrno`].
    Error,
    /// The absolute activity deadline passed.
    ActiveTimeout,
    /// The sliding inactivity deadline passed.
    InactivityTimeout,
    /// An out-of-band send finished.
    OobComplete,
    /// An inbound connection entered the running state.
    Accept,
    /// An outbound connection entered the running state.
    Open,
    /// An outbound connect failed; payload is a negative errno or
    /// `-ENET_THROTTLING`.
    OpenFailed(i32),
}

/// A caller-supplied event sink.
///
/// The connection reference is the event payload: the VIOs hang off it
/// (`vc.read_vio()` / `vc.write_vio()`), and all control operations —
/// `do_io_read`, `do_io_write`, `do_io_close`, re-enabling, timeout
/// changes — are methods on it. Callbacks run on the connection's owning
/// thread with the handler lock held; they must not block.
pub trait Continuation: Send {
    /// Handles one event.
    fn handle_event(&mut self, event: NetEvent, vc: &mut NetVConnection);
}

/// A continuation behind its mutex. Cloning shares both.
pub type ContRef = Arc<Mutex<dyn Continuation>>;

/// Wraps a continuation into a [`ContRef`].
pub fn cont_ref<C: Continuation + 'static>(cont: C) -> ContRef {
    Arc::new(Mutex::new(cont))
}

/// Sink that ignores every event. Backs a connection's own mutex, which
/// stands in whenever no continuation was supplied.
pub(crate) struct NullCont;

impl Continuation for NullCont {
    fn handle_event(&mut self, _event: NetEvent, _vc: &mut NetVConnection) {}
}

/// Creates a fresh connection-owned mutex.
pub(crate) fn vc_own_mutex() -> ContRef {
    Arc::new(Mutex::new(NullCont))
}

/// A held continuation lock.
///
/// Keeps its own clone of the `Arc` it locked so the identity comparison
/// in [`matches`](Self::matches) survives the continuation replacing the
/// VIO mutex while the guard is held.
pub(crate) struct ContLock {
    mutex: ContRef,
    guard: ArcMutexGuard<RawMutex, dyn Continuation>,
}

impl ContLock {
    /// Mutable access to the locked continuation.
    pub(crate) fn cont(&mut self) -> &mut (dyn Continuation + 'static) {
        &mut *self.guard
    }

    /// True when `other` is the same mutex this lock holds.
    pub(crate) fn matches(&self, other: &ContRef) -> bool {
        Arc::ptr_eq(&self.mutex, other)
    }
}

/// Non-blocking acquisition of a continuation mutex.
pub(crate) fn try_lock_cont(mutex: &ContRef) -> Option<ContLock> {
    mutex.try_lock_arc().map(|guard| ContLock {
        mutex: Arc::clone(mutex),
        guard,
    })
}

/// Blocking acquisition, for bring-up paths (accept/connect actions)
/// where the caller guarantees the mutex is not held.
pub(crate) fn lock_cont(mutex: &ContRef) -> ContLock {
    ContLock {
        mutex: Arc::clone(mutex),
        guard: mutex.lock_arc(),
    }
}

/// True when both refs point at the same continuation. `None` never
/// equals anything, matching "no continuation installed".
pub(crate) fn same_cont(a: Option<&ContRef>, b: Option<&ContRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}
