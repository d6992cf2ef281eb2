//! Readiness polling: interests, the poll-descriptor contract, and the
//! per-connection binding.
//!
//! The reactor side of the runtime is an external collaborator; this
//! module pins down the contract the connection core needs from it:
//!
//! - [`PollDescriptor`]: register/modify/deregister interest for a keyed
//!   socket, wait for readiness, and wake a blocked waiter from another
//!   thread.
//! - [`EventIo`]: the per-connection handle — `start`, `modify`,
//!   `refresh`, `stop` — that the connection lifecycle and the re-enable
//!   protocol drive.
//!
//! [`SysPoll`] is the production implementation over the `polling` crate,
//! preferring edge-triggered registration and falling back to oneshot
//! re-arming where the platform lacks it. The deterministic test
//! implementation lives in [`crate::lab::LabPoll`].

use polling::{Event as PollerEvent, Events, PollMode, Poller};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Interest flags indicating what readiness to monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// No interest.
    pub const NONE: Interest = Interest(0);
    /// Interest in readable events.
    pub const READABLE: Interest = Interest(0b01);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Interest(0b10);

    /// Returns interest in both readable and writable events.
    #[must_use]
    pub const fn both() -> Self {
        Interest(0b11)
    }

    /// Returns true if readable interest is set.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable interest is set.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns true if no interest is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Combines interests.
    #[must_use]
    pub const fn add(self, other: Interest) -> Self {
        Interest(self.0 | other.0)
    }

    /// Removes interest.
    #[must_use]
    pub const fn remove(self, other: Interest) -> Self {
        Interest(self.0 & !other.0)
    }
}

/// A single readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    /// Key the socket was registered under.
    pub key: usize,
    /// Readable readiness observed.
    pub readable: bool,
    /// Writable readiness observed.
    pub writable: bool,
}

/// Contract between the connection core and the readiness poller.
///
/// A `None` fd is accepted by implementations that do not track kernel
/// objects (the lab poller); [`SysPoll`] requires `Some`.
pub trait PollDescriptor: Send + Sync {
    /// Registers a socket under `key` with the given interest.
    fn add(&self, fd: Option<BorrowedFd<'_>>, key: usize, interest: Interest) -> io::Result<()>;

    /// Replaces the interest set for a registered socket.
    fn modify(&self, fd: Option<BorrowedFd<'_>>, key: usize, interest: Interest) -> io::Result<()>;

    /// Deregisters a socket.
    fn delete(&self, fd: Option<BorrowedFd<'_>>, key: usize) -> io::Result<()>;

    /// Waits for readiness, appending into `out`. Returns the number of
    /// events delivered.
    fn wait(&self, out: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> io::Result<usize>;

    /// Wakes a thread blocked in [`wait`](Self::wait).
    fn wake(&self);

    /// Whether registered interest survives event delivery. When false,
    /// [`EventIo::refresh`] must re-arm after each delivery.
    fn persistent(&self) -> bool;
}

/// Production poll descriptor over [`polling::Poller`].
pub struct SysPoll {
    poller: Poller,
    events: Mutex<Events>,
    edge: AtomicBool,
}

impl SysPoll {
    /// Creates a poller. Edge-triggered mode is attempted on the first
    /// registration and demoted to oneshot if the platform refuses it.
    pub fn new() -> io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            poller: Poller::new()?,
            events: Mutex::new(Events::new()),
            edge: AtomicBool::new(true),
        }))
    }

    fn mode(&self) -> PollMode {
        if self.edge.load(Ordering::Relaxed) {
            PollMode::Edge
        } else {
            PollMode::Oneshot
        }
    }

    fn to_poller_event(key: usize, interest: Interest) -> PollerEvent {
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => PollerEvent::all(key),
            (true, false) => PollerEvent::readable(key),
            (false, true) => PollerEvent::writable(key),
            (false, false) => PollerEvent::none(key),
        }
    }

    fn require_fd(fd: Option<BorrowedFd<'_>>) -> io::Result<BorrowedFd<'_>> {
        fd.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "SysPoll requires a kernel socket"))
    }

    /// The one unsafe call in the crate.
    ///
    /// SAFETY: the registration is removed by `EventIo::stop` before the
    /// owning `Connection` closes the descriptor; `close_vconnection`
    /// enforces that ordering, so the fd outlives its registration.
    #[allow(unsafe_code)]
    fn raw_add(&self, fd: BorrowedFd<'_>, ev: PollerEvent, mode: PollMode) -> io::Result<()> {
        unsafe { self.poller.add_with_mode(fd.as_raw_fd(), ev, mode) }
    }
}

impl PollDescriptor for SysPoll {
    fn add(&self, fd: Option<BorrowedFd<'_>>, key: usize, interest: Interest) -> io::Result<()> {
        let fd = Self::require_fd(fd)?;
        let ev = Self::to_poller_event(key, interest);
        match self.raw_add(fd, ev, self.mode()) {
            Err(e) if e.kind() == io::ErrorKind::Unsupported && self.edge.swap(false, Ordering::Relaxed) => {
                self.raw_add(fd, ev, PollMode::Oneshot)
            }
            other => other,
        }
    }

    fn modify(&self, fd: Option<BorrowedFd<'_>>, key: usize, interest: Interest) -> io::Result<()> {
        let fd = Self::require_fd(fd)?;
        let ev = Self::to_poller_event(key, interest);
        self.poller.modify_with_mode(fd, ev, self.mode())
    }

    fn delete(&self, fd: Option<BorrowedFd<'_>>, _key: usize) -> io::Result<()> {
        let fd = Self::require_fd(fd)?;
        self.poller.delete(fd)
    }

    fn wait(&self, out: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events = self.events.lock();
        events.clear();
        let n = self.poller.wait(&mut events, timeout)?;
        out.extend(events.iter().map(|ev| ReadyEvent {
            key: ev.key,
            readable: ev.readable,
            writable: ev.writable,
        }));
        Ok(n)
    }

    fn wake(&self) {
        if let Err(e) = self.poller.notify() {
            tracing::warn!(error = %e, "poller wake failed");
        }
    }

    fn persistent(&self) -> bool {
        self.edge.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SysPoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysPoll")
            .field("edge", &self.edge.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Per-connection binding onto a poll descriptor.
///
/// Tracks the registered interest so the re-enable and disable paths can
/// add or remove one direction without knowing the other's state.
pub(crate) struct EventIo {
    pd: Option<Arc<dyn PollDescriptor>>,
    key: usize,
    interest: Interest,
}

impl EventIo {
    pub(crate) fn new() -> Self {
        Self {
            pd: None,
            key: 0,
            interest: Interest::NONE,
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.pd.is_some()
    }

    pub(crate) fn interest(&self) -> Interest {
        self.interest
    }

    /// Registers the socket. Failure is fatal for the connection being
    /// brought up; the OS error is preserved for the caller.
    pub(crate) fn start(
        &mut self,
        pd: &Arc<dyn PollDescriptor>,
        key: usize,
        fd: Option<BorrowedFd<'_>>,
        interest: Interest,
    ) -> io::Result<()> {
        pd.add(fd, key, interest)?;
        self.pd = Some(Arc::clone(pd));
        self.key = key;
        self.interest = interest;
        Ok(())
    }

    /// Replaces the interest set.
    pub(crate) fn modify(&mut self, fd: Option<BorrowedFd<'_>>, interest: Interest) {
        self.interest = interest;
        if let Some(pd) = &self.pd {
            if let Err(e) = pd.modify(fd, self.key, interest) {
                tracing::debug!(key = self.key, error = %e, "poll modify failed");
            }
        }
    }

    /// Re-arms the current interest. No-op when the backend keeps
    /// registrations armed across deliveries.
    pub(crate) fn refresh(&mut self, fd: Option<BorrowedFd<'_>>) {
        if let Some(pd) = &self.pd {
            if !pd.persistent() {
                if let Err(e) = pd.modify(fd, self.key, self.interest) {
                    tracing::debug!(key = self.key, error = %e, "poll refresh failed");
                }
            }
        }
    }

    /// Deregisters the socket. Must run before the socket is closed.
    pub(crate) fn stop(&mut self, fd: Option<BorrowedFd<'_>>) {
        if let Some(pd) = self.pd.take() {
            if let Err(e) = pd.delete(fd, self.key) {
                tracing::debug!(key = self.key, error = %e, "poll delete failed");
            }
        }
        self.interest = Interest::NONE;
    }
}

impl std::fmt::Debug for EventIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventIo")
            .field("started", &self.is_started())
            .field("key", &self.key)
            .field("interest", &self.interest)
            .finish_non_exhaustive()
    }
}
