//! The virtual connection and its I/O state machine.
//!
//! A [`NetVConnection`] bridges one non-blocking socket with a
//! continuation-based consumer: per-direction [`crate::state::NetState`]s,
//! a bounded scatter/gather read loop ([`read_from_net`]) and write loop
//! ([`write_to_net_io`]), timeout deadlines, an orderly close with
//! recursion-aware deferred free, and an out-of-band send channel.
//!
//! The free functions in this module are the handler's drain entries.
//! They operate on the handler core (slab plus ready lists) and follow a
//! strict shape: try-lock the VIO mutex, make as much progress as the
//! socket allows, signal the continuation, then disable or reschedule.
//! Nothing here ever blocks; lock misses reschedule and readiness misses
//! clear `triggered` and wait for the poller.

use smallvec::SmallVec;
use std::io::{IoSlice, IoSliceMut};
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::buf::{BufHandle, NET_MAX_IOV};
use crate::cont::{try_lock_cont, vc_own_mutex, ContLock, ContRef, NetEvent};
use crate::handler::{close_vconnection, HandlerCore, NetHandler};
use crate::handshake::{HandshakeMode, HandshakeResult, Handshaker};
use crate::poll::{EventIo, Interest};
use crate::slot::VcId;
use crate::sock::Connection;
use crate::state::{Direction, EnableFlags, NetState};
use crate::vio::{Vio, VioHandle, VioOp};

/// Delay before re-attempting a partial or refused out-of-band send.
const OOB_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Which half (or both) of the stream to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    /// Stop reading; the read half becomes inert.
    Read,
    /// Stop writing.
    Write,
    /// Both halves.
    ReadWrite,
}

/// Which halves have been shut down so far. Monotone: shutdowns
/// accumulate and never clear for the life of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownState {
    /// Neither half shut down.
    #[default]
    None,
    /// Read half shut down.
    Read,
    /// Write half shut down.
    Write,
    /// Both halves shut down.
    ReadWrite,
}

impl ShutdownState {
    /// True once the read half is inert.
    #[must_use]
    pub fn read_shut(self) -> bool {
        matches!(self, ShutdownState::Read | ShutdownState::ReadWrite)
    }

    /// True once the write half is inert.
    #[must_use]
    pub fn write_shut(self) -> bool {
        matches!(self, ShutdownState::Write | ShutdownState::ReadWrite)
    }

    fn merge(self, how: ShutdownHow) -> Self {
        let read = self.read_shut() || matches!(how, ShutdownHow::Read | ShutdownHow::ReadWrite);
        let write = self.write_shut() || matches!(how, ShutdownHow::Write | ShutdownHow::ReadWrite);
        match (read, write) {
            (false, false) => ShutdownState::None,
            (true, false) => ShutdownState::Read,
            (false, true) => ShutdownState::Write,
            (true, true) => ShutdownState::ReadWrite,
        }
    }
}

/// Selector for [`NetVConnection::get_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcDataKind {
    /// The read-side VIO.
    ReadVio,
    /// The write-side VIO.
    WriteVio,
    /// The close tri-state.
    Closed,
}

/// Data exposed to API bridges by [`NetVConnection::get_data`].
#[derive(Debug)]
pub enum VcData<'a> {
    /// The read-side VIO.
    ReadVio(&'a Vio),
    /// The write-side VIO.
    WriteVio(&'a Vio),
    /// The close tri-state: 0 open, 1 close requested, -1 close with
    /// error.
    Closed(i8),
}

/// Handler-state of the connection's event machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VcLifecycle {
    /// Allocated, not yet through accept or connect.
    Start,
    /// Running; timeouts and I/O flow.
    Main,
}

/// An out-of-band send awaiting retry or deferred completion delivery.
pub(crate) struct OobPending {
    pub(crate) cont: ContRef,
    pub(crate) data: Vec<u8>,
    pub(crate) off: usize,
    pub(crate) retry_at: Instant,
    pub(crate) done_event: Option<NetEvent>,
}

/// Re-enable intents recorded inside a callback, applied by the signal
/// frame under the already-held handler lock.
#[derive(Debug, Default)]
pub(crate) struct PendingReenable {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

/// Timeout flavor fired by the handler sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutKind {
    Inactivity,
    Active,
}

/// One virtual connection: socket, per-direction state, deadlines, and
/// lifecycle flags. Owned by exactly one handler and manipulated on its
/// owning thread; the only cross-thread entry is the enable-list push in
/// [`VioHandle::reenable`].
pub struct NetVConnection {
    pub(crate) id: VcId,
    pub(crate) nh: Weak<NetHandler>,
    pub(crate) con: Connection,
    pub(crate) read: NetState,
    pub(crate) write: NetState,
    /// The connection's own mutex; stands in as the VIO mutex whenever no
    /// continuation was supplied.
    pub(crate) mutex: ContRef,
    /// Accept/connect notification target.
    pub(crate) action: Option<ContRef>,
    /// 0 open, 1 close requested, -1 close with error. Monotone toward
    /// terminal once it leaves 0; always mutated under the handler lock.
    pub(crate) closed: i8,
    /// Depth of nested continuation callbacks; the free is deferred while
    /// non-zero.
    pub(crate) recursion: u32,
    pub(crate) shutdown: ShutdownState,
    pub(crate) lerrno: i32,
    pub(crate) ep: EventIo,
    pub(crate) enable_flags: Arc<EnableFlags>,
    pub(crate) inactivity_timeout_in: Option<Duration>,
    pub(crate) active_timeout_in: Option<Duration>,
    pub(crate) next_inactivity_timeout_at: Option<Instant>,
    pub(crate) next_activity_timeout_at: Option<Instant>,
    pub(crate) write_buffer_empty_event: Option<NetEvent>,
    pub(crate) oob: Option<OobPending>,
    pub(crate) handshake: Option<Box<dyn Handshaker>>,
    pub(crate) handshake_mode: HandshakeMode,
    pub(crate) lifecycle: VcLifecycle,
    pub(crate) from_accept_thread: bool,
    /// Owning thread, for debug affinity assertions only; the runtime
    /// invariant is carried by handler-lock ownership.
    pub(crate) owner: Option<ThreadId>,
    pub(crate) pending: PendingReenable,
    pub(crate) in_open_list: bool,
    pub(crate) in_cop_list: bool,
    pub(crate) in_keep_alive_queue: bool,
    pub(crate) in_active_queue: bool,
}

impl NetVConnection {
    pub(crate) fn new(id: VcId, nh: Weak<NetHandler>, con: Connection) -> Self {
        let own = vc_own_mutex();
        Self {
            id,
            nh,
            con,
            read: NetState::new(own.clone()),
            write: NetState::new(own.clone()),
            mutex: own,
            action: None,
            closed: 0,
            recursion: 0,
            shutdown: ShutdownState::None,
            lerrno: 0,
            ep: EventIo::new(),
            enable_flags: Arc::new(EnableFlags::default()),
            inactivity_timeout_in: None,
            active_timeout_in: None,
            next_inactivity_timeout_at: None,
            next_activity_timeout_at: None,
            write_buffer_empty_event: None,
            oob: None,
            handshake: None,
            handshake_mode: HandshakeMode::Server,
            lifecycle: VcLifecycle::Start,
            from_accept_thread: false,
            owner: None,
            pending: PendingReenable::default(),
            in_open_list: false,
            in_cop_list: false,
            in_keep_alive_queue: false,
            in_active_queue: false,
        }
    }

    /// This connection's id within its handler.
    #[must_use]
    pub fn id(&self) -> VcId {
        self.id
    }

    /// The close tri-state.
    #[must_use]
    pub fn closed(&self) -> i8 {
        self.closed
    }

    /// Last system error observed on this connection.
    #[must_use]
    pub fn lerrno(&self) -> i32 {
        self.lerrno
    }

    /// Which halves have been shut down.
    #[must_use]
    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown
    }

    /// Whether this connection came through the accept path.
    #[must_use]
    pub fn is_from_accept_thread(&self) -> bool {
        self.from_accept_thread
    }

    /// Whether the read direction currently wants progress.
    #[must_use]
    pub fn read_enabled(&self) -> bool {
        self.read.enabled
    }

    /// Whether the write direction currently wants progress.
    #[must_use]
    pub fn write_enabled(&self) -> bool {
        self.write.enabled
    }

    /// Whether undrained read readiness is pending.
    #[must_use]
    pub fn read_triggered(&self) -> bool {
        self.read.triggered
    }

    /// Whether undrained write readiness is pending.
    #[must_use]
    pub fn write_triggered(&self) -> bool {
        self.write.triggered
    }

    /// Local socket address, when known.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.con.local_addr()
    }

    /// Peer socket address, when known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.con.remote_addr()
    }

    /// The read-side VIO.
    #[must_use]
    pub fn read_vio(&self) -> &Vio {
        &self.read.vio
    }

    /// Mutable access to the read-side VIO.
    pub fn read_vio_mut(&mut self) -> &mut Vio {
        &mut self.read.vio
    }

    /// The write-side VIO.
    #[must_use]
    pub fn write_vio(&self) -> &Vio {
        &self.write.vio
    }

    /// Mutable access to the write-side VIO.
    pub fn write_vio_mut(&mut self) -> &mut Vio {
        &mut self.write.vio
    }

    /// The continuation that received this connection's `Accept`/`Open`.
    #[must_use]
    pub fn action(&self) -> Option<&ContRef> {
        self.action.as_ref()
    }

    /// Exposes VIOs and the close state to API bridges.
    #[must_use]
    pub fn get_data(&self, kind: VcDataKind) -> VcData<'_> {
        match kind {
            VcDataKind::ReadVio => VcData::ReadVio(&self.read.vio),
            VcDataKind::WriteVio => VcData::WriteVio(&self.write.vio),
            VcDataKind::Closed => VcData::Closed(self.closed),
        }
    }

    pub(crate) fn state(&self, dir: Direction) -> &NetState {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    pub(crate) fn state_mut(&mut self, dir: Direction) -> &mut NetState {
        match dir {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    /// A cross-thread re-enable handle for one direction.
    #[must_use]
    pub fn vio_handle(&self, dir: Direction) -> VioHandle {
        VioHandle {
            nh: self.nh.clone(),
            id: self.id,
            dir,
            flags: Arc::clone(&self.enable_flags),
        }
    }

    /// Installs a read operation: move `nbytes` bytes (0 = until
    /// end-of-stream) from the socket into `buf`, notifying `cont`.
    ///
    /// With a buffer the direction is re-enabled; without one it is
    /// disabled. Returns `None` if the connection is already closed.
    pub fn do_io_read(
        &mut self,
        cont: Option<ContRef>,
        nbytes: i64,
        buf: Option<BufHandle>,
    ) -> Option<VioHandle> {
        debug_assert!(cont.is_some() || nbytes == 0);
        if self.closed != 0 {
            tracing::error!(id = %self.id, nbytes, "do_io_read on closed connection");
            return None;
        }
        self.read.vio.op = VioOp::Read;
        self.read.vio.mutex = cont.clone().unwrap_or_else(|| self.mutex.clone());
        self.read.vio.cont = cont;
        self.read.vio.nbytes = nbytes;
        self.read.vio.ndone = 0;
        if let Some(buf) = buf {
            self.read.vio.buffer = Some(buf);
            if !self.read.enabled {
                self.reenable_read();
            }
        } else {
            self.read.vio.buffer = None;
            self.read.enabled = false;
        }
        Some(self.vio_handle(Direction::Read))
    }

    /// Installs a write operation: move `nbytes` bytes (0 = until the
    /// producer stops) from `reader` to the socket, notifying `cont`.
    pub fn do_io_write(
        &mut self,
        cont: Option<ContRef>,
        nbytes: i64,
        reader: Option<BufHandle>,
    ) -> Option<VioHandle> {
        if self.closed != 0 {
            tracing::error!(id = %self.id, nbytes, "do_io_write on closed connection");
            return None;
        }
        self.write.vio.op = VioOp::Write;
        self.write.vio.mutex = cont.clone().unwrap_or_else(|| self.mutex.clone());
        self.write.vio.cont = cont;
        self.write.vio.nbytes = nbytes;
        self.write.vio.ndone = 0;
        if let Some(reader) = reader {
            self.write.vio.buffer = Some(reader);
            if nbytes != 0 && !self.write.enabled {
                self.reenable_write();
            }
        } else {
            self.write.vio.buffer = None;
            self.write.enabled = false;
        }
        Some(self.vio_handle(Direction::Write))
    }

    /// Requests close. `None` is a normal close; `Some(errno)` records
    /// the error and closes with the error state.
    ///
    /// The close is cooperative: both directions are disabled and the
    /// VIOs cleared immediately, while teardown runs once the outermost
    /// callback frame returns (or right away when called outside one).
    pub fn do_io_close(&mut self, err: Option<i32>) {
        self.read.enabled = false;
        self.write.enabled = false;
        self.read.vio.clear();
        self.write.vio.clear();
        self.pending = PendingReenable::default();
        match err {
            None => self.closed = 1,
            Some(e) => {
                self.lerrno = e;
                self.closed = -1;
            }
        }
    }

    /// Shuts down one or both halves at the kernel and makes them inert.
    pub fn do_io_shutdown(&mut self, how: ShutdownHow) {
        match how {
            ShutdownHow::Read => {
                let _ = self.con.shutdown(Shutdown::Read);
                self.read.enabled = false;
                self.read.vio.buffer = None;
                self.read.vio.nbytes = 0;
            }
            ShutdownHow::Write => {
                let _ = self.con.shutdown(Shutdown::Write);
                self.write.enabled = false;
                self.write.vio.buffer = None;
                self.write.vio.nbytes = 0;
            }
            ShutdownHow::ReadWrite => {
                let _ = self.con.shutdown(Shutdown::Both);
                self.read.enabled = false;
                self.write.enabled = false;
                self.read.vio.buffer = None;
                self.read.vio.nbytes = 0;
                self.write.vio.buffer = None;
                self.write.vio.nbytes = 0;
            }
        }
        self.shutdown = self.shutdown.merge(how);
    }

    /// Re-enables the read direction from inside a callback. The intent
    /// is applied by the signal frame under the handler lock it already
    /// holds; from other threads use [`VioHandle::reenable`].
    pub fn reenable_read(&mut self) {
        if self.closed != 0 || self.read.enabled {
            return;
        }
        self.set_enabled(Direction::Read);
        self.pending.read = true;
    }

    /// Write-direction counterpart of [`reenable_read`](Self::reenable_read).
    pub fn reenable_write(&mut self) {
        if self.closed != 0 || self.write.enabled {
            return;
        }
        self.set_enabled(Direction::Write);
        self.pending.write = true;
    }

    pub(crate) fn set_enabled(&mut self, dir: Direction) {
        debug_assert_eq!(self.closed, 0);
        self.state_mut(dir).enabled = true;
        if self.next_inactivity_timeout_at.is_none() {
            if let Some(d) = self.inactivity_timeout_in {
                self.next_inactivity_timeout_at = Some(Instant::now() + d);
            }
        }
    }

    /// Slides the inactivity deadline forward after successful I/O.
    pub(crate) fn net_activity(&mut self) {
        self.next_inactivity_timeout_at = self.inactivity_timeout_in.map(|d| Instant::now() + d);
    }

    /// Arms the sliding inactivity timeout.
    pub fn set_inactivity_timeout(&mut self, timeout: Duration) {
        self.inactivity_timeout_in = Some(timeout);
        self.next_inactivity_timeout_at = Some(Instant::now() + timeout);
    }

    /// Disarms the inactivity timeout.
    pub fn cancel_inactivity_timeout(&mut self) {
        self.inactivity_timeout_in = None;
        self.next_inactivity_timeout_at = None;
    }

    /// Arms the absolute activity timeout. Fires once.
    pub fn set_active_timeout(&mut self, timeout: Duration) {
        self.active_timeout_in = Some(timeout);
        self.next_activity_timeout_at = Some(Instant::now() + timeout);
    }

    /// Disarms the activity timeout.
    pub fn cancel_active_timeout(&mut self) {
        self.active_timeout_in = None;
        self.next_activity_timeout_at = None;
    }

    /// Requests `event` be delivered when the write buffer drains empty
    /// during a write pass.
    pub fn set_write_buffer_empty_event(&mut self, event: NetEvent) {
        self.write_buffer_empty_event = Some(event);
    }

    /// Installs a transport handshake driven at the write path's hook
    /// point.
    pub fn set_handshaker(&mut self, handshaker: Box<dyn Handshaker>, mode: HandshakeMode) {
        self.handshake = Some(handshaker);
        self.handshake_mode = mode;
    }

    /// Sends out-of-band data, notifying `cont` with `OobComplete` on
    /// full transmission or `Eos` if the peer is gone. Partial or refused
    /// sends are retried from the handler sweep after a short delay. One
    /// send may be in flight per connection.
    pub fn send_oob(&mut self, cont: ContRef, data: &[u8]) {
        debug_assert!(!data.is_empty());
        debug_assert!(self.oob.is_none(), "one OOB send in flight per connection");
        if self.oob.is_some() || data.is_empty() {
            return;
        }
        let written = self.con.send_oob(data);
        if written == data.len() as isize {
            self.oob_signal_or_defer(cont, NetEvent::OobComplete);
        } else if written == 0 {
            self.oob_signal_or_defer(cont, NetEvent::Eos);
        } else if written > 0 {
            self.oob = Some(OobPending {
                cont,
                data: data[written as usize..].to_vec(),
                off: 0,
                retry_at: Instant::now() + OOB_RETRY_DELAY,
                done_event: None,
            });
        } else {
            debug_assert!(
                written == -(libc::EAGAIN as isize) || written == -(libc::ENOTCONN as isize),
                "unexpected OOB send result {written}"
            );
            self.oob = Some(OobPending {
                cont,
                data: data.to_vec(),
                off: 0,
                retry_at: Instant::now() + OOB_RETRY_DELAY,
                done_event: None,
            });
        }
    }

    /// Cancels a pending out-of-band retry.
    pub fn cancel_oob(&mut self) {
        self.oob = None;
    }

    /// Delivers an OOB outcome synchronously when the target mutex is
    /// free; otherwise (the caller holds it) defers to the next sweep.
    fn oob_signal_or_defer(&mut self, cont: ContRef, event: NetEvent) {
        if let Some(mut lock) = try_lock_cont(&cont) {
            self.recursion += 1;
            lock.cont().handle_event(event, self);
            self.recursion -= 1;
        } else {
            self.oob = Some(OobPending {
                cont,
                data: Vec::new(),
                off: 0,
                retry_at: Instant::now(),
                done_event: Some(event),
            });
        }
    }
}

impl std::fmt::Debug for NetVConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetVConnection")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .field("recursion", &self.recursion)
            .field("read_enabled", &self.read.enabled)
            .field("write_enabled", &self.write.enabled)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

/// Outcome of a signal: `Done` means the connection is gone (closed and
/// freed); `Cont` means it survives and shared state may be inspected
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sig {
    Done,
    Cont,
}

/// Delivers `event` through the held VIO lock, with recursion accounting
/// and the deferred close. An event with no continuation installed
/// converts terminal events into a close request.
pub(crate) fn signal_and_update(
    core: &mut HandlerCore,
    id: VcId,
    dir: Direction,
    lock: &mut ContLock,
    event: NetEvent,
) -> Sig {
    let Some(vc) = core.vcs.get_mut(id) else {
        return Sig::Done;
    };
    vc.recursion += 1;
    if vc.state(dir).vio.cont.is_some() {
        lock.cont().handle_event(event, vc);
    } else {
        match event {
            NetEvent::Eos
            | NetEvent::Error
            | NetEvent::ActiveTimeout
            | NetEvent::InactivityTimeout => {
                tracing::debug!(id = %vc.id, ?event, "terminal event with no continuation, closing");
                vc.closed = 1;
            }
            _ => {
                tracing::error!(id = %vc.id, ?event, "unexpected event with no continuation");
                debug_assert!(false, "unexpected event with no continuation");
            }
        }
    }
    vc.recursion -= 1;
    let finish = vc.recursion == 0 && vc.closed != 0;
    apply_pending_reenables(core, id);
    if finish {
        close_vconnection(core, id);
        Sig::Done
    } else {
        Sig::Cont
    }
}

/// Delivers an event through a continuation that is not a VIO holder
/// (accept/connect actions, OOB completions).
pub(crate) fn signal_direct(
    core: &mut HandlerCore,
    id: VcId,
    lock: &mut ContLock,
    event: NetEvent,
) {
    let Some(vc) = core.vcs.get_mut(id) else { return };
    vc.recursion += 1;
    lock.cont().handle_event(event, vc);
    vc.recursion -= 1;
    let finish = vc.recursion == 0 && vc.closed != 0;
    apply_pending_reenables(core, id);
    if finish {
        close_vconnection(core, id);
    }
}

fn signal_done(
    core: &mut HandlerCore,
    id: VcId,
    dir: Direction,
    lock: &mut ContLock,
    event: NetEvent,
) -> Sig {
    if let Some(vc) = core.vcs.get_mut(id) {
        vc.state_mut(dir).enabled = false;
    }
    if signal_and_update(core, id, dir, lock, event) == Sig::Done {
        Sig::Done
    } else {
        reschedule(core, id, dir);
        Sig::Cont
    }
}

fn signal_error(
    core: &mut HandlerCore,
    id: VcId,
    dir: Direction,
    lock: &mut ContLock,
    errno: i32,
) -> Sig {
    if let Some(vc) = core.vcs.get_mut(id) {
        vc.lerrno = errno;
    }
    signal_done(core, id, dir, lock, NetEvent::Error)
}

/// Applies re-enable intents a callback recorded, under the handler lock
/// the caller already holds.
pub(crate) fn apply_pending_reenables(core: &mut HandlerCore, id: VcId) {
    let (read, write) = match core.vcs.get_mut(id) {
        Some(vc) => (
            std::mem::take(&mut vc.pending.read),
            std::mem::take(&mut vc.pending.write),
        ),
        None => return,
    };
    if read {
        reenable_finish(core, id, Direction::Read);
    }
    if write {
        reenable_finish(core, id, Direction::Write);
    }
}

/// The owner-side tail of the re-enable protocol: interest re-installed,
/// ready list corrected against `triggered`. Assumes `enabled` (and the
/// inactivity arm) was already handled by the caller.
fn reenable_finish(core: &mut HandlerCore, id: VcId, dir: Direction) {
    let triggered = {
        let Some(vc) = core.vcs.get_mut(id) else { return };
        if vc.closed != 0 {
            return;
        }
        let interest = vc.ep.interest().add(dir.interest());
        let fd = vc.con.borrowed_fd();
        vc.ep.modify(fd, interest);
        let fd = vc.con.borrowed_fd();
        vc.ep.refresh(fd);
        vc.state(dir).triggered
    };
    if triggered {
        core.ready_in_or_enqueue(dir, id);
    } else {
        core.ready_remove(dir, id);
    }
}

/// Full re-enable on the owner side: sets `enabled`, arms the inactivity
/// clock, and finishes interest/ready-list work. Used by the enable-list
/// flush and the locked [`VioHandle::reenable`] path.
pub(crate) fn reenable_apply(core: &mut HandlerCore, id: VcId, dir: Direction) {
    {
        let Some(vc) = core.vcs.get_mut(id) else { return };
        if vc.closed != 0 {
            return;
        }
        vc.set_enabled(dir);
    }
    reenable_finish(core, id, dir);
}

/// [`VioHandle::reenable`] under the handler lock: no-op when already
/// enabled.
pub(crate) fn reenable_entry(core: &mut HandlerCore, id: VcId, dir: Direction) {
    match core.vcs.get(id) {
        None => return,
        Some(vc) if vc.closed != 0 || vc.state(dir).enabled => return,
        Some(_) => {}
    }
    reenable_apply(core, id, dir);
}

/// [`VioHandle::reenable_re`] under the handler lock: when readiness is
/// already pending the I/O path runs immediately instead of queuing.
pub(crate) fn reenable_re_entry(core: &mut HandlerCore, id: VcId, dir: Direction) {
    let triggered = {
        let Some(vc) = core.vcs.get_mut(id) else { return };
        if vc.closed != 0 {
            return;
        }
        vc.set_enabled(dir);
        let interest = vc.ep.interest().add(dir.interest());
        let fd = vc.con.borrowed_fd();
        vc.ep.modify(fd, interest);
        let fd = vc.con.borrowed_fd();
        vc.ep.refresh(fd);
        vc.state(dir).triggered
    };
    if triggered {
        match dir {
            Direction::Read => net_read_io(core, id),
            Direction::Write => write_to_net_io(core, id),
        }
    } else {
        core.ready_remove(dir, id);
    }
}

fn reschedule(core: &mut HandlerCore, id: VcId, dir: Direction) {
    let wants = {
        let Some(vc) = core.vcs.get_mut(id) else { return };
        let fd = vc.con.borrowed_fd();
        vc.ep.refresh(fd);
        vc.state(dir).triggered && vc.state(dir).enabled
    };
    if wants {
        core.ready_in_or_enqueue(dir, id);
    } else {
        core.ready_remove(dir, id);
    }
}

/// Re-arms the read side and corrects its ready-list membership.
pub(crate) fn read_reschedule(core: &mut HandlerCore, id: VcId) {
    reschedule(core, id, Direction::Read);
}

/// Re-arms the write side and corrects its ready-list membership.
pub(crate) fn write_reschedule(core: &mut HandlerCore, id: VcId) {
    reschedule(core, id, Direction::Write);
}

fn disable(core: &mut HandlerCore, id: VcId, dir: Direction) {
    {
        let Some(vc) = core.vcs.get_mut(id) else { return };
        // Stop the inactivity clock once neither direction wants progress.
        let other_enabled = match dir {
            Direction::Read => vc.write.enabled,
            Direction::Write => vc.read.enabled,
        };
        if !other_enabled {
            vc.next_inactivity_timeout_at = None;
        }
        vc.state_mut(dir).enabled = false;
        let interest = vc.ep.interest().remove(dir.interest());
        let fd = vc.con.borrowed_fd();
        vc.ep.modify(fd, interest);
    }
    core.ready_remove(dir, id);
}

/// Disables the read direction: off the ready list, interest withdrawn.
pub(crate) fn read_disable(core: &mut HandlerCore, id: VcId) {
    disable(core, id, Direction::Read);
}

/// Disables the write direction.
pub(crate) fn write_disable(core: &mut HandlerCore, id: VcId) {
    disable(core, id, Direction::Write);
}

/// Read-side drain entry invoked by the handler for each connection on
/// the read ready list.
pub(crate) fn net_read_io(core: &mut HandlerCore, id: VcId) {
    read_from_net(core, id);
}

/// Makes as much forward progress on the read VIO as one bounded chain of
/// scatter reads allows, signals the continuation, and re-queues the
/// connection as appropriate. Never blocks.
pub(crate) fn read_from_net(core: &mut HandlerCore, id: VcId) {
    let Some(mutex) = core.vcs.get(id).map(|vc| vc.read.vio.mutex.clone()) else {
        return;
    };
    let Some(mut lock) = try_lock_cont(&mutex) else {
        read_reschedule(core, id);
        return;
    };

    // The closed flag may have been set by another holder of the VIO
    // mutex; it is stable now that we hold it.
    match core.vcs.get(id) {
        None => return,
        Some(vc) if vc.closed != 0 => {
            close_vconnection(core, id);
            return;
        }
        Some(_) => {}
    }

    let runnable = core
        .vcs
        .get(id)
        .is_some_and(|vc| vc.read.enabled && vc.read.vio.op == VioOp::Read);
    if !runnable {
        read_disable(core, id);
        return;
    }
    let ntodo = core.vcs.get(id).map_or(0, |vc| vc.read.vio.ntodo());
    if ntodo <= 0 {
        read_disable(core, id);
        return;
    }
    let Some(buf) = core.vcs.get(id).and_then(|vc| vc.read.vio.buffer.clone()) else {
        read_disable(core, id);
        return;
    };
    let toread = (buf.lock().write_avail() as i64).min(ntodo);

    // Scatter-read while each syscall comes back fully satisfied; the
    // repeat bound keeps syscall count proportional to bytes moved.
    let mut r: isize = 0;
    let mut total_read: i64 = 0;
    if toread > 0 {
        let vc = core.vcs.get_mut(id).expect("present: checked above");
        let mut chain = buf.lock();
        loop {
            let budget = (toread - total_read) as usize;
            let mut chunks = chain.writable_chunks(budget, NET_MAX_IOV);
            let rattempted: usize = chunks.iter().map(|c| c.len()).sum();
            if rattempted == 0 {
                break;
            }
            let mut iovs: SmallVec<[IoSliceMut<'_>; NET_MAX_IOV]> =
                chunks.drain(..).map(IoSliceMut::new).collect();
            drop(chunks);
            r = vc.con.readv(&mut iovs);
            drop(iovs);
            core.stats.calls_to_read.increment();
            if r > 0 {
                chain.fill(r as usize);
                total_read += r as i64;
            }
            if r == rattempted as isize && total_read < toread {
                continue;
            }
            break;
        }
    }

    // Fold the run into one signed result: bytes whenever anything
    // landed, otherwise the last syscall's verdict.
    let folded: i64 = if total_read > 0 { total_read } else { r as i64 };

    if toread > 0 {
        if folded <= 0 {
            if folded == -i64::from(libc::EAGAIN) || folded == -i64::from(libc::ENOTCONN) {
                core.stats.calls_to_read_nodata.increment();
                if let Some(vc) = core.vcs.get_mut(id) {
                    vc.read.triggered = false;
                }
                core.ready_remove(Direction::Read, id);
                return;
            }
            if folded == 0 || folded == -i64::from(libc::ECONNRESET) {
                if let Some(vc) = core.vcs.get_mut(id) {
                    vc.read.triggered = false;
                }
                core.ready_remove(Direction::Read, id);
                signal_done(core, id, Direction::Read, &mut lock, NetEvent::Eos);
                return;
            }
            if let Some(vc) = core.vcs.get_mut(id) {
                vc.read.triggered = false;
            }
            signal_error(core, id, Direction::Read, &mut lock, (-folded) as i32);
            return;
        }
        core.stats.read_bytes.add(folded as u64);
        let vc = core.vcs.get_mut(id).expect("present: checked above");
        vc.read.vio.ndone += folded;
        vc.net_activity();
    }

    if toread > 0 && folded > 0 {
        let ntodo_now = core.vcs.get(id).map_or(0, |vc| vc.read.vio.ntodo());
        if ntodo_now <= 0 {
            signal_done(core, id, Direction::Read, &mut lock, NetEvent::ReadComplete);
            return;
        }
        if signal_and_update(core, id, Direction::Read, &mut lock, NetEvent::ReadReady) != Sig::Cont {
            return;
        }
        // Change of lock: the continuation moved the VIO mutex under us.
        match core.vcs.get(id) {
            None => return,
            Some(vc) if !lock.matches(&vc.read.vio.mutex) => {
                read_reschedule(core, id);
                return;
            }
            Some(_) => {}
        }
    }

    let (ntodo_now, enabled, wavail) = match core.vcs.get(id) {
        None => return,
        Some(vc) => (
            vc.read.vio.ntodo(),
            vc.read.enabled,
            vc.read
                .vio
                .buffer
                .as_ref()
                .map_or(0, |b| b.lock().write_avail()),
        ),
    };
    if ntodo_now <= 0 || !enabled || wavail == 0 {
        read_disable(core, id);
        return;
    }
    read_reschedule(core, id);
}

/// Write-side drain entry.
pub(crate) fn write_to_net(core: &mut HandlerCore, id: VcId) {
    core.stats.calls_to_write_afterpoll.increment();
    write_to_net_io(core, id);
}

/// Write counterpart of [`read_from_net`], plus the transport-handshake
/// hook and the write-buffer-empty trap.
pub(crate) fn write_to_net_io(core: &mut HandlerCore, id: VcId) {
    let Some(mutex) = core.vcs.get(id).map(|vc| vc.write.vio.mutex.clone()) else {
        return;
    };
    let Some(mut lock) = try_lock_cont(&mutex) else {
        write_reschedule(core, id);
        return;
    };
    match core.vcs.get(id) {
        None => return,
        Some(vc) if !lock.matches(&vc.write.vio.mutex) => {
            write_reschedule(core, id);
            return;
        }
        Some(_) => {}
    }

    // Transport handshake hook: while incomplete, its result is a
    // scheduling directive and normal write processing is skipped.
    let hs_pending = core
        .vcs
        .get(id)
        .is_some_and(|vc| vc.handshake.as_ref().is_some_and(|h| !h.handshake_complete()));
    if hs_pending {
        let result = {
            let vc = core.vcs.get_mut(id).expect("present: checked above");
            let mode = vc.handshake_mode;
            let mut hs = vc.handshake.take().expect("handshaker present");
            let result = hs.start_handshake(mode, &mut vc.con);
            vc.handshake = Some(hs);
            result
        };
        match result {
            HandshakeResult::Error(err) => {
                if let Some(vc) = core.vcs.get_mut(id) {
                    vc.write.triggered = false;
                }
                signal_error(core, id, Direction::Write, &mut lock, err);
            }
            HandshakeResult::WantRead | HandshakeResult::WantAccept => {
                if let Some(vc) = core.vcs.get_mut(id) {
                    vc.read.triggered = false;
                }
                core.ready_remove(Direction::Read, id);
                read_reschedule(core, id);
            }
            HandshakeResult::WantWrite | HandshakeResult::WantConnect => {
                if let Some(vc) = core.vcs.get_mut(id) {
                    vc.write.triggered = false;
                }
                core.ready_remove(Direction::Write, id);
                write_reschedule(core, id);
            }
            HandshakeResult::Done => {
                let enabled = core.vcs.get_mut(id).is_some_and(|vc| {
                    vc.write.triggered = true;
                    vc.write.enabled
                });
                if enabled {
                    core.ready_in_or_enqueue(Direction::Write, id);
                }
            }
            HandshakeResult::Retry => write_reschedule(core, id),
        }
        return;
    }

    let runnable = core
        .vcs
        .get(id)
        .is_some_and(|vc| vc.write.enabled && vc.write.vio.op == VioOp::Write);
    if !runnable {
        write_disable(core, id);
        return;
    }
    let mut ntodo = core.vcs.get(id).map_or(0, |vc| vc.write.vio.ntodo());
    if ntodo <= 0 {
        write_disable(core, id);
        return;
    }
    let Some(mut buf) = core.vcs.get(id).and_then(|vc| vc.write.vio.buffer.clone()) else {
        write_disable(core, id);
        return;
    };

    let mut towrite = (buf.lock().read_avail() as i64).min(ntodo);
    let mut signalled = false;

    // Invite the producer to refill before the syscall when it has not
    // supplied the full request and there is room to do so.
    let invite = towrite != ntodo && buf.lock().write_avail() > 0;
    if invite {
        if signal_and_update(core, id, Direction::Write, &mut lock, NetEvent::WriteReady)
            != Sig::Cont
        {
            return;
        }
        ntodo = match core.vcs.get(id) {
            None => return,
            Some(vc) => vc.write.vio.ntodo(),
        };
        if ntodo <= 0 {
            write_disable(core, id);
            return;
        }
        signalled = true;
        buf = match core.vcs.get(id).and_then(|vc| vc.write.vio.buffer.clone()) {
            Some(b) => b,
            None => {
                write_disable(core, id);
                return;
            }
        };
        towrite = (buf.lock().read_avail() as i64).min(ntodo);
    }
    if towrite <= 0 {
        write_disable(core, id);
        return;
    }

    let (folded, needs) = load_buffer_and_write(core, id, &buf, towrite);

    if folded <= 0 {
        if folded == -i64::from(libc::EAGAIN) || folded == -i64::from(libc::ENOTCONN) {
            core.stats.calls_to_write_nodata.increment();
            if needs.is_writable() {
                if let Some(vc) = core.vcs.get_mut(id) {
                    vc.write.triggered = false;
                }
                core.ready_remove(Direction::Write, id);
                write_reschedule(core, id);
            }
            if needs.is_readable() {
                if let Some(vc) = core.vcs.get_mut(id) {
                    vc.read.triggered = false;
                }
                core.ready_remove(Direction::Read, id);
                read_reschedule(core, id);
            }
            return;
        }
        if folded == 0 || folded == -i64::from(libc::ECONNRESET) {
            if let Some(vc) = core.vcs.get_mut(id) {
                vc.write.triggered = false;
            }
            signal_done(core, id, Direction::Write, &mut lock, NetEvent::Eos);
            return;
        }
        if let Some(vc) = core.vcs.get_mut(id) {
            vc.write.triggered = false;
        }
        signal_error(core, id, Direction::Write, &mut lock, (-folded) as i32);
        return;
    }

    // Success: consume, account, service the write-buffer-empty trap.
    let wbe_event = core.vcs.get(id).and_then(|vc| vc.write_buffer_empty_event);
    core.stats.write_bytes.add(folded as u64);
    buf.lock().consume(folded as usize);
    {
        let vc = core.vcs.get_mut(id).expect("present: checked above");
        vc.write.vio.ndone += folded;
        if buf.lock().read_avail() == 0 {
            vc.write_buffer_empty_event = None;
        }
        vc.net_activity();
    }

    let ntodo_now = core.vcs.get(id).map_or(0, |vc| vc.write.vio.ntodo());
    if ntodo_now <= 0 {
        signal_done(core, id, Direction::Write, &mut lock, NetEvent::WriteComplete);
        return;
    }
    let wbe_now = core.vcs.get(id).and_then(|vc| vc.write_buffer_empty_event);
    if signalled && wbe_event != wbe_now {
        // Already signalled this pass, and the trap cleared meanwhile:
        // the saved code still has to go out.
        if let Some(event) = wbe_event {
            if signal_and_update(core, id, Direction::Write, &mut lock, event) != Sig::Cont {
                return;
            }
        }
    } else if !signalled {
        if signal_and_update(core, id, Direction::Write, &mut lock, NetEvent::WriteReady)
            != Sig::Cont
        {
            return;
        }
        match core.vcs.get(id) {
            None => return,
            Some(vc) if !lock.matches(&vc.write.vio.mutex) => {
                write_reschedule(core, id);
                return;
            }
            Some(_) => {}
        }
    }

    let empty = core
        .vcs
        .get(id)
        .and_then(|vc| vc.write.vio.buffer.clone())
        .map_or(true, |b| b.lock().read_avail() == 0);
    if empty {
        write_disable(core, id);
        return;
    }
    if needs.is_writable() {
        write_reschedule(core, id);
    }
    if needs.is_readable() {
        read_reschedule(core, id);
    }
}

/// Walks the reader's block chain from its start offset, gathers bounded
/// iovec batches, and writes while each syscall is fully satisfied.
/// Returns the folded signed result and the directions that need
/// re-arming (the write side always does).
fn load_buffer_and_write(
    core: &mut HandlerCore,
    id: VcId,
    buf: &BufHandle,
    towrite: i64,
) -> (i64, Interest) {
    let needs = Interest::WRITABLE;
    let mut r: isize = 0;
    let mut total_written: i64 = 0;
    {
        let Some(vc) = core.vcs.get_mut(id) else {
            return (0, needs);
        };
        let chain = buf.lock();
        loop {
            let budget = (towrite - total_written) as usize;
            let chunks = chain.readable_chunks(total_written as usize, budget, NET_MAX_IOV);
            let wattempted: usize = chunks.iter().map(|c| c.len()).sum();
            if wattempted == 0 {
                break;
            }
            let iovs: SmallVec<[IoSlice<'_>; NET_MAX_IOV]> =
                chunks.iter().map(|c| IoSlice::new(c)).collect();
            r = vc.con.writev(&iovs);
            core.stats.calls_to_write.increment();
            if r > 0 {
                total_written += r as i64;
            }
            if r == wattempted as isize && total_written < towrite {
                continue;
            }
            break;
        }
    }
    let folded = if total_written > 0 { total_written } else { r as i64 };
    (folded, needs)
}

/// Timeout delivery: verifies the firing deadline, disarms it, and
/// signals first the read side, then — when a distinct continuation owns
/// it — the write side. The two-step order avoids delivering the same
/// timeout twice to a continuation that owns both directions.
pub(crate) fn main_event(core: &mut HandlerCore, id: VcId, kind: TimeoutKind, now: Instant) {
    let (read_mutex, write_mutex) = match core.vcs.get(id) {
        None => return,
        Some(vc) => {
            debug_assert_eq!(vc.lifecycle, VcLifecycle::Main);
            (vc.read.vio.mutex.clone(), vc.write.vio.mutex.clone())
        }
    };
    // Both VIO mutexes are required; a miss leaves the deadline armed and
    // the sweep retries after the configured delay.
    let shared = Arc::ptr_eq(&read_mutex, &write_mutex);
    let Some(mut rlock) = try_lock_cont(&read_mutex) else {
        return;
    };
    let mut wlock = if shared {
        None
    } else {
        match try_lock_cont(&write_mutex) {
            Some(lock) => Some(lock),
            None => return,
        }
    };

    {
        let Some(vc) = core.vcs.get_mut(id) else { return };
        match kind {
            TimeoutKind::Inactivity => {
                // Spurious fire after a disarm or a fresh activity bump.
                let due = vc.inactivity_timeout_in.is_some()
                    && vc.next_inactivity_timeout_at.is_some_and(|at| at <= now);
                if !due {
                    return;
                }
                vc.next_inactivity_timeout_at = None;
            }
            TimeoutKind::Active => {
                if !vc.next_activity_timeout_at.is_some_and(|at| at <= now) {
                    return;
                }
                vc.next_activity_timeout_at = None;
            }
        }
    }

    let event = match kind {
        TimeoutKind::Inactivity => NetEvent::InactivityTimeout,
        TimeoutKind::Active => NetEvent::ActiveTimeout,
    };
    let writer_cont = core.vcs.get(id).and_then(|vc| vc.write.vio.cont.clone());

    if core.vcs.get(id).is_some_and(|vc| vc.closed != 0) {
        close_vconnection(core, id);
        return;
    }

    let mut reader_cont: Option<ContRef> = None;
    let read_side = core
        .vcs
        .get(id)
        .is_some_and(|vc| vc.read.vio.op == VioOp::Read && !vc.shutdown.read_shut());
    if read_side {
        reader_cont = core.vcs.get(id).and_then(|vc| vc.read.vio.cont.clone());
        if signal_and_update(core, id, Direction::Read, &mut rlock, event) == Sig::Done {
            return;
        }
    }

    // Skip the write half when the continuation re-armed the deadline,
    // the close landed, the write side changed hands mid-signal, or the
    // same continuation owns both directions.
    let fire_write = match core.vcs.get(id) {
        None => false,
        Some(vc) => {
            let rearmed = match kind {
                TimeoutKind::Inactivity => vc.next_inactivity_timeout_at.is_some(),
                TimeoutKind::Active => vc.next_activity_timeout_at.is_some(),
            };
            !rearmed
                && vc.closed == 0
                && vc.write.vio.op == VioOp::Write
                && !vc.shutdown.write_shut()
                && !crate::cont::same_cont(reader_cont.as_ref(), vc.write.vio.cont.as_ref())
                && crate::cont::same_cont(writer_cont.as_ref(), vc.write.vio.cont.as_ref())
        }
    };
    if fire_write {
        let lock = wlock.as_mut().unwrap_or(&mut rlock);
        signal_and_update(core, id, Direction::Write, lock, event);
    }
}

/// Retries or completes a pending out-of-band send from the handler
/// sweep.
pub(crate) fn oob_retry(core: &mut HandlerCore, id: VcId, now: Instant) {
    let retry_delay = core.config.retry_delay;
    let Some(mut oob) = core.vcs.get_mut(id).and_then(|vc| {
        if vc.oob.as_ref().is_some_and(|o| o.retry_at <= now) {
            vc.oob.take()
        } else {
            None
        }
    }) else {
        return;
    };

    // Deferred completion: the target mutex was held at send time.
    if let Some(event) = oob.done_event {
        if let Some(mut lock) = try_lock_cont(&oob.cont) {
            signal_direct(core, id, &mut lock, event);
        } else {
            oob.retry_at = now + retry_delay;
            if let Some(vc) = core.vcs.get_mut(id) {
                vc.oob = Some(oob);
            }
        }
        return;
    }

    let written = {
        let Some(vc) = core.vcs.get_mut(id) else { return };
        let remaining = &oob.data[oob.off..];
        vc.con.send_oob(remaining)
    };
    let remaining_len = (oob.data.len() - oob.off) as isize;
    if written == remaining_len {
        let cont = oob.cont.clone();
        if let Some(mut lock) = try_lock_cont(&cont) {
            signal_direct(core, id, &mut lock, NetEvent::OobComplete);
        } else {
            oob.done_event = Some(NetEvent::OobComplete);
            oob.retry_at = now + retry_delay;
            if let Some(vc) = core.vcs.get_mut(id) {
                vc.oob = Some(oob);
            }
        }
    } else if written == 0 {
        let cont = oob.cont.clone();
        if let Some(mut lock) = try_lock_cont(&cont) {
            signal_direct(core, id, &mut lock, NetEvent::Eos);
        } else {
            oob.done_event = Some(NetEvent::Eos);
            oob.retry_at = now + retry_delay;
            if let Some(vc) = core.vcs.get_mut(id) {
                vc.oob = Some(oob);
            }
        }
    } else {
        if written > 0 {
            oob.off += written as usize;
        }
        oob.retry_at = now + retry_delay;
        if let Some(vc) = core.vcs.get_mut(id) {
            vc.oob = Some(oob);
        }
    }
}
