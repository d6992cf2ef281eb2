//! Per-thread scheduler for virtual connections.
//!
//! A [`NetHandler`] owns every connection assigned to its thread: the
//! slab, the open and cop lists, the per-direction ready lists, and the
//! keep-alive/active queues, all behind one mutex (`core`). The owning
//! thread holds that mutex for the whole of [`NetHandler::run_once`]:
//! poll, flush the cross-thread enable lists, drain the ready lists, and
//! sweep timeouts. Because the lock is held across the poll, a re-enable
//! from another thread almost always misses the try-lock and takes the
//! enable-list path, waking the poller to bound the latency.
//!
//! The enable lists are the only cross-thread ingress: lock-free queues
//! plus a per-connection claim bit so a connection is pushed at most
//! once. Everything else happens under the core mutex, which doubles as
//! the thread-affinity token — whoever holds it *is* the owner for the
//! duration.

use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::config::NetConfig;
use crate::cont::{lock_cont, ContRef, NetEvent};
use crate::error::{NetError, ENET_THROTTLING};
use crate::handshake::HandshakeMode;
use crate::poll::{Interest, PollDescriptor, ReadyEvent};
use crate::slot::{VcId, VcSlab};
use crate::sock::{errno_from, Connection, NetVcOptions};
use crate::state::Direction;
use crate::stats::NetStats;
use crate::vconn::{
    apply_pending_reenables, main_event, net_read_io, oob_retry, reenable_apply, signal_direct,
    write_to_net, NetVConnection, TimeoutKind, VcLifecycle,
};

/// Handler-owned membership lists beyond the ready lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VcList {
    Open,
    Cop,
    KeepAlive,
    ActiveQ,
}

fn list_remove(q: &mut VecDeque<VcId>, id: VcId) {
    if let Some(pos) = q.iter().position(|x| *x == id) {
        q.remove(pos);
    }
}

/// Everything the handler mutex protects.
pub(crate) struct HandlerCore {
    pub(crate) vcs: VcSlab,
    pub(crate) open_list: VecDeque<VcId>,
    pub(crate) cop_list: VecDeque<VcId>,
    pub(crate) read_ready_list: VecDeque<VcId>,
    pub(crate) write_ready_list: VecDeque<VcId>,
    pub(crate) keep_alive_queue: VecDeque<VcId>,
    pub(crate) active_queue: VecDeque<VcId>,
    pub(crate) poll: Arc<dyn PollDescriptor>,
    pub(crate) stats: Arc<NetStats>,
    pub(crate) config: NetConfig,
    pub(crate) owner: Option<ThreadId>,
}

impl HandlerCore {
    fn list_of(&mut self, list: VcList) -> &mut VecDeque<VcId> {
        match list {
            VcList::Open => &mut self.open_list,
            VcList::Cop => &mut self.cop_list,
            VcList::KeepAlive => &mut self.keep_alive_queue,
            VcList::ActiveQ => &mut self.active_queue,
        }
    }

    fn membership_flag(vc: &mut NetVConnection, list: VcList) -> &mut bool {
        match list {
            VcList::Open => &mut vc.in_open_list,
            VcList::Cop => &mut vc.in_cop_list,
            VcList::KeepAlive => &mut vc.in_keep_alive_queue,
            VcList::ActiveQ => &mut vc.in_active_queue,
        }
    }

    pub(crate) fn list_enqueue(&mut self, list: VcList, id: VcId) {
        let newly = match self.vcs.get_mut(id) {
            Some(vc) => {
                let flag = Self::membership_flag(vc, list);
                if *flag {
                    false
                } else {
                    *flag = true;
                    true
                }
            }
            None => false,
        };
        if newly {
            self.list_of(list).push_back(id);
        }
    }

    pub(crate) fn list_remove_id(&mut self, list: VcList, id: VcId) {
        let was = match self.vcs.get_mut(id) {
            Some(vc) => {
                let flag = Self::membership_flag(vc, list);
                std::mem::take(flag)
            }
            None => false,
        };
        if was {
            list_remove(self.list_of(list), id);
        }
    }

    fn ready_list_of(&mut self, dir: Direction) -> &mut VecDeque<VcId> {
        match dir {
            Direction::Read => &mut self.read_ready_list,
            Direction::Write => &mut self.write_ready_list,
        }
    }

    /// Ready-list enqueue, idempotent via the membership flag.
    pub(crate) fn ready_in_or_enqueue(&mut self, dir: Direction, id: VcId) {
        let newly = match self.vcs.get_mut(id) {
            Some(vc) => {
                let state = vc.state_mut(dir);
                if state.in_ready_list {
                    false
                } else {
                    state.in_ready_list = true;
                    true
                }
            }
            None => false,
        };
        if newly {
            self.ready_list_of(dir).push_back(id);
        }
    }

    pub(crate) fn ready_remove(&mut self, dir: Direction, id: VcId) {
        let was = match self.vcs.get_mut(id) {
            Some(vc) => std::mem::take(&mut vc.state_mut(dir).in_ready_list),
            None => false,
        };
        if was {
            list_remove(self.ready_list_of(dir), id);
        }
    }

    /// Takes the current ready batch, clearing membership. Connections
    /// rescheduled during processing wait for the next pass, which bounds
    /// work per drain.
    fn drain_ready(&mut self, dir: Direction) -> Vec<VcId> {
        let ids: Vec<VcId> = self.ready_list_of(dir).drain(..).collect();
        for &id in &ids {
            if let Some(vc) = self.vcs.get_mut(id) {
                vc.state_mut(dir).in_ready_list = false;
            }
        }
        ids
    }
}

/// Destroys a connection: OOB cancelled, poller deregistered, socket
/// closed, deadlines disarmed, every queue detached, storage freed.
/// Idempotent against stale ids.
pub(crate) fn close_vconnection(core: &mut HandlerCore, id: VcId) {
    let memberships = {
        let Some(vc) = core.vcs.get_mut(id) else { return };
        debug_assert!(
            vc.owner.is_none() || vc.owner == Some(std::thread::current().id()),
            "close off the owning thread"
        );
        vc.oob = None;
        let fd = vc.con.borrowed_fd();
        vc.ep.stop(fd);
        vc.con.close();
        vc.next_inactivity_timeout_at = None;
        vc.next_activity_timeout_at = None;
        vc.inactivity_timeout_in = None;
        vc.active_timeout_in = None;
        vc.enable_flags.read.store(false, Ordering::Release);
        vc.enable_flags.write.store(false, Ordering::Release);
        let memberships = (
            std::mem::take(&mut vc.in_open_list),
            std::mem::take(&mut vc.in_cop_list),
            std::mem::take(&mut vc.read.in_ready_list),
            std::mem::take(&mut vc.write.in_ready_list),
            std::mem::take(&mut vc.in_keep_alive_queue),
            std::mem::take(&mut vc.in_active_queue),
        );
        memberships
    };
    if memberships.0 {
        list_remove(&mut core.open_list, id);
    }
    if memberships.1 {
        list_remove(&mut core.cop_list, id);
    }
    if memberships.2 {
        list_remove(&mut core.read_ready_list, id);
    }
    if memberships.3 {
        list_remove(&mut core.write_ready_list, id);
    }
    if memberships.4 {
        list_remove(&mut core.keep_alive_queue, id);
    }
    if memberships.5 {
        list_remove(&mut core.active_queue, id);
    }
    if let Some(vc) = core.vcs.remove(id) {
        free_vconnection(core, &vc);
    }
}

fn free_vconnection(core: &mut HandlerCore, vc: &NetVConnection) {
    debug_assert!(!vc.read.in_ready_list && !vc.write.in_ready_list);
    debug_assert!(!vc.in_open_list && !vc.in_cop_list);
    debug_assert!(vc.next_inactivity_timeout_at.is_none());
    debug_assert!(vc.next_activity_timeout_at.is_none());
    debug_assert!(!vc.con.is_open());
    debug_assert_eq!(vc.recursion, 0);
    core.stats.connections_currently_open.decrement();
    tracing::trace!(
        id = %vc.id,
        from_accept_thread = vc.from_accept_thread,
        error_close = vc.closed < 0,
        "virtual connection freed"
    );
}

/// Timeout/OOB sweep over a copy of the open list.
fn sweep_locked(core: &mut HandlerCore, now: Instant) {
    let ids: Vec<VcId> = core.open_list.iter().copied().collect();
    core.cop_list.clear();
    for &id in &ids {
        core.list_enqueue(VcList::Cop, id);
    }
    while let Some(id) = core.cop_list.pop_front() {
        match core.vcs.get_mut(id) {
            Some(vc) => vc.in_cop_list = false,
            None => continue,
        }
        // A close requested off the drain path is finished here.
        if core
            .vcs
            .get(id)
            .is_some_and(|vc| vc.closed != 0 && vc.recursion == 0)
        {
            close_vconnection(core, id);
            continue;
        }
        oob_retry(core, id, now);
        if core
            .vcs
            .get(id)
            .is_some_and(|vc| vc.next_inactivity_timeout_at.is_some_and(|at| at <= now))
        {
            main_event(core, id, TimeoutKind::Inactivity, now);
        }
        if core
            .vcs
            .get(id)
            .is_some_and(|vc| vc.next_activity_timeout_at.is_some_and(|at| at <= now))
        {
            main_event(core, id, TimeoutKind::Active, now);
        }
    }
}

/// Per-thread scheduler state: slab, lists, enable queues, and the poll
/// descriptor. Shared as `Arc`; the owning thread drives
/// [`run_once`](Self::run_once), other threads are limited to the
/// enable-list/wake path and the locking public API.
pub struct NetHandler {
    core: Mutex<HandlerCore>,
    read_enable_list: SegQueue<VcId>,
    write_enable_list: SegQueue<VcId>,
    poll: Arc<dyn PollDescriptor>,
    config: NetConfig,
    stats: Arc<NetStats>,
}

impl NetHandler {
    /// Creates a handler over the given poll descriptor.
    #[must_use]
    pub fn new(poll: Arc<dyn PollDescriptor>, config: NetConfig, stats: Arc<NetStats>) -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(HandlerCore {
                vcs: VcSlab::new(),
                open_list: VecDeque::new(),
                cop_list: VecDeque::new(),
                read_ready_list: VecDeque::new(),
                write_ready_list: VecDeque::new(),
                keep_alive_queue: VecDeque::new(),
                active_queue: VecDeque::new(),
                poll: Arc::clone(&poll),
                stats: Arc::clone(&stats),
                config: config.clone(),
                owner: None,
            }),
            read_enable_list: SegQueue::new(),
            write_enable_list: SegQueue::new(),
            poll,
            config,
            stats,
        })
    }

    pub(crate) fn try_lock_core(&self) -> Option<MutexGuard<'_, HandlerCore>> {
        self.core.try_lock()
    }

    pub(crate) fn push_enable(&self, dir: Direction, id: VcId) {
        match dir {
            Direction::Read => self.read_enable_list.push(id),
            Direction::Write => self.write_enable_list.push(id),
        }
    }

    pub(crate) fn wake(&self) {
        self.poll.wake();
    }

    /// Shared statistics block.
    #[must_use]
    pub fn stats(&self) -> &Arc<NetStats> {
        &self.stats
    }

    /// This handler's configuration.
    #[must_use]
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// One scheduler pass on the owning thread: poll for readiness, flush
    /// the cross-thread enable lists, drain both ready lists, then sweep
    /// timeouts and out-of-band retries. Returns the number of readiness
    /// events observed.
    pub fn run_once(self: &Arc<Self>, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events: Vec<ReadyEvent> = Vec::new();
        let mut core = self.core.lock();
        core.owner = Some(std::thread::current().id());
        let timeout = Some(timeout.unwrap_or(self.config.poll_timeout));
        let n = core.poll.wait(&mut events, timeout)?;

        // Readiness observed: mark triggered and queue for the drain.
        for ev in events.drain(..) {
            let id = VcId::from_key(ev.key);
            if !core.vcs.contains(id) {
                continue;
            }
            if ev.readable {
                if let Some(vc) = core.vcs.get_mut(id) {
                    vc.read.triggered = true;
                }
                core.ready_in_or_enqueue(Direction::Read, id);
            }
            if ev.writable {
                if let Some(vc) = core.vcs.get_mut(id) {
                    vc.write.triggered = true;
                }
                core.ready_in_or_enqueue(Direction::Write, id);
            }
        }

        self.process_enabled_lists(&mut core);

        for id in core.drain_ready(Direction::Read) {
            net_read_io(&mut core, id);
        }
        for id in core.drain_ready(Direction::Write) {
            write_to_net(&mut core, id);
        }

        sweep_locked(&mut core, Instant::now());
        Ok(n)
    }

    /// Flushes the cross-thread enable lists: each claimed connection is
    /// re-enabled on the owner side, or queued for the drain when its
    /// close already landed.
    fn process_enabled_lists(&self, core: &mut HandlerCore) {
        for dir in [Direction::Read, Direction::Write] {
            let queue = match dir {
                Direction::Read => &self.read_enable_list,
                Direction::Write => &self.write_enable_list,
            };
            while let Some(id) = queue.pop() {
                let present = match core.vcs.get_mut(id) {
                    Some(vc) => {
                        vc.enable_flags.flag(dir).store(false, Ordering::Release);
                        true
                    }
                    None => false,
                };
                if !present {
                    continue;
                }
                if core.vcs.get(id).is_some_and(|vc| vc.closed != 0) {
                    // Queue it so the drain observes the close.
                    core.ready_in_or_enqueue(dir, id);
                } else {
                    reenable_apply(core, id, dir);
                }
            }
        }
    }

    /// Runs the timeout/OOB sweep against an explicit clock. Exposed so
    /// deterministic tests can drive deadlines without sleeping.
    pub fn sweep_timeouts_at(&self, now: Instant) {
        let mut core = self.core.lock();
        sweep_locked(&mut core, now);
    }

    /// Accepts an inbound stream: wraps it non-blocking, registers it,
    /// arms configured timeouts, and delivers `NetEvent::Accept` to
    /// `action` with the new connection as payload.
    ///
    /// The `action` mutex must not be held by the caller.
    pub fn accept_socket(
        self: &Arc<Self>,
        stream: TcpStream,
        action: ContRef,
        options: NetVcOptions,
    ) -> Result<VcId, NetError> {
        let con = Connection::from_stream(stream).map_err(NetError::Socket)?;
        self.accept_connection(con, action, options)
    }

    /// [`accept_socket`](Self::accept_socket) over a pre-built
    /// [`Connection`] (lab sockets, wired-up descriptors).
    pub fn accept_connection(
        self: &Arc<Self>,
        con: Connection,
        action: ContRef,
        options: NetVcOptions,
    ) -> Result<VcId, NetError> {
        let mut core = self.core.lock();
        let owner = core.owner;
        let id = core.vcs.insert_with(|id| {
            let mut vc = NetVConnection::new(id, Arc::downgrade(self), con);
            vc.handshake_mode = HandshakeMode::Server;
            vc.from_accept_thread = true;
            vc.owner = owner;
            vc.lifecycle = VcLifecycle::Main;
            vc
        });
        core.stats.connections_currently_open.increment();

        let start_err = {
            let poll = Arc::clone(&core.poll);
            let vc = core.vcs.get_mut(id).expect("fresh vc");
            vc.con.options = options;
            vc.con.apply_options();
            let key = id.as_key();
            let fd = vc.con.borrowed_fd();
            vc.ep.start(&poll, key, fd, Interest::both()).err()
        };
        if let Some(e) = start_err {
            tracing::debug!(id = %id, error = %e, "accept: poller registration failed");
            close_vconnection(&mut core, id);
            return Err(NetError::Register(e));
        }

        core.list_enqueue(VcList::Open, id);
        {
            let vc = core.vcs.get_mut(id).expect("fresh vc");
            // Edge triggering: bytes may already sit on the socket, so the
            // first drain must not wait for an edge that already fired.
            vc.read.triggered = true;
        }
        core.ready_in_or_enqueue(Direction::Read, id);
        {
            let default_inactivity_timeout = core.config.default_inactivity_timeout;
            let default_active_timeout = core.config.default_active_timeout;
            let vc = core.vcs.get_mut(id).expect("fresh vc");
            if let Some(d) = default_inactivity_timeout {
                vc.set_inactivity_timeout(d);
            }
            if let Some(d) = default_active_timeout {
                vc.set_active_timeout(d);
            }
            vc.action = Some(action.clone());
        }

        let mut lock = lock_cont(&action);
        signal_direct(&mut core, id, &mut lock, NetEvent::Accept);
        Ok(id)
    }

    /// Brings up an outbound connection: throttle gate, socket open and
    /// bind, poller registration (before the connect, so an immediately
    /// completing connect cannot lose its edge), then the non-blocking
    /// connect. Delivers `Open` on success and `OpenFailed` with a
    /// negative errno (or `-ENET_THROTTLING`) on failure.
    ///
    /// The `action` mutex must not be held by the caller.
    pub fn connect_up(
        self: &Arc<Self>,
        remote: SocketAddr,
        action: ContRef,
        options: NetVcOptions,
    ) -> Result<VcId, NetError> {
        let mut core = self.core.lock();
        if let Some(max) = core.config.max_open_connections {
            if core.stats.connections_currently_open.get() >= max as i64 {
                core.stats.connections_throttled_out.increment();
                tracing::warn!(%remote, "outbound connect throttled");
                let id = core
                    .vcs
                    .insert_with(|id| NetVConnection::new(id, Arc::downgrade(self), Connection::empty()));
                core.stats.connections_currently_open.increment();
                let mut lock = lock_cont(&action);
                signal_direct(&mut core, id, &mut lock, NetEvent::OpenFailed(-ENET_THROTTLING));
                drop(lock);
                if core.vcs.contains(id) {
                    close_vconnection(&mut core, id);
                }
                return Err(NetError::Throttled);
            }
        }

        let owner = core.owner;
        let id = core.vcs.insert_with(|id| {
            let mut vc = NetVConnection::new(id, Arc::downgrade(self), Connection::empty());
            vc.handshake_mode = HandshakeMode::Client;
            vc.owner = owner;
            vc
        });
        core.stats.connections_currently_open.increment();

        let open_err = {
            let vc = core.vcs.get_mut(id).expect("fresh vc");
            vc.con.open(remote, &options).err()
        };
        if let Some(e) = open_err {
            return Self::connect_fail(&mut core, id, &action, e, NetError::Socket);
        }

        let start_err = {
            let poll = Arc::clone(&core.poll);
            let vc = core.vcs.get_mut(id).expect("fresh vc");
            let key = id.as_key();
            let fd = vc.con.borrowed_fd();
            vc.ep.start(&poll, key, fd, Interest::both()).err()
        };
        if let Some(e) = start_err {
            tracing::debug!(id = %id, error = %e, "connect: poller registration failed");
            return Self::connect_fail(&mut core, id, &action, e, NetError::Register);
        }

        let conn_err = {
            let vc = core.vcs.get_mut(id).expect("fresh vc");
            vc.con.connect(remote).err()
        };
        if let Some(e) = conn_err {
            return Self::connect_fail(&mut core, id, &action, e, NetError::Connect);
        }

        {
            let vc = core.vcs.get_mut(id).expect("fresh vc");
            vc.lifecycle = VcLifecycle::Main;
            vc.action = Some(action.clone());
            debug_assert!(vc.inactivity_timeout_in.is_none());
            debug_assert!(vc.active_timeout_in.is_none());
        }
        core.list_enqueue(VcList::Open, id);

        let mut lock = lock_cont(&action);
        signal_direct(&mut core, id, &mut lock, NetEvent::Open);
        Ok(id)
    }

    fn connect_fail(
        core: &mut HandlerCore,
        id: VcId,
        action: &ContRef,
        e: io::Error,
        wrap: fn(io::Error) -> NetError,
    ) -> Result<VcId, NetError> {
        let errno = errno_from(&e);
        if let Some(vc) = core.vcs.get_mut(id) {
            vc.lerrno = errno;
        }
        let mut lock = lock_cont(action);
        signal_direct(core, id, &mut lock, NetEvent::OpenFailed(-errno));
        drop(lock);
        if core.vcs.contains(id) {
            close_vconnection(core, id);
        }
        Err(wrap(e))
    }

    /// Runs `f` against a live connection under the handler lock, then
    /// applies any re-enable intents and finishes a requested close —
    /// the out-of-callback counterpart of the signal frame.
    pub fn with_vc<R>(&self, id: VcId, f: impl FnOnce(&mut NetVConnection) -> R) -> Option<R> {
        let mut core = self.core.lock();
        let result = {
            let vc = core.vcs.get_mut(id)?;
            f(vc)
        };
        apply_pending_reenables(&mut core, id);
        if core
            .vcs
            .get(id)
            .is_some_and(|vc| vc.recursion == 0 && vc.closed != 0)
        {
            close_vconnection(&mut core, id);
        }
        Some(result)
    }

    /// Parks a connection on the keep-alive queue (session reuse pools).
    pub fn add_to_keep_alive_queue(&self, id: VcId) {
        self.core.lock().list_enqueue(VcList::KeepAlive, id);
    }

    /// Removes a connection from the keep-alive queue.
    pub fn remove_from_keep_alive_queue(&self, id: VcId) {
        self.core.lock().list_remove_id(VcList::KeepAlive, id);
    }

    /// Tracks a connection on the active queue.
    pub fn add_to_active_queue(&self, id: VcId) {
        self.core.lock().list_enqueue(VcList::ActiveQ, id);
    }

    /// Removes a connection from the active queue.
    pub fn remove_from_active_queue(&self, id: VcId) {
        self.core.lock().list_remove_id(VcList::ActiveQ, id);
    }

    /// Moves a connection to `target`: the socket (and any transport
    /// handshake state) is carried over, the husk is closed on `source`
    /// without touching the moved descriptor, and a fresh connection is
    /// populated and registered on the target handler. The open-connection
    /// gauge is unchanged by the pair.
    pub fn migrate_to_current_thread(
        source: &Arc<NetHandler>,
        id: VcId,
        target: &Arc<NetHandler>,
        cont: ContRef,
    ) -> Result<VcId, NetError> {
        if Arc::ptr_eq(source, target) {
            return Ok(id);
        }
        let (con, handshake, mode, from_accept) = {
            let mut core = source.core.lock();
            let Some(vc) = core.vcs.get_mut(id) else {
                return Err(NetError::Stale);
            };
            // Holding the source core is the ownership token here; the
            // migrating thread takes over from whichever thread drove the
            // handler last.
            vc.owner = None;
            // Deregister before the move so the descriptor is never
            // polled by two handlers at once.
            let fd = vc.con.borrowed_fd();
            vc.ep.stop(fd);
            let con = Connection::move_from(&mut vc.con);
            let handshake = vc.handshake.take();
            let mode = vc.handshake_mode;
            let from_accept = vc.from_accept_thread;
            // The husk closes here; the fd moved out, so close_vconnection
            // cannot touch it.
            vc.do_io_close(None);
            close_vconnection(&mut core, id);
            (con, handshake, mode, from_accept)
        };

        let mut core = target.core.lock();
        let owner = core.owner;
        let new_id = core.vcs.insert_with(|nid| {
            let mut vc = NetVConnection::new(nid, Arc::downgrade(target), con);
            vc.handshake = handshake;
            vc.handshake_mode = mode;
            vc.from_accept_thread = from_accept;
            vc.owner = owner;
            vc.lifecycle = VcLifecycle::Main;
            vc.action = Some(cont);
            vc
        });
        // The source-side close decremented the gauge; this restores it,
        // leaving the net stat unchanged.
        core.stats.connections_currently_open.increment();

        let start_err = {
            let poll = Arc::clone(&core.poll);
            let vc = core.vcs.get_mut(new_id).expect("fresh vc");
            let key = new_id.as_key();
            let fd = vc.con.borrowed_fd();
            vc.ep.start(&poll, key, fd, Interest::both()).err()
        };
        if let Some(e) = start_err {
            tracing::debug!(id = %new_id, error = %e, "migrate: poller registration failed");
            if let Some(vc) = core.vcs.get_mut(new_id) {
                vc.do_io_close(None);
            }
            close_vconnection(&mut core, new_id);
            return Err(NetError::Register(e));
        }
        core.list_enqueue(VcList::Open, new_id);
        Ok(new_id)
    }

    /// Number of connections on the open list.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.core.lock().open_list.len()
    }

    /// Whether `id` resolves to a live connection on this handler.
    #[must_use]
    pub fn vc_exists(&self, id: VcId) -> bool {
        self.core.lock().vcs.contains(id)
    }

    /// Open-list membership, for inspection.
    #[must_use]
    pub fn open_list_contains(&self, id: VcId) -> bool {
        self.core.lock().open_list.contains(&id)
    }

    /// Ready-list membership, for inspection.
    #[must_use]
    pub fn ready_list_contains(&self, dir: Direction, id: VcId) -> bool {
        let core = self.core.lock();
        match dir {
            Direction::Read => core.read_ready_list.contains(&id),
            Direction::Write => core.write_ready_list.contains(&id),
        }
    }

    /// The cross-thread enable-list claim for one direction, or `None`
    /// for a stale id.
    #[must_use]
    pub fn in_enabled_list(&self, dir: Direction, id: VcId) -> Option<bool> {
        let core = self.core.lock();
        core.vcs
            .get(id)
            .map(|vc| vc.enable_flags.flag(dir).load(Ordering::Acquire))
    }
}

impl std::fmt::Debug for NetHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock();
        f.debug_struct("NetHandler")
            .field("connections", &core.vcs.len())
            .field("open", &core.open_list.len())
            .field("read_ready", &core.read_ready_list.len())
            .field("write_ready", &core.write_ready_list.len())
            .finish_non_exhaustive()
    }
}
