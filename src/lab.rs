//! Deterministic test doubles.
//!
//! Real reactors and kernels make the I/O paths timing-dependent; these
//! doubles make them scriptable:
//!
//! - [`LabPoll`]: a poll descriptor whose readiness is injected by test
//!   code. `wait` drains whatever was injected and never blocks, and the
//!   wake flag records cross-thread wakeups instead of interrupting
//!   anything.
//! - [`ScriptedSock`]: a socket whose syscall results are scripted —
//!   data, short reads, `-EAGAIN`, `-ECONNRESET`, end-of-stream, partial
//!   write acceptance — while recording everything written.
//!
//! Together they let every drain-loop and lifecycle scenario run
//! deterministically: inject readiness, run one handler pass, assert.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::{self, IoSlice, IoSliceMut};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::poll::{Interest, PollDescriptor, ReadyEvent};
use crate::slot::VcId;
use crate::sock::SockIo;
use crate::state::Direction;

#[derive(Debug)]
struct LabPollInner {
    registered: HashMap<usize, Interest>,
    pending: VecDeque<ReadyEvent>,
}

/// Deterministic poll descriptor with injected readiness.
#[derive(Debug)]
pub struct LabPoll {
    inner: Mutex<LabPollInner>,
    woken: AtomicBool,
}

impl LabPoll {
    /// Creates a lab poll descriptor.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LabPollInner {
                registered: HashMap::new(),
                pending: VecDeque::new(),
            }),
            woken: AtomicBool::new(false),
        })
    }

    /// Injects a readiness event for `key`, delivered by the next `wait`.
    pub fn inject(&self, key: usize, readable: bool, writable: bool) {
        self.inner.lock().pending.push_back(ReadyEvent {
            key,
            readable,
            writable,
        });
    }

    /// Injects readiness for one direction of a connection.
    pub fn inject_ready(&self, id: VcId, dir: Direction) {
        match dir {
            Direction::Read => self.inject(id.as_key(), true, false),
            Direction::Write => self.inject(id.as_key(), false, true),
        }
    }

    /// Returns and clears the wake flag.
    pub fn take_woken(&self) -> bool {
        self.woken.swap(false, Ordering::AcqRel)
    }

    /// The interest currently registered under `key`.
    #[must_use]
    pub fn registered_interest(&self, key: usize) -> Option<Interest> {
        self.inner.lock().registered.get(&key).copied()
    }

    /// Number of live registrations.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.inner.lock().registered.len()
    }
}

impl PollDescriptor for LabPoll {
    fn add(&self, _fd: Option<BorrowedFd<'_>>, key: usize, interest: Interest) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.registered.contains_key(&key) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "key already registered"));
        }
        inner.registered.insert(key, interest);
        Ok(())
    }

    fn modify(&self, _fd: Option<BorrowedFd<'_>>, key: usize, interest: Interest) -> io::Result<()> {
        let mut inner = self.inner.lock();
        match inner.registered.get_mut(&key) {
            Some(slot) => {
                *slot = interest;
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "key not registered")),
        }
    }

    fn delete(&self, _fd: Option<BorrowedFd<'_>>, key: usize) -> io::Result<()> {
        let mut inner = self.inner.lock();
        match inner.registered.remove(&key) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "key not registered")),
        }
    }

    fn wait(&self, out: &mut Vec<ReadyEvent>, _timeout: Option<Duration>) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        let n = inner.pending.len();
        out.extend(inner.pending.drain(..));
        Ok(n)
    }

    fn wake(&self) {
        self.woken.store(true, Ordering::Release);
    }

    fn persistent(&self) -> bool {
        true
    }
}

/// One scripted read outcome.
#[derive(Debug)]
enum ReadStep {
    Data(Vec<u8>),
    Err(i32),
    Eof,
}

/// One scripted write outcome.
#[derive(Debug)]
enum WriteStep {
    Accept(usize),
    Err(i32),
}

#[derive(Debug, Default)]
struct ScriptState {
    incoming: VecDeque<ReadStep>,
    write_steps: VecDeque<WriteStep>,
    written: Vec<u8>,
    oob_results: VecDeque<isize>,
    oob_sent: Vec<u8>,
    shutdowns: Vec<Shutdown>,
}

/// Socket double with scripted syscall results.
///
/// Clones share state: keep one clone for the connection and one in the
/// test for scripting and inspection. With no script queued, reads
/// return `-EAGAIN` and writes accept everything.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSock {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedSock {
    /// Creates an empty scripted socket.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes for the next read. A step shorter than the offered
    /// iovec space produces a short read.
    pub fn push_data(&self, data: &[u8]) {
        self.state.lock().incoming.push_back(ReadStep::Data(data.to_vec()));
    }

    /// Queues a read error (positive errno, delivered negated).
    pub fn push_read_err(&self, errno: i32) {
        self.state.lock().incoming.push_back(ReadStep::Err(errno));
    }

    /// Queues end-of-stream for the next read.
    pub fn push_eof(&self) {
        self.state.lock().incoming.push_back(ReadStep::Eof);
    }

    /// Queues a write step accepting at most `n` bytes.
    pub fn push_write_accept(&self, n: usize) {
        self.state.lock().write_steps.push_back(WriteStep::Accept(n));
    }

    /// Queues a write error (positive errno, delivered negated).
    pub fn push_write_err(&self, errno: i32) {
        self.state.lock().write_steps.push_back(WriteStep::Err(errno));
    }

    /// Queues an out-of-band send result.
    pub fn push_oob_result(&self, r: isize) {
        self.state.lock().oob_results.push_back(r);
    }

    /// Everything accepted by writes so far.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Everything accepted by out-of-band sends so far.
    #[must_use]
    pub fn oob_sent(&self) -> Vec<u8> {
        self.state.lock().oob_sent.clone()
    }

    /// Shutdown calls observed, in order.
    #[must_use]
    pub fn shutdown_calls(&self) -> Vec<Shutdown> {
        self.state.lock().shutdowns.clone()
    }
}

fn copy_out(bufs: &[IoSlice<'_>], limit: usize, sink: &mut Vec<u8>) -> usize {
    let mut remaining = limit;
    for buf in bufs {
        if remaining == 0 {
            break;
        }
        let take = buf.len().min(remaining);
        sink.extend_from_slice(&buf[..take]);
        remaining -= take;
    }
    limit - remaining
}

impl SockIo for ScriptedSock {
    fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> isize {
        let mut state = self.state.lock();
        match state.incoming.pop_front() {
            None => -(libc::EAGAIN as isize),
            Some(ReadStep::Err(errno)) => -(errno as isize),
            Some(ReadStep::Eof) => 0,
            Some(ReadStep::Data(mut data)) => {
                let mut copied = 0;
                for buf in bufs.iter_mut() {
                    if data.is_empty() {
                        break;
                    }
                    let take = buf.len().min(data.len());
                    buf[..take].copy_from_slice(&data[..take]);
                    data.drain(..take);
                    copied += take;
                }
                if !data.is_empty() {
                    state.incoming.push_front(ReadStep::Data(data));
                }
                copied as isize
            }
        }
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> isize {
        let mut state = self.state.lock();
        let offered: usize = bufs.iter().map(|b| b.len()).sum();
        match state.write_steps.pop_front() {
            Some(WriteStep::Err(errno)) => -(errno as isize),
            Some(WriteStep::Accept(limit)) => {
                let cap = limit.min(offered);
                let mut sink = std::mem::take(&mut state.written);
                let n = copy_out(bufs, cap, &mut sink);
                state.written = sink;
                n as isize
            }
            None => {
                let mut sink = std::mem::take(&mut state.written);
                let n = copy_out(bufs, offered, &mut sink);
                state.written = sink;
                n as isize
            }
        }
    }

    fn send_oob(&mut self, buf: &[u8]) -> isize {
        let mut state = self.state.lock();
        match state.oob_results.pop_front() {
            Some(r) => {
                if r > 0 {
                    let n = (r as usize).min(buf.len());
                    let taken = buf[..n].to_vec();
                    state.oob_sent.extend_from_slice(&taken);
                    n as isize
                } else {
                    r
                }
            }
            None => {
                state.oob_sent.extend_from_slice(buf);
                buf.len() as isize
            }
        }
    }

    fn shutdown(&mut self, how: Shutdown) -> isize {
        self.state.lock().shutdowns.push(how);
        0
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn borrowed_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}
