//! Socket resource owned by a virtual connection.
//!
//! [`SockIo`] is the kernel abstraction the I/O paths drive: vectored
//! read/write, out-of-band send, and shutdown, all returning a signed
//! result where negative values carry the errno (`-EAGAIN`,
//! `-ECONNRESET`, …). [`SysSock`] is the production implementation over a
//! non-blocking [`TcpStream`]; the scripted test implementation lives in
//! [`crate::lab::ScriptedSock`].
//!
//! [`Connection`] bundles the socket with its addresses, bound/connected
//! flags and options. It is exclusively owned by one virtual connection
//! and transferable wholesale via [`Connection::move_from`] during
//! migration — the moved-out side keeps no claim on the descriptor.

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, TcpKeepalive, Type};
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

/// Extracts the OS error number, defaulting to `EIO` for synthetic errors.
pub(crate) fn errno_from(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// Folds an `io::Result` into the signed negative-errno convention.
pub(crate) fn fold_result(res: io::Result<usize>) -> isize {
    match res {
        Ok(n) => n as isize,
        Err(e) => -(errno_from(&e) as isize),
    }
}

/// Kernel socket operations in the signed negative-errno convention.
pub trait SockIo: Send {
    /// Scatter read into `bufs`. Returns bytes read, `0` at end-of-stream,
    /// or a negative errno.
    fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> isize;

    /// Gather write from `bufs`. Returns bytes written or a negative errno.
    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> isize;

    /// Sends out-of-band data. Returns bytes sent or a negative errno.
    fn send_oob(&mut self, buf: &[u8]) -> isize;

    /// Shuts down one or both halves. Returns `0` or a negative errno.
    fn shutdown(&mut self, how: Shutdown) -> isize;

    /// Local address, when known.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Peer address, when known.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Borrowed descriptor for poller registration. `None` for sockets
    /// with no kernel object behind them.
    fn borrowed_fd(&self) -> Option<BorrowedFd<'_>>;
}

/// Production socket over a non-blocking [`TcpStream`].
#[derive(Debug)]
pub struct SysSock {
    stream: TcpStream,
}

impl SysSock {
    /// Wraps a stream, forcing it non-blocking.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }
}

impl SockIo for SysSock {
    fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> isize {
        if bufs.len() == 1 {
            fold_result((&self.stream).read(&mut bufs[0]))
        } else {
            fold_result((&self.stream).read_vectored(bufs))
        }
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> isize {
        if bufs.len() == 1 {
            fold_result((&self.stream).write(&bufs[0]))
        } else {
            fold_result((&self.stream).write_vectored(bufs))
        }
    }

    fn send_oob(&mut self, buf: &[u8]) -> isize {
        fold_result(SockRef::from(&self.stream).send_out_of_band(buf))
    }

    fn shutdown(&mut self, how: Shutdown) -> isize {
        match self.stream.shutdown(how) {
            Ok(()) => 0,
            Err(e) => -(errno_from(&e) as isize),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    fn borrowed_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.stream.as_fd())
    }
}

/// Socket options applied at connect or accept time.
#[derive(Debug, Clone, Default)]
pub struct NetVcOptions {
    /// Local address to bind an outbound socket to.
    pub local_addr: Option<SocketAddr>,
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
    /// Enable TCP keepalive with the given idle interval.
    pub keepalive: Option<Duration>,
    /// SO_LINGER duration.
    pub linger: Option<Duration>,
    /// SO_RCVBUF size.
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF size.
    pub send_buffer_size: Option<usize>,
}

/// The socket resource of a virtual connection.
pub struct Connection {
    sock: Option<Box<dyn SockIo>>,
    /// Socket created by `open` but not yet through `connect`.
    pending: Option<Socket>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    pub(crate) is_bound: bool,
    pub(crate) is_connected: bool,
    pub(crate) options: NetVcOptions,
}

impl Connection {
    /// A connection with no socket behind it.
    #[must_use]
    pub(crate) fn empty() -> Self {
        Self {
            sock: None,
            pending: None,
            local: None,
            remote: None,
            is_bound: false,
            is_connected: false,
            options: NetVcOptions::default(),
        }
    }

    /// Wraps an accepted stream.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let sock = SysSock::new(stream)?;
        let local = sock.local_addr();
        let remote = sock.peer_addr();
        Ok(Self {
            sock: Some(Box::new(sock)),
            pending: None,
            local,
            remote,
            is_bound: true,
            is_connected: true,
            options: NetVcOptions::default(),
        })
    }

    /// Wraps an arbitrary socket implementation (lab doubles).
    #[must_use]
    pub fn from_sock(sock: Box<dyn SockIo>) -> Self {
        let local = sock.local_addr();
        let remote = sock.peer_addr();
        Self {
            sock: Some(sock),
            pending: None,
            local,
            remote,
            is_bound: true,
            is_connected: true,
            options: NetVcOptions::default(),
        }
    }

    /// Creates the outbound socket and binds it per `options`.
    pub(crate) fn open(&mut self, remote: SocketAddr, options: &NetVcOptions) -> io::Result<()> {
        let domain = Domain::for_address(remote);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        if let Some(local) = options.local_addr {
            socket.set_reuse_address(true)?;
            socket.bind(&SockAddr::from(local))?;
            self.is_bound = true;
        }
        self.options = options.clone();
        self.pending = Some(socket);
        Ok(())
    }

    /// Issues the non-blocking connect. In-progress is success; the
    /// poller reports completion as writability.
    pub(crate) fn connect(&mut self, remote: SocketAddr) -> io::Result<()> {
        let socket = self
            .pending
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "open() not called"))?;
        match socket.connect(&SockAddr::from(remote)) {
            Ok(()) => {}
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        let stream: TcpStream = socket.into();
        let sock = SysSock::new(stream)?;
        self.local = sock.local_addr();
        self.remote = Some(remote);
        self.is_connected = true;
        self.sock = Some(Box::new(sock));
        self.apply_options();
        Ok(())
    }

    /// Applies the stored options to the live socket. Failures are logged
    /// and ignored; option application is best-effort.
    pub(crate) fn apply_options(&mut self) {
        let Some(fd) = self.borrowed_fd() else { return };
        let sock = SockRef::from(&fd);
        let opts = &self.options;
        if opts.nodelay {
            if let Err(e) = sock.set_nodelay(true) {
                tracing::debug!(error = %e, "set_nodelay failed");
            }
        }
        if let Some(interval) = opts.keepalive {
            let params = TcpKeepalive::new().with_time(interval);
            if let Err(e) = sock.set_tcp_keepalive(&params) {
                tracing::debug!(error = %e, "set_tcp_keepalive failed");
            }
        }
        if let Some(linger) = opts.linger {
            if let Err(e) = sock.set_linger(Some(linger)) {
                tracing::debug!(error = %e, "set_linger failed");
            }
        }
        if let Some(size) = opts.recv_buffer_size {
            if let Err(e) = sock.set_recv_buffer_size(size) {
                tracing::debug!(error = %e, "set_recv_buffer_size failed");
            }
        }
        if let Some(size) = opts.send_buffer_size {
            if let Err(e) = sock.set_send_buffer_size(size) {
                tracing::debug!(error = %e, "set_send_buffer_size failed");
            }
        }
    }

    /// Takes the entire socket resource out of `other`, leaving it empty.
    #[must_use]
    pub(crate) fn move_from(other: &mut Connection) -> Connection {
        std::mem::replace(other, Connection::empty())
    }

    /// Drops the socket. After this the connection holds no descriptor.
    pub(crate) fn close(&mut self) {
        self.sock = None;
        self.pending = None;
        self.is_connected = false;
        self.is_bound = false;
    }

    /// Whether a socket is present.
    #[must_use]
    pub(crate) fn is_open(&self) -> bool {
        self.sock.is_some() || self.pending.is_some()
    }

    /// Local address, when known.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Peer address, when known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub(crate) fn borrowed_fd(&self) -> Option<BorrowedFd<'_>> {
        if let Some(sock) = &self.sock {
            sock.borrowed_fd()
        } else {
            self.pending.as_ref().map(|s| s.as_fd())
        }
    }

    pub(crate) fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> isize {
        match &mut self.sock {
            Some(sock) => sock.readv(bufs),
            None => -(libc::ENOTCONN as isize),
        }
    }

    pub(crate) fn writev(&mut self, bufs: &[IoSlice<'_>]) -> isize {
        match &mut self.sock {
            Some(sock) => sock.writev(bufs),
            None => -(libc::ENOTCONN as isize),
        }
    }

    pub(crate) fn send_oob(&mut self, buf: &[u8]) -> isize {
        match &mut self.sock {
            Some(sock) => sock.send_oob(buf),
            None => -(libc::ENOTCONN as isize),
        }
    }

    pub(crate) fn shutdown(&mut self, how: Shutdown) -> isize {
        match &mut self.sock {
            Some(sock) => sock.shutdown(how),
            None => -(libc::ENOTCONN as isize),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.is_open())
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("is_bound", &self.is_bound)
            .field("is_connected", &self.is_connected)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn empty_connection_reports_notconn() {
        let mut con = Connection::empty();
        assert!(!con.is_open());
        assert_eq!(con.send_oob(b"x"), -(libc::ENOTCONN as isize));
        let mut bufs: [IoSliceMut<'_>; 0] = [];
        assert_eq!(con.readv(&mut bufs), -(libc::ENOTCONN as isize));
    }

    #[test]
    fn move_from_transfers_descriptor() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        drop(client);

        let mut original = Connection::from_stream(server).expect("wrap");
        let local = original.local_addr();
        let held = Connection::move_from(&mut original);
        assert!(!original.is_open());
        assert!(held.is_open());
        assert_eq!(held.local_addr(), local);
    }

    #[test]
    fn nonblocking_connect_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");

        let mut con = Connection::empty();
        con.open(addr, &NetVcOptions::default()).expect("open");
        con.connect(addr).expect("connect");
        assert!(con.is_connected);
        assert!(con.borrowed_fd().is_some());

        let (mut peer, _) = listener.accept().expect("accept");
        // Wait for the handshake so the write below cannot race it.
        peer.set_nonblocking(false).expect("blocking peer");
        use std::io::Write as _;
        peer.write_all(b"ping").expect("peer write");

        // Drain with a scatter read once data lands.
        let mut storage = [0u8; 8];
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let mut bufs = [IoSliceMut::new(&mut storage)];
            let r = con.readv(&mut bufs);
            if r == 4 {
                break;
            }
            assert!(
                r == -(libc::EAGAIN as isize) || r == -(libc::ENOTCONN as isize),
                "unexpected read result {r}"
            );
            assert!(std::time::Instant::now() < deadline, "timed out waiting for data");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(&storage[..4], b"ping");
    }
}
