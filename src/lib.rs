//! Netstrand: the virtual-connection I/O core of an event-driven network
//! runtime.
//!
//! # Overview
//!
//! Netstrand bridges non-blocking sockets registered on a readiness
//! poller with continuation-based consumers that read and write through
//! linked-block byte buffers. Each OS thread runs a [`NetHandler`] that
//! exclusively owns its connections; a [`NetVConnection`] moves bytes
//! with bounded scatter/gather syscall loops, delivers events through a
//! strict try-lock discipline, and tears down with a recursion-aware
//! deferred close.
//!
//! # Core Guarantees
//!
//! - **Thread affinity**: a connection is mutated only under its
//!   handler's mutex; the one cross-thread entry is the enable-list push
//!   in [`VioHandle::reenable`], which wakes the owner.
//! - **No blocking in the data path**: every I/O entry try-locks; a miss
//!   reschedules on the ready list instead of waiting.
//! - **Bounded syscalls**: scatter/gather loops repeat only while fully
//!   satisfied, with iovec batches capped at [`NET_MAX_IOV`].
//! - **At-most-once completions**: `ReadComplete`/`WriteComplete` fire
//!   exactly when a VIO's target is reached, never again.
//! - **Deferred teardown**: a close requested inside a callback frees
//!   the connection only after the outermost frame returns.
//!
//! # Module Structure
//!
//! - [`buf`]: linked-block byte buffer with writer/reader capabilities
//! - [`poll`]: interests, the poll-descriptor contract, the per-connection
//!   binding
//! - [`sock`]: socket resource and the negative-errno kernel abstraction
//! - [`cont`]: continuations, events, and the VIO mutex discipline
//! - [`vio`]: the virtual I/O descriptor and its re-enable handle
//! - [`state`]: per-direction enabled/triggered/ready state
//! - [`vconn`]: the virtual connection and its I/O state machine
//! - [`handler`]: the per-thread scheduler and lifecycle entries
//! - [`handshake`]: the transport-handshake hook point
//! - [`lab`]: deterministic poll/socket doubles for testing
//! - [`config`], [`stats`], [`error`], [`slot`]: ambient pieces
//!
//! # Example
//!
//! ```ignore
//! use netstrand::{chain_buffer, cont_ref, LabPoll, NetConfig, NetHandler, NetStats};
//! use std::sync::Arc;
//!
//! let poll = LabPoll::new();
//! let handler = NetHandler::new(poll.clone(), NetConfig::default(), Arc::new(NetStats::new()));
//!
//! // An acceptor wires a connection up with a continuation that issues
//! // do_io_read from its Accept callback:
//! let id = handler.accept_connection(con, cont_ref(my_session), Default::default())?;
//!
//! // The owning thread drives everything:
//! loop { handler.run_once(None)?; }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]

pub mod buf;
pub mod config;
pub mod cont;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod lab;
pub mod poll;
pub mod slot;
pub mod sock;
pub mod state;
pub mod stats;
pub mod vconn;
pub mod vio;

pub use buf::{chain_buffer, chain_buffer_with_block_size, BufHandle, ChainBuffer, NET_MAX_IOV};
pub use config::{NetConfig, DEFAULT_BLOCK_SIZE};
pub use cont::{cont_ref, ContRef, Continuation, NetEvent};
pub use error::{NetError, ENET_THROTTLING, NET_ERRNO_BASE};
pub use handler::NetHandler;
pub use handshake::{HandshakeMode, HandshakeResult, Handshaker};
pub use lab::{LabPoll, ScriptedSock};
pub use poll::{Interest, PollDescriptor, ReadyEvent, SysPoll};
pub use slot::VcId;
pub use sock::{Connection, NetVcOptions, SockIo, SysSock};
pub use state::Direction;
pub use stats::{Counter, Gauge, NetStats};
pub use vconn::{NetVConnection, ShutdownHow, ShutdownState, VcData, VcDataKind};
pub use vio::{Vio, VioHandle, VioOp};
