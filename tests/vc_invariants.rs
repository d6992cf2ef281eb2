//! Boundary behavior and invariant checks for the connection core.
//!
//! Coverage:
//! - INV-001: a full read buffer never reaches the kernel, it disables
//! - INV-002: `nbytes = 0` reads until EOS and never completes
//! - INV-003: partial final syscall folds into the correct total
//! - INV-004: write-side byte conservation and a single completion
//! - INV-005: a mid-callback VIO mutex swap reschedules instead of
//!   touching shared state
//! - INV-006: out-of-band send (synchronous, retried, cancelled)
//! - INV-007: connect throttle synthesizes `OpenFailed(-ENET_THROTTLING)`
//! - INV-008: close detaches keep-alive/active queue membership
//! - INV-009: a shut-down read half suppresses timeout delivery
//! - INV-010: the write-buffer-empty trap delivers the saved code
//! - INV-011: stale re-enable handles are inert
//! - INV-012: hard read errors surface `Error` with `lerrno` set
//! - INV-013: terminal events with no continuation convert to a close
//! - INV-014: handshake want/done directives steer scheduling
//! - INV-015: `reenable_re` runs the I/O path immediately

mod common;

use common::*;
use netstrand::{
    chain_buffer, chain_buffer_with_block_size, Connection, Direction, HandshakeMode,
    HandshakeResult, Handshaker, LabPoll, NetConfig, NetEvent, NetHandler, NetStats, NetVcOptions,
    ScriptedSock, ENET_THROTTLING,
};
use std::net::Shutdown;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn accept_scripted(
    handler: &Arc<NetHandler>,
    sock: &ScriptedSock,
    cont: netstrand::ContRef,
) -> netstrand::VcId {
    let con = Connection::from_sock(Box::new(sock.clone()));
    handler
        .accept_connection(con, cont, NetVcOptions::default())
        .expect("accept")
}

/// INV-001: an empty writable region must not syscall; it disables.
#[test]
fn inv_001_full_buffer_read_disables_without_syscall() {
    let (_poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    sock.push_data(b"should never be read");

    let buf = chain_buffer_with_block_size(8, 8);
    assert_eq!(buf.lock().append(&[0u8; 8]), 8, "pre-fill to capacity");

    let log = event_log();
    let read_buf = buf.clone();
    let cont = hook_cont(log.clone(), move |event, vc, me| {
        if event == NetEvent::Accept {
            vc.do_io_read(Some(me.clone()), 100, Some(read_buf.clone()));
        }
    });

    let id = accept_scripted(&handler, &sock, cont);
    handler.run_once(Some(Duration::ZERO)).expect("pass");

    assert_eq!(handler.stats().calls_to_read.get(), 0, "no syscall issued");
    let enabled = handler.with_vc(id, |vc| vc.read_enabled()).expect("vc");
    assert!(!enabled, "no room means disable, not spin");
    assert_eq!(count_events(&log, NetEvent::ReadReady), 0);
}

/// INV-002: `nbytes = 0` means read until end-of-stream.
#[test]
fn inv_002_nbytes_zero_reads_until_eos() {
    let (poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    sock.push_data(b"hello");

    let buf = chain_buffer(4096);
    let log = event_log();
    let read_buf = buf.clone();
    let cont = hook_cont(log.clone(), move |event, vc, me| {
        if event == NetEvent::Accept {
            vc.do_io_read(Some(me.clone()), 0, Some(read_buf.clone()));
        }
    });

    let id = accept_scripted(&handler, &sock, cont);
    handler.run_once(Some(Duration::ZERO)).expect("pass 1");
    assert_eq!(count_events(&log, NetEvent::ReadReady), 1);

    sock.push_eof();
    poll.inject_ready(id, Direction::Read);
    handler.run_once(Some(Duration::ZERO)).expect("pass 2");

    assert_eq!(count_events(&log, NetEvent::Eos), 1);
    assert_eq!(
        count_events(&log, NetEvent::ReadComplete),
        0,
        "an unbounded read never completes"
    );
}

/// INV-003: a partial final syscall in the vectored loop folds into
/// `total_attempted_before + final_short_return`.
#[test]
fn inv_003_partial_final_syscall_folds_correctly() {
    let (_poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    // First batch is a full 16-iovec round (65536 with 4 KiB blocks), so
    // the loop continues; the second comes back 100 of 4464.
    sock.push_data(&vec![b'a'; 65536]);
    sock.push_data(&[b'b'; 100]);

    let buf = chain_buffer(1 << 20);
    let log = event_log();
    let read_buf = buf.clone();
    let cont = hook_cont(log.clone(), move |event, vc, me| {
        if event == NetEvent::Accept {
            vc.do_io_read(Some(me.clone()), 70_000, Some(read_buf.clone()));
        }
    });

    let id = accept_scripted(&handler, &sock, cont);
    handler.run_once(Some(Duration::ZERO)).expect("pass");

    let ndone = handler.with_vc(id, |vc| vc.read_vio().ndone()).expect("vc");
    assert_eq!(ndone, 65_636);
    assert_eq!(buf.lock().read_avail(), 65_636);
    assert_eq!(handler.stats().read_bytes.get(), 65_636);
    assert_eq!(count_events(&log, NetEvent::ReadReady), 1);
}

/// INV-004: the sum of accepted write returns equals `ndone` equals
/// reader consumption, and the completion fires once.
#[test]
fn inv_004_write_byte_conservation() {
    let (poll, handler) = lab_handler();
    let sock = ScriptedSock::new();

    let payload = vec![b'p'; 100];
    let buf = chain_buffer(4096);
    assert_eq!(buf.lock().append(&payload), 100);

    let log = event_log();
    let write_buf = buf.clone();
    let cont = hook_cont(log.clone(), move |event, vc, me| {
        if event == NetEvent::Accept {
            vc.do_io_write(Some(me.clone()), 100, Some(write_buf.clone()));
        }
    });

    let id = accept_scripted(&handler, &sock, cont);

    sock.push_write_accept(10);
    poll.inject_ready(id, Direction::Write);
    handler.run_once(Some(Duration::ZERO)).expect("pass 1");
    let ndone = handler.with_vc(id, |vc| vc.write_vio().ndone()).expect("vc");
    assert_eq!(ndone, 10);
    assert_eq!(buf.lock().read_avail(), 90);

    handler.run_once(Some(Duration::ZERO)).expect("pass 2");
    let ndone = handler.with_vc(id, |vc| vc.write_vio().ndone()).expect("vc");
    assert_eq!(ndone, 100);
    assert_eq!(sock.written(), payload);
    assert_eq!(buf.lock().read_avail(), 0);
    assert_eq!(count_events(&log, NetEvent::WriteComplete), 1);
    assert_eq!(handler.stats().write_bytes.get(), 100);
}

/// INV-005: a continuation replacing the VIO mutex mid-callback causes a
/// reschedule; the next pass signals the new continuation.
#[test]
fn inv_005_lock_swap_reschedules() {
    let (poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    sock.push_data(&[b'1'; 10]);

    let buf = chain_buffer(4096);
    let first_log = event_log();
    let second_log = event_log();

    let second = recorder(second_log.clone());
    let read_buf = buf.clone();
    let swap_buf = buf.clone();
    let cont = hook_cont(first_log.clone(), move |event, vc, me| match event {
        NetEvent::Accept => {
            vc.do_io_read(Some(me.clone()), 100, Some(read_buf.clone()));
        }
        NetEvent::ReadReady => {
            // Hand the stream to a different continuation: new mutex.
            vc.do_io_read(Some(second.clone()), 100, Some(swap_buf.clone()));
        }
        _ => {}
    });

    let id = accept_scripted(&handler, &sock, cont);
    handler.run_once(Some(Duration::ZERO)).expect("pass 1");
    assert_eq!(count_events(&first_log, NetEvent::ReadReady), 1);
    assert!(second_log.lock().is_empty());

    sock.push_data(&[b'2'; 20]);
    poll.inject_ready(id, Direction::Read);
    handler.run_once(Some(Duration::ZERO)).expect("pass 2");

    assert_eq!(
        count_events(&first_log, NetEvent::ReadReady),
        1,
        "the old continuation is out of the loop"
    );
    assert_eq!(count_events(&second_log, NetEvent::ReadReady), 1);
}

/// INV-006a: a fully accepted OOB send completes synchronously.
#[test]
fn inv_006a_oob_complete_synchronous() {
    let (_poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    let log = event_log();
    let id = accept_scripted(&handler, &sock, recorder(log.clone()));

    let oob_log = event_log();
    let oob_cont = recorder(oob_log.clone());
    handler
        .with_vc(id, |vc| vc.send_oob(oob_cont, b"abc"))
        .expect("vc");

    assert_eq!(count_events(&oob_log, NetEvent::OobComplete), 1);
    assert_eq!(sock.oob_sent(), b"abc");
}

/// INV-006b: a partial OOB send retries from the sweep and completes.
#[test]
fn inv_006b_oob_partial_retries() {
    let (_poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    sock.push_oob_result(1);
    let id = accept_scripted(&handler, &sock, recorder(event_log()));

    let oob_log = event_log();
    let oob_cont = recorder(oob_log.clone());
    handler
        .with_vc(id, |vc| vc.send_oob(oob_cont, b"abc"))
        .expect("vc");
    assert!(oob_log.lock().is_empty(), "partial send completes later");

    handler.sweep_timeouts_at(Instant::now() + Duration::from_millis(50));
    assert_eq!(count_events(&oob_log, NetEvent::OobComplete), 1);
    assert_eq!(sock.oob_sent(), b"abc");
}

/// INV-006c: cancel_oob drops the pending retry; nothing fires.
#[test]
fn inv_006c_oob_cancel() {
    let (_poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    sock.push_oob_result(-(libc::EAGAIN as isize));
    let id = accept_scripted(&handler, &sock, recorder(event_log()));

    let oob_log = event_log();
    let oob_cont = recorder(oob_log.clone());
    handler
        .with_vc(id, |vc| {
            vc.send_oob(oob_cont, b"abc");
            vc.cancel_oob();
        })
        .expect("vc");

    handler.sweep_timeouts_at(Instant::now() + Duration::from_secs(1));
    assert!(oob_log.lock().is_empty());
    assert!(sock.oob_sent().is_empty());
}

/// INV-007: the connect throttle synthesizes
/// `OpenFailed(-ENET_THROTTLING)` and frees the connection.
#[test]
fn inv_007_connect_throttle() {
    init_test_logging();
    let poll = LabPoll::new();
    let config = NetConfig::new().with_max_open_connections(0);
    let handler = NetHandler::new(poll, config, Arc::new(NetStats::new()));

    let log = event_log();
    let result = handler.connect_up(
        "127.0.0.1:9".parse().expect("addr"),
        recorder(log.clone()),
        NetVcOptions::default(),
    );
    assert!(result.is_err());
    assert_eq!(
        log.lock().as_slice(),
        &[NetEvent::OpenFailed(-ENET_THROTTLING)]
    );
    assert_eq!(handler.stats().connections_currently_open.get(), 0);
    assert_eq!(handler.stats().connections_throttled_out.get(), 1);
}

/// INV-008: close detaches keep-alive and active queue membership.
#[test]
fn inv_008_close_detaches_queues() {
    let (_poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    let id = accept_scripted(&handler, &sock, recorder(event_log()));

    handler.add_to_keep_alive_queue(id);
    handler.add_to_active_queue(id);
    handler.with_vc(id, |vc| vc.do_io_close(None)).expect("vc");

    assert!(!handler.vc_exists(id));
    assert_eq!(handler.open_count(), 0);
    // Re-parking a stale id is a no-op.
    handler.add_to_keep_alive_queue(id);
    handler.remove_from_keep_alive_queue(id);
}

/// INV-009: once the read half is shut down, its timeout is suppressed.
#[test]
fn inv_009_shutdown_read_suppresses_timeout() {
    let (_poll, handler) = lab_handler();
    let sock = ScriptedSock::new();

    let buf = chain_buffer(4096);
    let log = event_log();
    let read_buf = buf.clone();
    let cont = hook_cont(log.clone(), move |event, vc, me| {
        if event == NetEvent::Accept {
            vc.set_inactivity_timeout(Duration::from_secs(1));
            vc.do_io_read(Some(me.clone()), 100, Some(read_buf.clone()));
        }
    });

    let id = accept_scripted(&handler, &sock, cont);
    handler
        .with_vc(id, |vc| vc.do_io_shutdown(netstrand::ShutdownHow::Read))
        .expect("vc");
    assert_eq!(sock.shutdown_calls(), vec![Shutdown::Read]);

    handler.sweep_timeouts_at(Instant::now() + Duration::from_secs(2));
    assert_eq!(count_events(&log, NetEvent::InactivityTimeout), 0);
    assert!(handler.vc_exists(id));
}

/// INV-010: the write-buffer-empty trap emits the saved code when the
/// buffer drains during a pass that already signalled.
#[test]
fn inv_010_write_buffer_empty_trap() {
    let (poll, handler) = lab_handler();
    let sock = ScriptedSock::new();

    let buf = chain_buffer(4096);
    assert_eq!(buf.lock().append(&[b'q'; 100]), 100);

    let log = event_log();
    let write_buf = buf.clone();
    let cont = hook_cont(log.clone(), move |event, vc, me| {
        if event == NetEvent::Accept {
            vc.do_io_write(Some(me.clone()), 1000, Some(write_buf.clone()));
            vc.set_write_buffer_empty_event(NetEvent::WriteReady);
        }
    });

    let id = accept_scripted(&handler, &sock, cont);
    poll.inject_ready(id, Direction::Write);
    handler.run_once(Some(Duration::ZERO)).expect("pass");

    // One refill invitation plus the trap delivery.
    assert_eq!(count_events(&log, NetEvent::WriteReady), 2);
    let enabled = handler.with_vc(id, |vc| vc.write_enabled()).expect("vc");
    assert!(!enabled, "empty reader disables the write side");
}

/// INV-011: a re-enable handle that outlives its connection is inert.
#[test]
fn inv_011_stale_handle_is_inert() {
    let (_poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    let id = accept_scripted(&handler, &sock, recorder(event_log()));

    let handle = handler
        .with_vc(id, |vc| vc.vio_handle(Direction::Read))
        .expect("vc");
    handler.with_vc(id, |vc| vc.do_io_close(None)).expect("vc");
    assert!(!handler.vc_exists(id));

    handle.reenable();
    handle.reenable_re();
    handler.run_once(Some(Duration::ZERO)).expect("pass");
    assert!(!handler.vc_exists(id), "no resurrection");
}

/// INV-012: a hard read error emits `Error` and records the errno.
#[test]
fn inv_012_read_error_sets_lerrno() {
    let (_poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    sock.push_read_err(libc::EIO);

    let buf = chain_buffer(4096);
    let log = event_log();
    let read_buf = buf.clone();
    let cont = hook_cont(log.clone(), move |event, vc, me| {
        if event == NetEvent::Accept {
            vc.do_io_read(Some(me.clone()), 100, Some(read_buf.clone()));
        }
    });

    let id = accept_scripted(&handler, &sock, cont);
    handler.run_once(Some(Duration::ZERO)).expect("pass");

    assert_eq!(count_events(&log, NetEvent::Error), 1);
    let lerrno = handler.with_vc(id, |vc| vc.lerrno()).expect("vc");
    assert_eq!(lerrno, libc::EIO);
}

/// Handshake double that walks a scripted directive sequence; a `Done`
/// step marks completion.
struct StagedHandshake {
    steps: std::collections::VecDeque<HandshakeResult>,
    done: bool,
}

impl Handshaker for StagedHandshake {
    fn handshake_complete(&self) -> bool {
        self.done
    }

    fn start_handshake(&mut self, _mode: HandshakeMode, _con: &mut Connection) -> HandshakeResult {
        match self.steps.pop_front() {
            Some(HandshakeResult::Done) | None => {
                self.done = true;
                HandshakeResult::Done
            }
            Some(step) => step,
        }
    }
}

/// INV-014: an incomplete handshake owns the write path; want-read parks
/// the write side, `Done` re-queues it, and normal writes follow.
#[test]
fn inv_014_handshake_directives_steer_scheduling() {
    let (poll, handler) = lab_handler();
    let sock = ScriptedSock::new();

    let buf = chain_buffer(4096);
    assert_eq!(buf.lock().append(b"ciphertext"), 10);

    let log = event_log();
    let write_buf = buf.clone();
    let cont = hook_cont(log.clone(), move |event, vc, me| {
        if event == NetEvent::Accept {
            vc.set_handshaker(
                Box::new(StagedHandshake {
                    steps: [HandshakeResult::WantRead, HandshakeResult::Done].into(),
                    done: false,
                }),
                HandshakeMode::Server,
            );
            vc.do_io_write(Some(me.clone()), 10, Some(write_buf.clone()));
        }
    });

    let id = accept_scripted(&handler, &sock, cont);

    // First write drain: the handshake wants readability; no bytes move.
    poll.inject_ready(id, Direction::Write);
    handler.run_once(Some(Duration::ZERO)).expect("pass 1");
    assert!(sock.written().is_empty());
    let read_triggered = handler.with_vc(id, |vc| vc.read_triggered()).expect("vc");
    assert!(!read_triggered, "want-read clears the read trigger");

    // Second drain: the handshake finishes and re-queues the write side;
    // the third drain moves the payload.
    poll.inject_ready(id, Direction::Write);
    handler.run_once(Some(Duration::ZERO)).expect("pass 2");
    handler.run_once(Some(Duration::ZERO)).expect("pass 3");
    assert_eq!(sock.written(), b"ciphertext");
    assert_eq!(count_events(&log, NetEvent::WriteComplete), 1);
}

/// INV-015: `reenable_re` on an idle owner runs the drain inline instead
/// of waiting for the next handler pass.
#[test]
fn inv_015_reenable_re_runs_inline() {
    let (_poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    sock.push_data(&[b'r'; 8]);

    let buf = chain_buffer_with_block_size(8, 8);
    let log = event_log();
    let read_buf = buf.clone();
    let cont = hook_cont(log.clone(), move |event, vc, me| {
        if event == NetEvent::Accept {
            vc.do_io_read(Some(me.clone()), 100, Some(read_buf.clone()));
        }
    });

    let id = accept_scripted(&handler, &sock, cont);
    handler.run_once(Some(Duration::ZERO)).expect("fill pass");
    let enabled = handler.with_vc(id, |vc| vc.read_enabled()).expect("vc");
    assert!(!enabled, "full buffer disabled the read side");

    let mut drained = Vec::new();
    buf.lock().read_into(&mut drained, 8);
    let handle = handler
        .with_vc(id, |vc| vc.vio_handle(Direction::Read))
        .expect("vc");
    let calls_before = handler.stats().calls_to_read.get();

    // No run_once in between: the drain happens inside reenable_re.
    handle.reenable_re();
    assert!(handler.stats().calls_to_read.get() > calls_before);
    let (enabled, triggered) = handler
        .with_vc(id, |vc| (vc.read_enabled(), vc.read_triggered()))
        .expect("vc");
    assert!(enabled);
    assert!(!triggered, "the inline drain ran to EAGAIN");
}

/// INV-013: a terminal event with no continuation closes the connection.
#[test]
fn inv_013_null_continuation_eos_closes() {
    let (_poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    sock.push_eof();

    let buf = chain_buffer(4096);
    let read_buf = buf.clone();
    let cont = hook_cont(event_log(), move |event, vc, _me| {
        if event == NetEvent::Accept {
            // Unbounded read with no continuation: EOS self-closes.
            vc.do_io_read(None, 0, Some(read_buf.clone()));
        }
    });

    let id = accept_scripted(&handler, &sock, cont);
    handler.run_once(Some(Duration::ZERO)).expect("pass");
    assert!(!handler.vc_exists(id));
    assert_eq!(handler.stats().connections_currently_open.get(), 0);
}
