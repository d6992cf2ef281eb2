//! End-to-end scenarios for the virtual-connection core, deterministic
//! via the lab poll descriptor and scripted sockets.
//!
//! Scenario Coverage:
//! - VC-001: 100-byte read with monotone progress and a single completion
//! - VC-002: short-write backpressure, EAGAIN clears triggered, resume
//! - VC-003: inactivity timeout delivered exactly once
//! - VC-004: cross-thread re-enable through the enable list and wake
//! - VC-005: close requested during a callback is deferred then final
//! - VC-006: migration between handlers keeps the open-connection gauge

mod common;

use common::*;
use netstrand::{
    chain_buffer, chain_buffer_with_block_size, Connection, Direction, NetEvent, NetHandler,
    NetVcOptions, ScriptedSock,
};
use std::time::{Duration, Instant};

fn accept_scripted(
    handler: &std::sync::Arc<NetHandler>,
    sock: &ScriptedSock,
    cont: netstrand::ContRef,
) -> netstrand::VcId {
    let con = Connection::from_sock(Box::new(sock.clone()));
    handler
        .accept_connection(con, cont, NetVcOptions::default())
        .expect("accept")
}

/// VC-001: 100-byte read.
///
/// One or more `ReadReady` deliveries with `ndone` growing, then exactly
/// one `ReadComplete` at 100. No EOS unless the peer closes.
#[test]
fn vc_001_hundred_byte_read() {
    let (poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    sock.push_data(&[b'a'; 60]);

    let buf = chain_buffer(4096);
    let log = event_log();
    let read_buf = buf.clone();
    let cont = hook_cont(log.clone(), move |event, vc, me| {
        if event == NetEvent::Accept {
            vc.do_io_read(Some(me.clone()), 100, Some(read_buf.clone()));
        }
    });

    let id = accept_scripted(&handler, &sock, cont);
    handler.run_once(Some(Duration::ZERO)).expect("pass 1");
    assert_eq!(count_events(&log, NetEvent::ReadReady), 1);
    let ndone = handler.with_vc(id, |vc| vc.read_vio().ndone()).expect("vc");
    assert_eq!(ndone, 60);

    // Nothing more scripted: the next pass drains to EAGAIN, no event.
    handler.run_once(Some(Duration::ZERO)).expect("pass 2");
    assert_eq!(count_events(&log, NetEvent::ReadReady), 1);

    sock.push_data(&[b'b'; 40]);
    poll.inject_ready(id, Direction::Read);
    handler.run_once(Some(Duration::ZERO)).expect("pass 3");

    let ndone = handler.with_vc(id, |vc| vc.read_vio().ndone()).expect("vc");
    assert_eq!(ndone, 100);
    assert_eq!(count_events(&log, NetEvent::ReadComplete), 1);
    assert_eq!(count_events(&log, NetEvent::Eos), 0);
    assert_eq!(buf.lock().read_avail(), 100);

    // Completion is one-shot: more readiness does not re-emit it.
    poll.inject_ready(id, Direction::Read);
    handler.run_once(Some(Duration::ZERO)).expect("pass 4");
    assert_eq!(count_events(&log, NetEvent::ReadComplete), 1);
}

/// VC-002: short-write backpressure.
///
/// The socket accepts 64 KiB then refuses with EAGAIN: the connection
/// leaves the write-ready list with `triggered` cleared, and resumes when
/// the reactor reports writability again.
#[test]
fn vc_002_short_write_backpressure() {
    let (poll, handler) = lab_handler();
    let sock = ScriptedSock::new();

    let buf = chain_buffer(1 << 20);
    let payload = vec![b'w'; 200_000];
    assert_eq!(buf.lock().append(&payload), 200_000);

    let log = event_log();
    let write_buf = buf.clone();
    let cont = hook_cont(log.clone(), move |event, vc, me| {
        if event == NetEvent::Accept {
            vc.do_io_write(Some(me.clone()), 1 << 20, Some(write_buf.clone()));
        }
    });

    let id = accept_scripted(&handler, &sock, cont);

    sock.push_write_accept(64 * 1024);
    sock.push_write_err(libc::EAGAIN);
    poll.inject_ready(id, Direction::Write);
    handler.run_once(Some(Duration::ZERO)).expect("pass 1");

    let ndone = handler.with_vc(id, |vc| vc.write_vio().ndone()).expect("vc");
    assert_eq!(ndone, 64 * 1024);
    assert!(count_events(&log, NetEvent::WriteReady) >= 1);
    // Rescheduled, not blocked: still write-ready until EAGAIN lands.
    assert!(handler.ready_list_contains(Direction::Write, id));

    sock.push_write_err(libc::EAGAIN);
    handler.run_once(Some(Duration::ZERO)).expect("pass 2");
    let triggered = handler.with_vc(id, |vc| vc.write_triggered()).expect("vc");
    assert!(!triggered, "EAGAIN must clear the write trigger");
    assert!(!handler.ready_list_contains(Direction::Write, id));

    // The peer drains; the reactor reports writability and the pass
    // resumes where it stopped.
    poll.inject_ready(id, Direction::Write);
    handler.run_once(Some(Duration::ZERO)).expect("pass 3");
    let ndone = handler.with_vc(id, |vc| vc.write_vio().ndone()).expect("vc");
    assert_eq!(ndone, 200_000);
    assert_eq!(sock.written(), payload);
}

/// VC-003: inactivity timeout fires exactly once.
#[test]
fn vc_003_inactivity_timeout_once() {
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
    let base = Instant::now();

    // Not yet due.
    handler.sweep_timeouts_at(base + Duration::from_millis(500));
    assert_eq!(count_events(&log, NetEvent::InactivityTimeout), 0);

    handler.sweep_timeouts_at(base + Duration::from_secs(2));
    assert_eq!(count_events(&log, NetEvent::InactivityTimeout), 1);

    // Disarmed after delivery: later ticks do not redeliver.
    handler.sweep_timeouts_at(base + Duration::from_secs(4));
    handler.sweep_timeouts_at(base + Duration::from_secs(8));
    assert_eq!(count_events(&log, NetEvent::InactivityTimeout), 1);
    assert!(handler.vc_exists(id), "timeout alone does not close");
}

/// VC-004: cross-thread re-enable.
///
/// While the owner holds the handler lock, a re-enable from another
/// thread claims the enable-list flag, enqueues, and wakes the owner; the
/// next pass moves the connection to the ready list and clears the claim.
#[test]
fn vc_004_cross_thread_reenable() {
    let (poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    sock.push_data(&[b'x'; 8]);

    // Tiny buffer: the first drain fills it and disables the read side
    // with `triggered` still set.
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
    let (enabled, triggered) = handler
        .with_vc(id, |vc| (vc.read_enabled(), vc.read_triggered()))
        .expect("vc");
    assert!(!enabled, "full buffer disables the read side");
    assert!(triggered, "no EAGAIN was seen, readiness is still pending");

    // Drain the buffer, then re-enable from another thread while this
    // thread holds the handler lock.
    let mut out = Vec::new();
    buf.lock().read_into(&mut out, 8);
    assert_eq!(out, vec![b'x'; 8]);

    handler
        .with_vc(id, |vc| {
            let handle = vc.vio_handle(Direction::Read);
            std::thread::scope(|s| {
                s.spawn(|| handle.reenable());
            });
        })
        .expect("vc");

    assert_eq!(handler.in_enabled_list(Direction::Read, id), Some(true));
    assert!(poll.take_woken(), "the owner must be woken");
    assert!(!handler.ready_list_contains(Direction::Read, id));

    // The owner's next pass flushes the enable list: claim cleared,
    // direction enabled, and (triggered) drained straight through to
    // EAGAIN.
    handler.run_once(Some(Duration::ZERO)).expect("flush pass");
    assert_eq!(handler.in_enabled_list(Direction::Read, id), Some(false));
    let enabled = handler.with_vc(id, |vc| vc.read_enabled()).expect("vc");
    assert!(enabled);
    let triggered = handler.with_vc(id, |vc| vc.read_triggered()).expect("vc");
    assert!(!triggered, "the drain hit EAGAIN and cleared the trigger");
}

/// VC-005: close during recursion.
///
/// A continuation closing from inside `ReadReady` defers the free to the
/// end of the signal frame; afterwards the connection is gone and no
/// further events are delivered.
#[test]
fn vc_005_close_during_recursion() {
    let (poll, handler) = lab_handler();
    let sock = ScriptedSock::new();
    sock.push_data(&[b'z'; 10]);

    let buf = chain_buffer(4096);
    let log = event_log();
    let read_buf = buf.clone();
    let cont = hook_cont(log.clone(), move |event, vc, me| match event {
        NetEvent::Accept => {
            vc.do_io_read(Some(me.clone()), 100, Some(read_buf.clone()));
        }
        NetEvent::ReadReady => vc.do_io_close(None),
        _ => {}
    });

    let id = accept_scripted(&handler, &sock, cont);
    assert_eq!(handler.stats().connections_currently_open.get(), 1);
    handler.run_once(Some(Duration::ZERO)).expect("pass 1");

    assert!(!handler.vc_exists(id), "freed after the outermost frame");
    assert_eq!(handler.open_count(), 0);
    assert_eq!(handler.stats().connections_currently_open.get(), 0);
    assert_eq!(log.lock().as_slice(), &[NetEvent::Accept, NetEvent::ReadReady]);

    // No events after do_io_close.
    sock.push_data(b"more");
    poll.inject_ready(id, Direction::Read);
    handler.run_once(Some(Duration::ZERO)).expect("pass 2");
    assert_eq!(log.lock().len(), 2);
}

/// VC-006: migration between handlers.
///
/// The socket moves wholesale, open-list membership moves with it, and
/// the shared open-connection gauge is unchanged by the close/populate
/// pair.
#[test]
fn vc_006_migration_between_handlers() {
    let (_poll_a, a, poll_b, b) = lab_handler_pair();
    let sock = ScriptedSock::new();
    let log = event_log();

    let id = accept_scripted(&a, &sock, recorder(log.clone()));
    assert!(a.open_list_contains(id));
    assert_eq!(a.stats().connections_currently_open.get(), 1);

    let new_id =
        NetHandler::migrate_to_current_thread(&a, id, &b, recorder(log)).expect("migrate");
    assert!(!a.vc_exists(id), "husk closed on the source handler");
    assert!(!a.open_list_contains(id));
    assert!(b.vc_exists(new_id));
    assert!(b.open_list_contains(new_id));
    assert_eq!(
        a.stats().connections_currently_open.get(),
        1,
        "close and re-populate must cancel out"
    );

    // The moved socket still works on the target handler.
    sock.push_data(b"post-migration");
    let buf = chain_buffer(4096);
    let log2 = event_log();
    let read_buf = buf.clone();
    b.with_vc(new_id, {
        let log2 = log2.clone();
        move |vc| {
            let cont = hook_cont(log2, |_, _, _| {});
            vc.do_io_read(Some(cont), 0, Some(read_buf.clone()));
        }
    })
    .expect("vc");
    // Readiness on the new registration drains through the moved socket.
    poll_b.inject_ready(new_id, Direction::Read);
    b.run_once(Some(Duration::ZERO)).expect("target pass");
    assert_eq!(buf.lock().read_avail(), b"post-migration".len());
    assert_eq!(count_events(&log2, NetEvent::ReadReady), 1);

    // Migrating to the handler that already owns it is the identity.
    let same = NetHandler::migrate_to_current_thread(&b, new_id, &b, recorder(event_log()))
        .expect("identity migrate");
    assert_eq!(same, new_id);
}
