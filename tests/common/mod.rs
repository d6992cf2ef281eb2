//! Shared helpers for the connection-core integration tests.
#![allow(dead_code)]

use netstrand::{
    ContRef, Continuation, LabPoll, NetConfig, NetEvent, NetHandler, NetStats, NetVConnection,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared, inspectable event log.
pub type EventLog = Arc<Mutex<Vec<NetEvent>>>;

/// Creates an empty event log.
pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Initializes tracing output for a test run (idempotent).
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A lab handler over an injectable poll descriptor.
pub fn lab_handler() -> (Arc<LabPoll>, Arc<NetHandler>) {
    init_test_logging();
    let poll = LabPoll::new();
    let stats = Arc::new(NetStats::new());
    let handler = NetHandler::new(poll.clone(), NetConfig::default(), stats);
    (poll, handler)
}

/// Two lab handlers sharing one stats block, for migration tests.
pub fn lab_handler_pair() -> (Arc<LabPoll>, Arc<NetHandler>, Arc<LabPoll>, Arc<NetHandler>) {
    init_test_logging();
    let stats = Arc::new(NetStats::new());
    let poll_a = LabPoll::new();
    let poll_b = LabPoll::new();
    let a = NetHandler::new(poll_a.clone(), NetConfig::default(), Arc::clone(&stats));
    let b = NetHandler::new(poll_b.clone(), NetConfig::default(), stats);
    (poll_a, a, poll_b, b)
}

/// Continuation that logs every event and runs a hook that can see its
/// own [`ContRef`] (so callbacks can wire up further `do_io_*` calls).
pub struct HookCont {
    log: EventLog,
    hook: Box<dyn FnMut(NetEvent, &mut NetVConnection, &ContRef) + Send>,
    self_ref: Option<ContRef>,
}

impl Continuation for HookCont {
    fn handle_event(&mut self, event: NetEvent, vc: &mut NetVConnection) {
        self.log.lock().push(event);
        let me = self.self_ref.clone().expect("self_ref wired by hook_cont()");
        (self.hook)(event, vc, &me);
    }
}

/// Builds a [`HookCont`] and closes the self-reference cycle.
pub fn hook_cont(
    log: EventLog,
    hook: impl FnMut(NetEvent, &mut NetVConnection, &ContRef) + Send + 'static,
) -> ContRef {
    let cell = Arc::new(Mutex::new(HookCont {
        log,
        hook: Box::new(hook),
        self_ref: None,
    }));
    let as_dyn: ContRef = cell.clone();
    cell.lock().self_ref = Some(as_dyn.clone());
    as_dyn
}

/// Continuation that only records events.
pub fn recorder(log: EventLog) -> ContRef {
    hook_cont(log, |_, _, _| {})
}

/// Counts occurrences of an event in the log.
pub fn count_events(log: &EventLog, event: NetEvent) -> usize {
    log.lock().iter().filter(|e| **e == event).count()
}
