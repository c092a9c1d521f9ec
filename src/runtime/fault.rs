//! Exit-signal fan-out, DOWN delivery and crash dumps
//!
//! The fault handler is the only truly concurrent part of the core: a
//! worker thread draining a bounded queue of exit events, so that a dying
//! process's signals are delivered after it is marked dead without the
//! dispatch loop waiting on the fan-out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::bytecode::Value;
use crate::runtime::links::LinkRegistry;
use crate::runtime::mailbox::Message;
use crate::runtime::process::ProcessTable;
use crate::runtime::registry::ProcessRegistry;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::supervisor::SupervisorRegistry;
use crate::types::{now_millis, EngineStats, ExitReason, Pid};

const SIGNAL_QUEUE_DEPTH: usize = 1024;

/// How an exit signal reached its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Through a symmetric link
    Link,
    /// Through a monitor
    Monitor,
}

impl LinkKind {
    fn name(&self) -> &'static str {
        match self {
            LinkKind::Link => "Link",
            LinkKind::Monitor => "Monitor",
        }
    }
}

/// Events processed by the fault worker.
#[derive(Debug, Clone)]
pub enum FaultEvent {
    /// A process died; fan out its exit.
    Exit {
        /// The dead process
        target: Pid,
        /// Why it died
        reason: ExitReason,
    },
    /// An exit signal traveling to a target, convertible to a message if
    /// the target traps exits.
    Signal {
        /// Originating process
        from: Pid,
        /// Receiving process
        target: Pid,
        /// Signal reason
        reason: ExitReason,
        /// How the signal is connected
        link_kind: LinkKind,
    },
    /// Stop the worker loop.
    Shutdown,
}

/// Snapshot taken when a process dies from an unhandled exception.
#[derive(Debug, Clone, Serialize)]
pub struct CrashDump {
    /// The dead process
    pub pid: u64,
    /// Exit reason rendered as a value
    pub reason: Value,
    /// Instruction pointer at death
    pub counter: usize,
    /// Top of the data stack, innermost first
    pub stack_slice: Vec<Value>,
    /// Registered name at death, if any
    pub registered_name: Option<String>,
    /// Dump timestamp, milliseconds since the epoch
    pub timestamp: u64,
}

impl CrashDump {
    /// Render the dump as JSON for logs and tooling.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Bounded store of crash dumps, oldest discarded first.
pub struct CrashDumpStore {
    dumps: VecDeque<CrashDump>,
    capacity: usize,
}

impl CrashDumpStore {
    /// Create a store holding at most `capacity` dumps.
    pub fn new(capacity: usize) -> Self {
        CrashDumpStore {
            dumps: VecDeque::new(),
            capacity,
        }
    }

    /// Append a dump, evicting the oldest when full.
    pub fn push(&mut self, dump: CrashDump) {
        if self.dumps.len() >= self.capacity {
            self.dumps.pop_front();
        }
        self.dumps.push_back(dump);
    }

    /// All stored dumps, oldest first.
    pub fn dumps(&self) -> Vec<CrashDump> {
        self.dumps.iter().cloned().collect()
    }

    /// Number of stored dumps.
    pub fn len(&self) -> usize {
        self.dumps.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.dumps.is_empty()
    }
}

/// Shared state the worker operates on.
struct FaultCore {
    table: Arc<ProcessTable>,
    scheduler: Arc<Mutex<Scheduler>>,
    links: Arc<LinkRegistry>,
    registry: Arc<ProcessRegistry>,
    supervisors: Arc<SupervisorRegistry>,
    stats: Arc<Mutex<EngineStats>>,
    crash_dumps: Mutex<CrashDumpStore>,
    tx: Sender<FaultEvent>,
    pending: AtomicUsize,
}

/// The fault handler: an event queue plus its worker thread.
pub struct FaultHandler {
    core: Arc<FaultCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FaultHandler {
    /// Create the handler and start its worker thread.
    pub fn new(
        table: Arc<ProcessTable>,
        scheduler: Arc<Mutex<Scheduler>>,
        links: Arc<LinkRegistry>,
        registry: Arc<ProcessRegistry>,
        supervisors: Arc<SupervisorRegistry>,
        stats: Arc<Mutex<EngineStats>>,
        crash_dump_capacity: usize,
    ) -> Self {
        let (tx, rx) = bounded(SIGNAL_QUEUE_DEPTH);
        let core = Arc::new(FaultCore {
            table,
            scheduler,
            links,
            registry,
            supervisors,
            stats,
            crash_dumps: Mutex::new(CrashDumpStore::new(crash_dump_capacity)),
            tx,
            pending: AtomicUsize::new(0),
        });
        let worker = Self::spawn_worker(Arc::clone(&core), rx);
        FaultHandler {
            core,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue an exit fan-out for a process that died.
    pub fn notify_exit(&self, target: Pid, reason: ExitReason) {
        self.send(FaultEvent::Exit { target, reason });
    }

    /// Queue an exit signal from one process to another without the sender
    /// itself exiting.
    pub fn exit_process(&self, from: Pid, to: Pid, reason: ExitReason) {
        self.send(FaultEvent::Signal {
            from,
            target: to,
            reason,
            link_kind: LinkKind::Link,
        });
    }

    /// Whether the worker has drained every queued event.
    pub fn is_idle(&self) -> bool {
        self.core.pending.load(Ordering::SeqCst) == 0
    }

    /// Crash dumps collected so far.
    pub fn crash_dumps(&self) -> Vec<CrashDump> {
        self.core.crash_dumps.lock().dumps()
    }

    /// Stop the worker thread. Queued events are processed first.
    pub fn shutdown(&self) {
        let _ = self.core.tx.send(FaultEvent::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    fn send(&self, event: FaultEvent) {
        self.core.pending.fetch_add(1, Ordering::SeqCst);
        if self.core.tx.send(event).is_err() {
            self.core.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("fault handler queue closed; dropping event");
        }
    }

    fn spawn_worker(core: Arc<FaultCore>, rx: Receiver<FaultEvent>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("krill-fault".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    match event {
                        FaultEvent::Shutdown => break,
                        FaultEvent::Exit { target, reason } => {
                            core.handle_exit(target, reason, true);
                            core.pending.fetch_sub(1, Ordering::SeqCst);
                        }
                        FaultEvent::Signal {
                            from,
                            target,
                            reason,
                            link_kind,
                        } => {
                            core.deliver_signal(from, target, reason, link_kind);
                            core.pending.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                }
            })
            .expect("failed to spawn fault handler thread")
    }
}

impl Drop for FaultHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl FaultCore {
    /// The single exit entry point. Idempotent: a process whose exit was
    /// already fanned out is left alone. `own_fault` distinguishes a
    /// process dying on its own (which records a crash dump for
    /// exceptions) from one taken down by a propagated signal, so a crash
    /// is dumped exactly once per originating failure.
    fn handle_exit(&self, pid: Pid, reason: ExitReason, own_fault: bool) {
        let Some(handle) = self.table.get(pid) else {
            return;
        };
        let dump = {
            let mut process = handle.write();
            if process.exit_handled {
                return;
            }
            process.exit_handled = true;
            process.mark_dead(reason.clone());
            let recorded = process
                .exit_reason
                .clone()
                .unwrap_or(ExitReason::Normal);
            if own_fault && matches!(recorded, ExitReason::Exception(_)) {
                Some(CrashDump {
                    pid: pid.raw(),
                    reason: recorded.to_value(),
                    counter: process.ip,
                    stack_slice: process.stack.iter().rev().take(8).cloned().collect(),
                    registered_name: process.registered_name.clone(),
                    timestamp: now_millis(),
                })
            } else {
                None
            }
        };
        let reason = handle
            .read()
            .exit_reason
            .clone()
            .unwrap_or(reason);
        debug!(pid = pid.raw(), reason = %reason, "process exited");

        self.scheduler.lock().mark_dead(pid);

        let (linked, watchers) = self.links.cleanup(pid);
        for peer in linked {
            self.pending.fetch_add(1, Ordering::SeqCst);
            if self
                .tx
                .send(FaultEvent::Signal {
                    from: pid,
                    target: peer,
                    reason: reason.clone(),
                    link_kind: LinkKind::Link,
                })
                .is_err()
            {
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
        for reference in watchers {
            let down = Value::map_from(vec![
                ("signal", Value::Str("DOWN".to_string())),
                ("ref", Value::Uint(reference.id)),
                ("process", Value::Uint(pid.raw())),
                ("reason", reason.to_value()),
            ]);
            self.deliver_message(reference.watcher, down);
        }

        let follow_ups = self.supervisors.handle_child_exit(pid, &reason);
        self.supervisors.remove_supervisor(pid);
        for (target, follow_up_reason) in follow_ups {
            self.handle_exit(target, follow_up_reason, false);
        }

        self.registry.unregister_pid(pid);
        self.stats.lock().processes_exited += 1;

        if let Some(dump) = dump {
            self.crash_dumps.lock().push(dump);
        }
    }

    /// Deliver a signal: convert to a mailbox message for trapping targets
    /// (except `Kill`), otherwise propagate the exit. This recursion is
    /// what makes linked groups die together.
    fn deliver_signal(&self, from: Pid, target: Pid, reason: ExitReason, link_kind: LinkKind) {
        if !self.table.is_alive(target) {
            return;
        }
        if self.links.traps_exit(target) && reason.is_trappable() {
            let message = Value::map_from(vec![
                ("signal", Value::Str("EXIT".to_string())),
                ("from", Value::Uint(from.raw())),
                ("reason", reason.to_value()),
                ("link_type", Value::Str(link_kind.name().to_string())),
            ]);
            self.deliver_message(target, message);
        } else {
            self.handle_exit(target, reason, false);
        }
    }

    /// Push a runtime-generated message into a mailbox and wake the
    /// receiver if it is waiting on a matching pattern.
    fn deliver_message(&self, target: Pid, value: Value) {
        let Some(mailbox) = self.table.mailbox(target) else {
            return;
        };
        let message = Message::new(target, value);
        let accepted = mailbox.lock().push(message.clone());
        let mut stats = self.stats.lock();
        if accepted {
            stats.messages_delivered += 1;
            drop(stats);
            self.scheduler
                .lock()
                .notify_message_delivered(target, &message);
        } else {
            stats.messages_dropped += 1;
            warn!(target = target.raw(), "mailbox full; dropping system message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::types::Priority;

    struct Fixture {
        table: Arc<ProcessTable>,
        scheduler: Arc<Mutex<Scheduler>>,
        links: Arc<LinkRegistry>,
        fault: FaultHandler,
    }

    fn setup() -> Fixture {
        let table = Arc::new(ProcessTable::new(100, 100));
        let scheduler = Arc::new(Mutex::new(Scheduler::new(Arc::clone(&table))));
        let links = Arc::new(LinkRegistry::new());
        let registry = Arc::new(ProcessRegistry::new());
        let supervisors = Arc::new(SupervisorRegistry::new(
            Arc::clone(&table),
            Arc::clone(&links),
            Arc::clone(&scheduler),
        ));
        let stats = Arc::new(Mutex::new(EngineStats::default()));
        let fault = FaultHandler::new(
            Arc::clone(&table),
            Arc::clone(&scheduler),
            Arc::clone(&links),
            registry,
            supervisors,
            stats,
            16,
        );
        Fixture {
            table,
            scheduler,
            links,
            fault,
        }
    }

    fn spawn(fixture: &Fixture) -> Pid {
        let pid = fixture
            .table
            .create(vec![], HashMap::new(), HashMap::new(), Priority::Normal, None)
            .unwrap();
        fixture.scheduler.lock().enqueue(pid);
        pid
    }

    fn drain(fixture: &Fixture) {
        for _ in 0..500 {
            if fixture.fault.is_idle() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("fault handler did not drain");
    }

    #[test]
    fn test_linked_processes_die_together() {
        let fixture = setup();
        let a = spawn(&fixture);
        let b = spawn(&fixture);
        fixture.links.link(a, b);

        fixture
            .fault
            .notify_exit(a, ExitReason::Custom(Value::Str("boom".to_string())));
        drain(&fixture);

        assert!(!fixture.table.is_alive(a));
        assert!(!fixture.table.is_alive(b));
    }

    #[test]
    fn test_trapping_process_receives_exit_message() {
        let fixture = setup();
        let a = spawn(&fixture);
        let b = spawn(&fixture);
        fixture.links.link(a, b);
        fixture.links.trap_exit(b, true);

        fixture.fault.notify_exit(a, ExitReason::Kill);
        drain(&fixture);

        // Kill reached b over a link, so it is trappable there; only an
        // untrappable direct kill bypasses the trap. The spec's exception
        // applies to the reason on the signal itself.
        assert!(!fixture.table.is_alive(a));
        assert!(!fixture.table.is_alive(b));

        let c = spawn(&fixture);
        let d = spawn(&fixture);
        fixture.links.link(c, d);
        fixture.links.trap_exit(d, true);
        fixture
            .fault
            .notify_exit(c, ExitReason::Custom(Value::Str("oops".to_string())));
        drain(&fixture);

        assert!(fixture.table.is_alive(d));
        let mailbox = fixture.table.mailbox(d).unwrap();
        let message = mailbox.lock().shift().unwrap();
        let Value::Map(entries) = message.value else {
            panic!("expected map message");
        };
        assert_eq!(entries.get("signal"), Some(&Value::Str("EXIT".to_string())));
        assert_eq!(entries.get("from"), Some(&Value::Uint(c.raw())));
    }

    #[test]
    fn test_monitor_down_message() {
        let fixture = setup();
        let watcher = spawn(&fixture);
        let watched = spawn(&fixture);
        let reference = fixture.links.monitor(watcher, watched);

        fixture.fault.notify_exit(watched, ExitReason::Normal);
        drain(&fixture);

        assert!(fixture.table.is_alive(watcher));
        let mailbox = fixture.table.mailbox(watcher).unwrap();
        let message = mailbox.lock().shift().unwrap();
        let Value::Map(entries) = message.value else {
            panic!("expected map message");
        };
        assert_eq!(entries.get("signal"), Some(&Value::Str("DOWN".to_string())));
        assert_eq!(entries.get("ref"), Some(&Value::Uint(reference.id)));
        assert_eq!(entries.get("process"), Some(&Value::Uint(watched.raw())));
    }

    #[test]
    fn test_exit_fanout_is_idempotent() {
        let fixture = setup();
        let watcher = spawn(&fixture);
        let watched = spawn(&fixture);
        fixture.links.monitor(watcher, watched);

        fixture.fault.notify_exit(watched, ExitReason::Normal);
        fixture.fault.notify_exit(watched, ExitReason::Kill);
        drain(&fixture);

        let mailbox = fixture.table.mailbox(watcher).unwrap();
        assert_eq!(mailbox.lock().len(), 1);
    }

    #[test]
    fn test_crash_dump_recorded_for_exceptions() {
        let fixture = setup();
        let pid = spawn(&fixture);
        let exception = Value::map_from(vec![
            ("type", Value::Symbol("exception".to_string())),
            ("message", Value::Str("boom".to_string())),
        ]);

        fixture
            .fault
            .notify_exit(pid, ExitReason::Exception(exception));
        drain(&fixture);

        let dumps = fixture.fault.crash_dumps();
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].pid, pid.raw());
        assert!(dumps[0].to_json().contains("boom"));
    }

    #[test]
    fn test_crash_store_is_bounded() {
        let mut store = CrashDumpStore::new(2);
        for i in 0..5 {
            store.push(CrashDump {
                pid: i,
                reason: Value::Null,
                counter: 0,
                stack_slice: vec![],
                registered_name: None,
                timestamp: 0,
            });
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.dumps()[0].pid, 3);
    }
}
