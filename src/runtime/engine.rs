//! The engine: composition root and event loop
//!
//! One logical execution unit drives the dispatch loop; the fault handler
//! worker is the only other thread in the core. Each iteration delivers
//! due timer messages, flushes reactivations, expires timed waits, retries
//! blocked sends, then runs one reduction slice on the highest-priority
//! runnable process and reclassifies it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bytecode::{Instruction, Value};
use crate::debug::{DebugAction, DebugState, Debugger};
use crate::error::{ExecError, VmResult};
use crate::runtime::builtins::BuiltinRegistry;
use crate::runtime::executor::Executor;
use crate::runtime::fault::{CrashDump, FaultHandler};
use crate::runtime::links::LinkRegistry;
use crate::runtime::process::{ProcessHandle, ProcessTable, WaitKind};
use crate::runtime::registry::ProcessRegistry;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::supervisor::SupervisorRegistry;
use crate::runtime::timer::TimerManager;
use crate::types::{EngineStats, ExitReason, Pid, Priority, ProcessState, VmConfig};

const IDLE_QUANTUM: Duration = Duration::from_millis(1);
const CRASH_DUMP_CAPACITY: usize = 64;
const DEADLOCK_IDLE_TICKS: u32 = 32;

/// The virtual machine engine.
pub struct Engine {
    config: VmConfig,
    table: Arc<ProcessTable>,
    scheduler: Arc<Mutex<Scheduler>>,
    links: Arc<LinkRegistry>,
    registry: Arc<ProcessRegistry>,
    timers: Arc<Mutex<TimerManager>>,
    supervisors: Arc<SupervisorRegistry>,
    fault: Arc<FaultHandler>,
    executor: Executor,
    reactivations: Arc<Mutex<VecDeque<Pid>>>,
    stats: Arc<Mutex<EngineStats>>,
    debugger: Mutex<Option<Box<dyn Debugger>>>,
    debug_state: Mutex<DebugState>,
}

impl Engine {
    /// Build an engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    /// Build an engine with a custom configuration.
    pub fn with_config(config: VmConfig) -> Self {
        let table = Arc::new(ProcessTable::new(
            config.max_processes,
            config.max_mailbox_size,
        ));
        let scheduler = Arc::new(Mutex::new(Scheduler::new(Arc::clone(&table))));
        let links = Arc::new(LinkRegistry::new());
        let registry = Arc::new(ProcessRegistry::new());
        let timers = Arc::new(Mutex::new(TimerManager::new()));
        let supervisors = Arc::new(SupervisorRegistry::new(
            Arc::clone(&table),
            Arc::clone(&links),
            Arc::clone(&scheduler),
        ));
        let stats = Arc::new(Mutex::new(EngineStats::default()));
        let reactivations = Arc::new(Mutex::new(VecDeque::new()));
        let fault = Arc::new(FaultHandler::new(
            Arc::clone(&table),
            Arc::clone(&scheduler),
            Arc::clone(&links),
            Arc::clone(&registry),
            Arc::clone(&supervisors),
            Arc::clone(&stats),
            CRASH_DUMP_CAPACITY,
        ));
        let executor = Executor::new(
            config.clone(),
            Arc::clone(&table),
            Arc::clone(&scheduler),
            Arc::clone(&links),
            Arc::clone(&registry),
            Arc::clone(&timers),
            Arc::clone(&supervisors),
            Arc::clone(&fault),
            BuiltinRegistry::with_defaults(),
            Arc::clone(&reactivations),
            Arc::clone(&stats),
        );
        Engine {
            config,
            table,
            scheduler,
            links,
            registry,
            timers,
            supervisors,
            fault,
            executor,
            reactivations,
            stats,
            debugger: Mutex::new(None),
            debug_state: Mutex::new(DebugState::default()),
        }
    }

    /// Spawn a top-level process from a code block.
    pub fn spawn(&self, instructions: Vec<Instruction>) -> VmResult<Pid> {
        self.spawn_with(instructions, HashMap::new(), HashMap::new(), Priority::Normal)
    }

    /// Spawn a top-level process with subroutines, seed globals and a
    /// priority.
    pub fn spawn_with(
        &self,
        instructions: Vec<Instruction>,
        subroutines: HashMap<String, Vec<Instruction>>,
        globals: HashMap<String, Value>,
        priority: Priority,
    ) -> VmResult<Pid> {
        let pid = self
            .table
            .create(instructions, subroutines, globals, priority, None)?;
        self.stats.lock().processes_spawned += 1;
        self.scheduler.lock().enqueue(pid);
        Ok(pid)
    }

    /// Run the event loop until the system quiesces or the iteration
    /// limit is reached. Hitting the limit is logged, not fatal.
    pub fn run(&self) -> VmResult<EngineStats> {
        let mut idle_ticks: u32 = 0;
        let mut last_cleanup = Instant::now();

        for _ in 0..self.config.iteration_limit {
            self.stats.lock().iterations += 1;

            self.deliver_due_timers();
            if last_cleanup.elapsed() >= self.config.message_cleanup_interval {
                self.sweep_expired_messages();
                last_cleanup = Instant::now();
            }
            self.flush_reactivations();
            self.scheduler.lock().check_timeouts();
            let deliveries = self.scheduler.lock().check_blocked();
            if !deliveries.is_empty() {
                let mut stats = self.stats.lock();
                stats.messages_delivered += deliveries.len() as u64;
                drop(stats);
                let mut scheduler = self.scheduler.lock();
                for (receiver, message) in &deliveries {
                    scheduler.notify_message_delivered(*receiver, message);
                }
            }

            let next = self.scheduler.lock().next_runnable();
            let Some(pid) = next else {
                let parked = self.scheduler.lock().has_parked_work();
                let timers_pending = !self.timers.lock().is_empty();
                if parked || timers_pending || !self.fault.is_idle() {
                    idle_ticks += 1;
                    if idle_ticks >= DEADLOCK_IDLE_TICKS {
                        self.detect_deadlocks();
                        idle_ticks = 0;
                    }
                    std::thread::sleep(IDLE_QUANTUM);
                    continue;
                }
                break;
            };
            idle_ticks = 0;
            self.run_slice(pid);
        }

        if self.scheduler.lock().has_runnable() {
            warn!(
                limit = self.config.iteration_limit,
                "iteration limit reached with runnable processes remaining"
            );
        }
        Ok(self.stats.lock().clone())
    }

    /// Execute one reduction slice on a process and reclassify it.
    fn run_slice(&self, pid: Pid) {
        let Some(handle) = self.table.get(pid) else {
            return;
        };
        let budget = handle
            .priority()
            .reduction_budget(self.config.max_reductions_per_slice);
        {
            let mut process = handle.write();
            process.reductions = 0;
            self.stats.lock().context_switches += 1;

            while process.state == ProcessState::Alive
                && !process.yielded
                && process.reductions < budget
            {
                if process.ip >= process.instructions.len() {
                    // Ran past the end: a clean finish
                    process.mark_dead(ExitReason::Normal);
                    break;
                }
                let instruction = process.instructions[process.ip].clone();
                if self.debug_break(&process, &instruction) {
                    process.mark_dead(ExitReason::Kill);
                    break;
                }
                let dispatch = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.executor.execute(&mut process, &instruction)
                }));
                if let Err(panic_payload) = dispatch {
                    let message = panic_message(panic_payload);
                    warn!(pid = pid.raw(), message = %message, "host panic during dispatch");
                    self.executor
                        .raise(&mut process, ExecError::Unhandled(message));
                }
                process.reductions += 1;
                self.stats.lock().reductions += 1;
            }
        }
        self.reclassify(pid, &handle);
    }

    fn reclassify(&self, pid: Pid, handle: &ProcessHandle) {
        let (state, reason) = {
            let mut process = handle.write();
            process.yielded = false;
            (process.state, process.exit_reason.clone())
        };
        match state {
            ProcessState::Alive | ProcessState::Stale => {
                // Budget spent or yielded; back of its priority queue
                self.scheduler.lock().yield_process(pid);
            }
            ProcessState::Waiting => {
                // Register the park and immediately re-wake if a message
                // arrived while the process was still mid-slice; the
                // receive re-runs and re-scans its mailbox.
                let mut scheduler = self.scheduler.lock();
                scheduler.enqueue(pid);
                let has_mail = self
                    .table
                    .mailbox(pid)
                    .map(|mailbox| !mailbox.lock().is_empty())
                    .unwrap_or(false);
                if has_mail {
                    let in_receive = matches!(
                        handle.read().waiting,
                        Some(WaitKind::Receive { .. })
                    );
                    if in_receive {
                        scheduler.make_runnable(pid);
                    }
                }
            }
            ProcessState::Blocked => {
                self.scheduler.lock().block_on_send(pid);
            }
            ProcessState::Dead => {
                self.fault
                    .notify_exit(pid, reason.unwrap_or(ExitReason::Normal));
            }
        }
    }

    /// Step 1 of the loop: move due timer messages into their mailboxes.
    fn deliver_due_timers(&self) {
        let due = self.timers.lock().due(Instant::now());
        if due.is_empty() {
            return;
        }
        for entry in due {
            if !self.table.is_alive(entry.target) {
                self.stats.lock().messages_dropped += 1;
                continue;
            }
            let Some(mailbox) = self.table.mailbox(entry.target) else {
                self.stats.lock().messages_dropped += 1;
                continue;
            };
            let accepted = mailbox.lock().push(entry.message.clone());
            if accepted {
                self.stats.lock().messages_delivered += 1;
                self.scheduler
                    .lock()
                    .notify_message_delivered(entry.target, &entry.message);
            } else {
                self.stats.lock().messages_dropped += 1;
                debug!(target = entry.target.raw(), "timer message dropped: mailbox full");
            }
        }
    }

    fn flush_reactivations(&self) {
        loop {
            let next = self.reactivations.lock().pop_front();
            let Some(pid) = next else { break };
            self.scheduler.lock().make_runnable(pid);
        }
    }

    fn sweep_expired_messages(&self) {
        let mut expired = 0usize;
        for pid in self.table.pids() {
            if let Some(mailbox) = self.table.mailbox(pid) {
                expired += mailbox.lock().cleanup_expired_messages();
            }
        }
        if expired > 0 {
            self.stats.lock().messages_expired += expired as u64;
        }
    }

    /// Opportunistic deadlock detection: DFS for cycles in the wait-for
    /// graph built from parked processes and their dependency sets.
    fn detect_deadlocks(&self) {
        let scheduler = self.scheduler.lock();
        let mut graph: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for pid in scheduler
            .waiting_pids()
            .into_iter()
            .chain(scheduler.blocked_pids())
        {
            if let Some(handle) = self.table.get(pid) {
                let deps: Vec<Pid> = handle.read().dependencies.iter().copied().collect();
                graph.insert(pid, deps);
            }
        }
        drop(scheduler);

        let mut visited: HashSet<Pid> = HashSet::new();
        for &start in graph.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut path: Vec<Pid> = Vec::new();
            let mut on_path: HashSet<Pid> = HashSet::new();
            if Self::dfs_cycle(&graph, start, &mut visited, &mut path, &mut on_path) {
                warn!(cycle = ?path, "deadlock detected among waiting processes");
                self.stats.lock().deadlocks_detected += 1;
                return;
            }
        }
    }

    fn dfs_cycle(
        graph: &HashMap<Pid, Vec<Pid>>,
        node: Pid,
        visited: &mut HashSet<Pid>,
        path: &mut Vec<Pid>,
        on_path: &mut HashSet<Pid>,
    ) -> bool {
        if on_path.contains(&node) {
            return true;
        }
        if visited.contains(&node) {
            return false;
        }
        visited.insert(node);
        on_path.insert(node);
        path.push(node);
        if let Some(deps) = graph.get(&node) {
            for &dep in deps {
                if graph.contains_key(&dep)
                    && Self::dfs_cycle(graph, dep, visited, path, on_path)
                {
                    return true;
                }
            }
        }
        on_path.remove(&node);
        path.pop();
        false
    }

    /// Consult the debugger. Returns true when the slice must stop.
    fn debug_break(
        &self,
        process: &crate::runtime::process::ProcessContext,
        instruction: &Instruction,
    ) -> bool {
        let mut debugger_slot = self.debugger.lock();
        let Some(debugger) = debugger_slot.as_mut() else {
            return false;
        };
        let mut state = self.debug_state.lock();
        let armed = state.step_armed
            || state
                .step_over_depth
                .map(|depth| process.call_stack.len() <= depth)
                .unwrap_or(false);
        if !armed && !debugger.should_break(process, instruction) {
            return false;
        }
        state.step_armed = false;
        state.step_over_depth = None;
        match debugger.on_instruction(process, instruction) {
            DebugAction::Continue => false,
            DebugAction::Step => {
                state.step_armed = true;
                false
            }
            DebugAction::StepOver => {
                state.step_over_depth = Some(process.call_stack.len());
                false
            }
            DebugAction::Abort => true,
        }
    }

    /// Install a debugger hook.
    pub fn set_debugger(&self, debugger: Box<dyn Debugger>) {
        *self.debugger.lock() = Some(debugger);
    }

    /// Remove the debugger hook.
    pub fn clear_debugger(&self) {
        *self.debugger.lock() = None;
    }

    /// The engine configuration.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> EngineStats {
        self.stats.lock().clone()
    }

    /// Crash dumps collected by the fault handler.
    pub fn crash_dumps(&self) -> Vec<CrashDump> {
        self.fault.crash_dumps()
    }

    /// The process table.
    pub fn table(&self) -> &Arc<ProcessTable> {
        &self.table
    }

    /// The link and monitor registry.
    pub fn links(&self) -> &Arc<LinkRegistry> {
        &self.links
    }

    /// The name registry.
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// The supervisor registry.
    pub fn supervisors(&self) -> &Arc<SupervisorRegistry> {
        &self.supervisors
    }

    /// Mutable access to the executor for custom opcode handlers and
    /// built-in registration.
    pub fn executor_mut(&mut self) -> &mut Executor {
        &mut self.executor
    }

    /// Block until the fault handler has drained its queue.
    pub fn wait_for_fault_handler(&self) {
        while !self.fault.is_idle() {
            std::thread::sleep(IDLE_QUANTUM);
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown host panic".to_string()
    }
}
