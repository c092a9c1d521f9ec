//! Per-process execution state

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::bytecode::{Instruction, Lambda, Value};
use crate::error::{ExecError, ExecResult, VmError, VmResult};
use crate::runtime::mailbox::{Mailbox, Message};
use crate::types::{now_millis, ExitReason, Pid, Priority, ProcessState};

/// A call-stack frame. `CALL` records where to return to and what the
/// caller's locals frame looked like so `RETURN` can restore it.
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Address of the instruction after the call
    pub return_ip: usize,
    /// Caller's frame pointer
    pub saved_frame_pointer: usize,
    /// Caller's locals length; callee slots are truncated on return
    pub saved_locals_len: usize,
    /// Subroutine name, when known, for stack traces
    pub function: Option<String>,
}

/// State saved when `CALL_INDIRECT` switches to a callee's code.
///
/// `at_call_depth` is the call-stack length right after the call frame was
/// pushed; `RETURN` restores this frame only when popping back to that
/// depth, keeping the two stacks in lock-step.
#[derive(Debug, Clone)]
pub struct SavedFrame {
    /// Call-stack depth this frame is paired with
    pub at_call_depth: usize,
    /// The caller's instruction list
    pub instructions: Vec<Instruction>,
    /// The caller's closure context
    pub closure: Option<Lambda>,
    /// Globals shadowed by an injected capture set; `None` means the name
    /// was absent before injection
    pub saved_globals: Vec<(String, Option<Value>)>,
}

/// Exception handler frame pushed by `TRY_BEGIN`.
///
/// Snapshots every depth an unwind must restore, including the
/// saved-instructions depth so unwinding across indirect calls cannot
/// desynchronize the call stack from the saved-instructions stack.
#[derive(Debug, Clone)]
pub struct HandlerFrame {
    /// Where control lands on unwind
    pub catch_ip: usize,
    /// Data stack depth at install time
    pub stack_len: usize,
    /// Call stack depth at install time
    pub call_stack_len: usize,
    /// Saved-instructions depth at install time
    pub saved_instructions_len: usize,
    /// Locals length at install time
    pub locals_len: usize,
    /// Frame pointer at install time
    pub frame_pointer: usize,
}

/// What a waiting process is waiting for.
#[derive(Debug, Clone)]
pub enum WaitKind {
    /// Parked in a receive. `pattern`/`matcher` scan arriving messages;
    /// both `None` means any message wakes the process. When
    /// `timeout_result` is set, a timeout pushes `Null` and `false` and
    /// skips past the receive instead of merely waking it.
    Receive {
        /// Structural pattern, `None` for any message
        pattern: Option<Value>,
        /// Inline matcher function for selective receives
        matcher: Option<Lambda>,
        /// Push the `(Null, false)` timeout indicator on expiry
        timeout_result: bool,
    },
    /// Parked in `SLEEP`; wakes with no stack effect
    Sleep,
}

/// A subroutine entry: where its code starts in the process's instruction
/// list and how long it is.
#[derive(Debug, Clone)]
pub struct Subroutine {
    /// Start address
    pub start: usize,
    /// Number of instructions
    pub len: usize,
}

/// Per-process execution context.
///
/// Everything a process owns lives here: code, stacks, locals, globals,
/// mailbox handle, waiting state, handler frames and exit bookkeeping.
pub struct ProcessContext {
    /// Process address
    pub pid: Pid,
    /// Lifecycle state
    pub state: ProcessState,
    /// Scheduling priority
    pub priority: Priority,
    /// Instruction pointer
    pub ip: usize,
    /// Owned instruction list; subroutine bodies are appended after the
    /// main code with their start addresses recorded in `subroutines`
    pub instructions: Vec<Instruction>,
    /// Length of the main code, before appended subroutines
    pub end_of_main: usize,
    /// Data stack
    pub stack: Vec<Value>,
    /// Local variable slots
    pub locals: Vec<Value>,
    /// Base index into `locals` for the current frame
    pub frame_pointer: usize,
    /// Return addresses and caller frames
    pub call_stack: Vec<CallFrame>,
    /// Caller code saved across indirect calls
    pub saved_instructions: Vec<SavedFrame>,
    /// Closure context while executing inside a lambda
    pub current_closure: Option<Lambda>,
    /// Process-local globals
    pub globals: HashMap<String, Value>,
    /// Named subroutines addressable by `CALL`
    pub subroutines: HashMap<String, Subroutine>,
    /// The process mailbox; shared so other threads deliver without
    /// taking the process lock
    pub mailbox: Arc<Mutex<Mailbox>>,
    /// Sends parked on full target mailboxes
    pub blocked_sends: VecDeque<(Pid, Message)>,
    /// What the process is waiting for, when `state` is `Waiting`
    pub waiting: Option<WaitKind>,
    /// When the wait began
    pub waiting_since: Option<Instant>,
    /// Wait deadline offset
    pub waiting_timeout: Option<Duration>,
    /// Installed exception handlers, innermost last
    pub exception_handlers: Vec<HandlerFrame>,
    /// Exception currently being handled
    pub current_exception: Option<Value>,
    /// Process flags
    pub flags: HashMap<String, Value>,
    /// Registered name, if any
    pub registered_name: Option<String>,
    /// Spawning process
    pub parent: Option<Pid>,
    /// Exit reason, recorded at death
    pub exit_reason: Option<ExitReason>,
    /// Fault handler has fanned out this process's exit
    pub exit_handled: bool,
    /// Process asked to give up the rest of its slice
    pub yielded: bool,
    /// Reductions consumed in the current slice
    pub reductions: u64,
    /// Creation time
    pub created_at: Instant,
    /// Creation timestamp for snapshots
    pub created_at_millis: u64,
    /// Addresses this process is waiting on, for deadlock detection
    pub dependencies: HashSet<Pid>,
}

impl ProcessContext {
    /// Create a process around a main code block and its subroutines.
    pub fn new(
        pid: Pid,
        main: Vec<Instruction>,
        subroutine_code: HashMap<String, Vec<Instruction>>,
        globals: HashMap<String, Value>,
        priority: Priority,
        mailbox_capacity: usize,
    ) -> Self {
        let end_of_main = main.len();
        let mut instructions = main;
        let mut subroutines = HashMap::new();
        for (name, code) in subroutine_code {
            subroutines.insert(
                name,
                Subroutine {
                    start: instructions.len(),
                    len: code.len(),
                },
            );
            instructions.extend(code);
        }
        ProcessContext {
            pid,
            state: ProcessState::Alive,
            priority,
            ip: 0,
            instructions,
            end_of_main,
            stack: Vec::new(),
            locals: Vec::new(),
            frame_pointer: 0,
            call_stack: Vec::new(),
            saved_instructions: Vec::new(),
            current_closure: None,
            globals,
            subroutines,
            mailbox: Arc::new(Mutex::new(Mailbox::with_capacity(mailbox_capacity))),
            blocked_sends: VecDeque::new(),
            waiting: None,
            waiting_since: None,
            waiting_timeout: None,
            exception_handlers: Vec::new(),
            current_exception: None,
            flags: HashMap::new(),
            registered_name: None,
            parent: None,
            exit_reason: None,
            exit_handled: false,
            yielded: false,
            reductions: 0,
            created_at: Instant::now(),
            created_at_millis: now_millis(),
            dependencies: HashSet::new(),
        }
    }

    /// Push a value, enforcing the configured stack limit.
    pub fn push_value(&mut self, value: Value, max_stack: usize) -> ExecResult<()> {
        if self.stack.len() >= max_stack {
            return Err(ExecError::StackOverflow(max_stack));
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pop a value, raising `StackUnderflow` tagged with the opcode name.
    pub fn pop_value(&mut self, op: &str) -> ExecResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| ExecError::StackUnderflow(op.to_string()))
    }

    /// Verify the stack holds at least `depth` items.
    pub fn require_depth(&self, depth: usize, op: &str) -> ExecResult<()> {
        if self.stack.len() < depth {
            return Err(ExecError::StackUnderflow(op.to_string()));
        }
        Ok(())
    }

    /// Read a frame-relative local slot.
    pub fn load_local(&self, slot: usize) -> ExecResult<Value> {
        let index = self.frame_pointer + slot;
        self.locals.get(index).cloned().ok_or_else(|| {
            ExecError::UndefinedVariable(format!("local {}", slot))
        })
    }

    /// Write a frame-relative local slot, extending with nulls as needed.
    pub fn store_local(&mut self, slot: usize, value: Value) {
        let index = self.frame_pointer + slot;
        if index >= self.locals.len() {
            self.locals.resize(index + 1, Value::Null);
        }
        self.locals[index] = value;
    }

    /// Whether the process is still schedulable.
    pub fn is_alive(&self) -> bool {
        self.state != ProcessState::Dead
    }

    /// Whether trap-exit is set in the process flags.
    pub fn traps_exits(&self) -> bool {
        matches!(self.flags.get("trap_exit"), Some(Value::Bool(true)))
    }

    /// Park the process in a receive wait.
    pub fn park_receiving(
        &mut self,
        kind: WaitKind,
        timeout: Option<Duration>,
    ) {
        self.state = ProcessState::Waiting;
        self.waiting = Some(kind);
        self.waiting_since = Some(Instant::now());
        self.waiting_timeout = timeout;
    }

    /// Clear all waiting bookkeeping.
    pub fn clear_waiting(&mut self) {
        self.waiting = None;
        self.waiting_since = None;
        self.waiting_timeout = None;
        self.dependencies.clear();
    }

    /// Mark the process dead with a reason, if not already dead.
    pub fn mark_dead(&mut self, reason: ExitReason) {
        if self.state != ProcessState::Dead {
            self.state = ProcessState::Dead;
        }
        if self.exit_reason.is_none() {
            self.exit_reason = Some(reason);
        }
    }

    /// Extract the code blocks of every subroutine, keyed by name, so a
    /// spawned child can carry its own copies.
    pub fn subroutine_code(&self) -> HashMap<String, Vec<Instruction>> {
        self.subroutines
            .iter()
            .map(|(name, sub)| {
                (
                    name.clone(),
                    self.instructions[sub.start..sub.start + sub.len].to_vec(),
                )
            })
            .collect()
    }

    /// Snapshot used by `GET_INFO`; link and monitor sets are appended by
    /// the executor from the registries.
    pub fn info(&self) -> Value {
        Value::map_from(vec![
            ("address", Value::Uint(self.pid.raw())),
            ("state", Value::Symbol(format!("{:?}", self.state).to_lowercase())),
            (
                "priority",
                Value::Symbol(format!("{:?}", self.priority).to_lowercase()),
            ),
            ("mailbox_size", Value::Uint(self.mailbox.lock().len() as u64)),
            ("reductions", Value::Uint(self.reductions)),
            (
                "registered_name",
                self.registered_name
                    .clone()
                    .map(Value::Str)
                    .unwrap_or(Value::Null),
            ),
            (
                "parent",
                self.parent.map(|p| Value::Uint(p.raw())).unwrap_or(Value::Null),
            ),
            ("created_at", Value::Uint(self.created_at_millis)),
        ])
    }
}

/// Cloneable shared handle to a process context.
pub struct ProcessHandle {
    inner: Arc<RwLock<ProcessContext>>,
}

impl ProcessHandle {
    /// Wrap a context in a shared handle.
    pub fn new(context: ProcessContext) -> Self {
        ProcessHandle {
            inner: Arc::new(RwLock::new(context)),
        }
    }

    /// Read access to the context.
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, ProcessContext> {
        self.inner.read()
    }

    /// Write access to the context.
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, ProcessContext> {
        self.inner.write()
    }

    /// The process address.
    pub fn pid(&self) -> Pid {
        self.inner.read().pid
    }

    /// The process state.
    pub fn state(&self) -> ProcessState {
        self.inner.read().state
    }

    /// The process state, or `None` if the context is locked right now.
    /// A locked context is one being executed, hence alive.
    pub fn try_state(&self) -> Option<ProcessState> {
        self.inner.try_read().map(|process| process.state)
    }

    /// The process priority.
    pub fn priority(&self) -> Priority {
        self.inner.read().priority
    }
}

impl Clone for ProcessHandle {
    fn clone(&self) -> Self {
        ProcessHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// The process table: contexts plus a parallel mailbox index.
///
/// Mailboxes are indexed separately so the fault handler and delayed
/// message delivery can push into them without touching process locks.
pub struct ProcessTable {
    processes: DashMap<Pid, ProcessHandle>,
    mailboxes: DashMap<Pid, Arc<Mutex<Mailbox>>>,
    max_processes: usize,
    mailbox_capacity: usize,
}

impl ProcessTable {
    /// Create a table bounded at `max_processes`.
    pub fn new(max_processes: usize, mailbox_capacity: usize) -> Self {
        ProcessTable {
            processes: DashMap::new(),
            mailboxes: DashMap::new(),
            max_processes,
            mailbox_capacity,
        }
    }

    /// Create and register a process. The caller is responsible for
    /// enqueueing it with the scheduler.
    pub fn create(
        &self,
        main: Vec<Instruction>,
        subroutines: HashMap<String, Vec<Instruction>>,
        globals: HashMap<String, Value>,
        priority: Priority,
        parent: Option<Pid>,
    ) -> VmResult<Pid> {
        // try_state: a context locked by its executing thread counts as
        // live, and taking its lock here could deadlock against that
        // same thread creating the process.
        let live = self
            .processes
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_state()
                    .map(|state| state != ProcessState::Dead)
                    .unwrap_or(true)
            })
            .count();
        if live >= self.max_processes {
            return Err(VmError::MaxProcesses(self.max_processes));
        }
        let pid = Pid::new();
        let mut context = ProcessContext::new(
            pid,
            main,
            subroutines,
            globals,
            priority,
            self.mailbox_capacity,
        );
        context.parent = parent;
        let mailbox = Arc::clone(&context.mailbox);
        self.processes.insert(pid, ProcessHandle::new(context));
        self.mailboxes.insert(pid, mailbox);
        Ok(pid)
    }

    /// Look up a process handle.
    pub fn get(&self, pid: Pid) -> Option<ProcessHandle> {
        self.processes.get(&pid).map(|entry| entry.value().clone())
    }

    /// Look up a process mailbox without touching the process lock.
    pub fn mailbox(&self, pid: Pid) -> Option<Arc<Mutex<Mailbox>>> {
        self.mailboxes.get(&pid).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a pid refers to a live process.
    pub fn is_alive(&self, pid: Pid) -> bool {
        self.get(pid)
            .map(|handle| handle.state() != ProcessState::Dead)
            .unwrap_or(false)
    }

    /// Remove a process and its mailbox entry.
    pub fn remove(&self, pid: Pid) {
        self.processes.remove(&pid);
        self.mailboxes.remove(&pid);
    }

    /// All known pids.
    pub fn pids(&self) -> Vec<Pid> {
        self.processes.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of registered processes, dead ones included until removal.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
