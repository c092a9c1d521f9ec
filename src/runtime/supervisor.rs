//! Supervision trees: child specifications, restart strategies and windows

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bytecode::{Instruction, Value};
use crate::error::{SupervisionError, VmResult};
use crate::runtime::links::LinkRegistry;
use crate::runtime::mailbox::Message;
use crate::runtime::process::ProcessTable;
use crate::runtime::scheduler::Scheduler;
use crate::types::{ExitReason, Pid, Priority};

/// When a dead child is restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Always restart
    Permanent,
    /// Restart only on abnormal exit
    Transient,
    /// Never restart
    Temporary,
}

/// How a child is taken down during supervisor-driven termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Mark dead immediately with reason `Kill`
    Brutal,
    /// Deliver a shutdown message, then force-kill after the duration
    Timeout(Duration),
    /// Deliver a shutdown message and wait for as long as it takes
    Infinity,
}

/// Worker or nested supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildType {
    /// Ordinary process
    Worker,
    /// A process acting as a supervisor itself
    Supervisor,
}

/// Which children restart when one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartStrategy {
    /// Restart only the failed child
    OneForOne,
    /// Terminate and restart every child
    OneForAll,
    /// Terminate and restart the failed child and everything started after it
    RestForOne,
    /// OneForOne over dynamically added identical children
    SimpleOneForOne,
}

impl RestartStrategy {
    /// Parse from a symbol or string name.
    pub fn parse(name: &str) -> Option<RestartStrategy> {
        match name {
            "one_for_one" => Some(RestartStrategy::OneForOne),
            "one_for_all" => Some(RestartStrategy::OneForAll),
            "rest_for_one" => Some(RestartStrategy::RestForOne),
            "simple_one_for_one" => Some(RestartStrategy::SimpleOneForOne),
            _ => None,
        }
    }
}

/// Everything needed to start (and restart) a child process.
#[derive(Clone)]
pub struct ChildSpec {
    /// Child identifier, unique within its supervisor
    pub id: String,
    /// Main code; the child gets its own clone at each start
    pub instructions: Vec<Instruction>,
    /// Subroutine blocks shared across restarts
    pub subroutines: HashMap<String, Vec<Instruction>>,
    /// Seed globals, cloned at each start
    pub globals: HashMap<String, Value>,
    /// Worker or nested supervisor
    pub child_type: ChildType,
    /// Restart policy
    pub restart: RestartPolicy,
    /// Shutdown policy
    pub shutdown: ShutdownPolicy,
    /// Restarts allowed within the window
    pub max_restarts: u32,
    /// Sliding restart-rate window
    pub restart_window: Duration,
}

impl ChildSpec {
    /// A worker spec with default policies.
    pub fn new(id: impl Into<String>, instructions: Vec<Instruction>) -> Self {
        ChildSpec {
            id: id.into(),
            instructions,
            subroutines: HashMap::new(),
            globals: HashMap::new(),
            child_type: ChildType::Worker,
            restart: RestartPolicy::Permanent,
            shutdown: ShutdownPolicy::Brutal,
            max_restarts: 3,
            restart_window: Duration::from_secs(5),
        }
    }

    /// Set the restart policy.
    pub fn restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Set the shutdown policy.
    pub fn shutdown(mut self, shutdown: ShutdownPolicy) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Set the child type.
    pub fn child_type(mut self, child_type: ChildType) -> Self {
        self.child_type = child_type;
        self
    }

    /// Set the restart budget.
    pub fn max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Set the restart window.
    pub fn restart_window(mut self, window: Duration) -> Self {
        self.restart_window = window;
        self
    }

    /// Set seed globals.
    pub fn globals(mut self, globals: HashMap<String, Value>) -> Self {
        self.globals = globals;
        self
    }

    /// Set subroutines.
    pub fn subroutines(mut self, subroutines: HashMap<String, Vec<Instruction>>) -> Self {
        self.subroutines = subroutines;
        self
    }

    /// Parse a spec out of a runtime map value, as `START_CHILD` receives it.
    pub fn from_value(value: &Value) -> Result<ChildSpec, SupervisionError> {
        let Value::Map(entries) = value else {
            return Err(SupervisionError::InvalidChildSpec(format!(
                "expected a map, got {}",
                value.type_name()
            )));
        };
        let id = match entries.get("id") {
            Some(Value::Str(id)) | Some(Value::Symbol(id)) => id.clone(),
            _ => {
                return Err(SupervisionError::InvalidChildSpec(
                    "missing string id".to_string(),
                ))
            }
        };
        let instructions = match entries.get("instructions") {
            Some(Value::Instructions(code)) => code.clone(),
            Some(Value::Lambda(lambda)) => lambda.instructions.clone(),
            _ => {
                return Err(SupervisionError::InvalidChildSpec(
                    "missing instructions".to_string(),
                ))
            }
        };
        let mut spec = ChildSpec::new(id, instructions);
        if let Some(Value::Symbol(name)) | Some(Value::Str(name)) = entries.get("restart") {
            spec.restart = match name.as_str() {
                "permanent" => RestartPolicy::Permanent,
                "transient" => RestartPolicy::Transient,
                "temporary" => RestartPolicy::Temporary,
                other => {
                    return Err(SupervisionError::InvalidChildSpec(format!(
                        "unknown restart policy {}",
                        other
                    )))
                }
            };
        }
        if let Some(Value::Symbol(name)) | Some(Value::Str(name)) = entries.get("type") {
            spec.child_type = match name.as_str() {
                "worker" => ChildType::Worker,
                "supervisor" => ChildType::Supervisor,
                other => {
                    return Err(SupervisionError::InvalidChildSpec(format!(
                        "unknown child type {}",
                        other
                    )))
                }
            };
        }
        match entries.get("shutdown") {
            Some(Value::Symbol(name)) | Some(Value::Str(name)) => {
                spec.shutdown = match name.as_str() {
                    "brutal" => ShutdownPolicy::Brutal,
                    "infinity" => ShutdownPolicy::Infinity,
                    other => {
                        return Err(SupervisionError::InvalidChildSpec(format!(
                            "unknown shutdown policy {}",
                            other
                        )))
                    }
                };
            }
            Some(value) if value.is_numeric() => {
                let seconds = value.as_float().unwrap_or(0.0).max(0.0);
                spec.shutdown = ShutdownPolicy::Timeout(Duration::from_secs_f64(seconds));
            }
            _ => {}
        }
        if let Some(value) = entries.get("max_restarts") {
            if let Some(max) = value.as_int() {
                spec.max_restarts = max.max(0) as u32;
            }
        }
        if let Some(value) = entries.get("restart_window") {
            if let Some(seconds) = value.as_float() {
                spec.restart_window = Duration::from_secs_f64(seconds.max(0.0));
            }
        }
        Ok(spec)
    }
}

struct ChildEntry {
    spec: ChildSpec,
    current: Option<Pid>,
}

/// One supervisor: its children in start order and restart bookkeeping.
pub struct Supervisor {
    /// The supervising process
    pub pid: Pid,
    /// Restart strategy
    pub strategy: RestartStrategy,
    /// Default restart budget applied to specs
    pub max_restarts: u32,
    /// Default restart window applied to specs
    pub restart_window: Duration,
    children: Vec<ChildEntry>,
    histories: HashMap<String, VecDeque<Instant>>,
}

impl Supervisor {
    /// Create an empty supervisor for a process.
    pub fn new(pid: Pid, strategy: RestartStrategy) -> Self {
        Supervisor {
            pid,
            strategy,
            max_restarts: 3,
            restart_window: Duration::from_secs(5),
            children: Vec::new(),
            histories: HashMap::new(),
        }
    }

    /// Record a restart in the spec's sliding window. Returns true while
    /// the restart budget holds.
    fn record_restart(&mut self, spec: &ChildSpec) -> bool {
        let history = self.histories.entry(spec.id.clone()).or_default();
        let now = Instant::now();
        while let Some(&oldest) = history.front() {
            if now.duration_since(oldest) > spec.restart_window {
                history.pop_front();
            } else {
                break;
            }
        }
        history.push_back(now);
        history.len() as u32 <= spec.max_restarts
    }

    fn child_index(&self, id: &str) -> Option<usize> {
        self.children.iter().position(|entry| entry.spec.id == id)
    }

    fn index_of_pid(&self, pid: Pid) -> Option<usize> {
        self.children
            .iter()
            .position(|entry| entry.current == Some(pid))
    }
}

/// Shared registry of supervisors, consulted by the fault handler when a
/// process exits and by the supervisor opcodes.
pub struct SupervisorRegistry {
    table: Arc<ProcessTable>,
    links: Arc<LinkRegistry>,
    scheduler: Arc<Mutex<Scheduler>>,
    supervisors: Mutex<HashMap<Pid, Supervisor>>,
    by_child: Mutex<HashMap<Pid, Pid>>,
}

impl SupervisorRegistry {
    /// Create a registry over the shared runtime structures.
    pub fn new(
        table: Arc<ProcessTable>,
        links: Arc<LinkRegistry>,
        scheduler: Arc<Mutex<Scheduler>>,
    ) -> Self {
        SupervisorRegistry {
            table,
            links,
            scheduler,
            supervisors: Mutex::new(HashMap::new()),
            by_child: Mutex::new(HashMap::new()),
        }
    }

    /// Register a process as a supervisor if it is not one already.
    pub fn ensure(
        &self,
        pid: Pid,
        strategy: RestartStrategy,
        max_restarts: u32,
        restart_window: Duration,
    ) {
        let mut supervisors = self.supervisors.lock();
        supervisors.entry(pid).or_insert_with(|| {
            let mut supervisor = Supervisor::new(pid, strategy);
            supervisor.max_restarts = max_restarts;
            supervisor.restart_window = restart_window;
            supervisor
        });
    }

    /// Whether a process is a supervisor.
    pub fn is_supervisor(&self, pid: Pid) -> bool {
        self.supervisors.lock().contains_key(&pid)
    }

    /// The supervisor of a child, if any.
    pub fn supervisor_of(&self, child: Pid) -> Option<Pid> {
        self.by_child.lock().get(&child).copied()
    }

    /// Create a child from its spec, link it to the supervisor and record
    /// it. Returns the new child's address.
    pub fn add_child(&self, supervisor: Pid, spec: ChildSpec) -> VmResult<Pid> {
        let mut supervisors = self.supervisors.lock();
        let entry = supervisors
            .get_mut(&supervisor)
            .ok_or(SupervisionError::NotASupervisor(supervisor))?;
        let child = self.start_from_spec(supervisor, &spec)?;
        match entry.child_index(&spec.id) {
            Some(index) => {
                entry.children[index].spec = spec;
                entry.children[index].current = Some(child);
            }
            None => entry.children.push(ChildEntry {
                spec,
                current: Some(child),
            }),
        }
        self.by_child.lock().insert(child, supervisor);
        Ok(child)
    }

    /// React to a child's exit.
    ///
    /// Returns follow-up exits (children terminated by strategy, or the
    /// supervisor itself when shutting down) for the fault handler to fan
    /// out; they are already detached here so they do not re-enter this
    /// path as supervised exits.
    pub fn handle_child_exit(&self, child: Pid, reason: &ExitReason) -> Vec<(Pid, ExitReason)> {
        let Some(supervisor_pid) = self.by_child.lock().remove(&child) else {
            return Vec::new();
        };
        let mut supervisors = self.supervisors.lock();
        let Some(supervisor) = supervisors.get_mut(&supervisor_pid) else {
            return Vec::new();
        };
        let Some(failed_index) = supervisor.index_of_pid(child) else {
            return Vec::new();
        };
        supervisor.children[failed_index].current = None;

        let spec = supervisor.children[failed_index].spec.clone();
        let should_restart = match spec.restart {
            RestartPolicy::Permanent => true,
            RestartPolicy::Transient => !reason.is_normal(),
            RestartPolicy::Temporary => false,
        };
        if !should_restart {
            debug!(
                supervisor = supervisor_pid.raw(),
                child = %spec.id,
                "not restarting child"
            );
            return Vec::new();
        }

        if !supervisor.record_restart(&spec) {
            warn!(
                supervisor = supervisor_pid.raw(),
                child = %spec.id,
                "restart limit exceeded"
            );
            return match supervisor.strategy {
                RestartStrategy::OneForOne | RestartStrategy::SimpleOneForOne => Vec::new(),
                RestartStrategy::OneForAll | RestartStrategy::RestForOne => {
                    // The supervisor itself goes down, taking the rest of
                    // its children with it.
                    let mut exits = self.terminate_range(supervisor, 0);
                    exits.push((supervisor_pid, ExitReason::Shutdown));
                    exits
                }
            };
        }

        match supervisor.strategy {
            RestartStrategy::OneForOne | RestartStrategy::SimpleOneForOne => {
                self.restart_range(supervisor, supervisor_pid, failed_index, failed_index + 1);
                Vec::new()
            }
            RestartStrategy::OneForAll => {
                let exits = self.terminate_range(supervisor, 0);
                let end = supervisor.children.len();
                self.restart_range(supervisor, supervisor_pid, 0, end);
                exits
            }
            RestartStrategy::RestForOne => {
                let exits = self.terminate_range(supervisor, failed_index);
                let end = supervisor.children.len();
                self.restart_range(supervisor, supervisor_pid, failed_index, end);
                exits
            }
        }
    }

    /// Stop a child by id, honoring its shutdown policy. Returns follow-up
    /// exits for the fault handler.
    pub fn stop_child(
        &self,
        supervisor_pid: Pid,
        id: &str,
    ) -> Result<Vec<(Pid, ExitReason)>, SupervisionError> {
        let mut supervisors = self.supervisors.lock();
        let supervisor = supervisors
            .get_mut(&supervisor_pid)
            .ok_or(SupervisionError::NotASupervisor(supervisor_pid))?;
        let index = supervisor
            .child_index(id)
            .ok_or_else(|| SupervisionError::UnknownChild(id.to_string()))?;
        let Some(child) = supervisor.children[index].current.take() else {
            return Ok(Vec::new());
        };
        self.by_child.lock().remove(&child);
        let shutdown = supervisor.children[index].spec.shutdown;
        Ok(self.terminate_child(child, shutdown))
    }

    /// Restart a child by id: stop it if running, then start it afresh.
    pub fn restart_child(
        &self,
        supervisor_pid: Pid,
        id: &str,
    ) -> Result<(Pid, Vec<(Pid, ExitReason)>), SupervisionError> {
        let exits = self.stop_child(supervisor_pid, id)?;
        let mut supervisors = self.supervisors.lock();
        let supervisor = supervisors
            .get_mut(&supervisor_pid)
            .ok_or(SupervisionError::NotASupervisor(supervisor_pid))?;
        let index = supervisor
            .child_index(id)
            .ok_or_else(|| SupervisionError::UnknownChild(id.to_string()))?;
        let spec = supervisor.children[index].spec.clone();
        match self.start_from_spec(supervisor_pid, &spec) {
            Ok(child) => {
                supervisor.children[index].current = Some(child);
                self.by_child.lock().insert(child, supervisor_pid);
                Ok((child, exits))
            }
            Err(err) => {
                warn!(child = id, error = %err, "restart failed");
                Err(SupervisionError::InvalidChildSpec(format!(
                    "restart of {} failed: {}",
                    id, err
                )))
            }
        }
    }

    /// Describe the children of a supervisor for `LIST_CHILDREN`.
    pub fn list_children(&self, supervisor_pid: Pid) -> Option<Value> {
        let supervisors = self.supervisors.lock();
        let supervisor = supervisors.get(&supervisor_pid)?;
        let children = supervisor
            .children
            .iter()
            .map(|entry| {
                Value::map_from(vec![
                    ("id", Value::Str(entry.spec.id.clone())),
                    (
                        "pid",
                        entry
                            .current
                            .map(|p| Value::Uint(p.raw()))
                            .unwrap_or(Value::Null),
                    ),
                    (
                        "type",
                        Value::Symbol(
                            match entry.spec.child_type {
                                ChildType::Worker => "worker",
                                ChildType::Supervisor => "supervisor",
                            }
                            .to_string(),
                        ),
                    ),
                    (
                        "alive",
                        Value::Bool(
                            entry
                                .current
                                .map(|p| self.table.is_alive(p))
                                .unwrap_or(false),
                        ),
                    ),
                ])
            })
            .collect();
        Some(Value::Array(children))
    }

    /// Child counts for `COUNT_CHILDREN`.
    pub fn count_children(&self, supervisor_pid: Pid) -> Option<Value> {
        let supervisors = self.supervisors.lock();
        let supervisor = supervisors.get(&supervisor_pid)?;
        let specs = supervisor.children.len() as u64;
        let active = supervisor
            .children
            .iter()
            .filter(|entry| {
                entry
                    .current
                    .map(|p| self.table.is_alive(p))
                    .unwrap_or(false)
            })
            .count() as u64;
        let workers = supervisor
            .children
            .iter()
            .filter(|entry| entry.spec.child_type == ChildType::Worker)
            .count() as u64;
        Some(Value::map_from(vec![
            ("specs", Value::Uint(specs)),
            ("active", Value::Uint(active)),
            ("workers", Value::Uint(workers)),
            ("supervisors", Value::Uint(specs - workers)),
        ]))
    }

    /// Remove a dead supervisor's bookkeeping.
    pub fn remove_supervisor(&self, pid: Pid) {
        if let Some(supervisor) = self.supervisors.lock().remove(&pid) {
            let mut by_child = self.by_child.lock();
            for entry in &supervisor.children {
                if let Some(child) = entry.current {
                    by_child.remove(&child);
                }
            }
        }
    }

    fn start_from_spec(&self, supervisor: Pid, spec: &ChildSpec) -> VmResult<Pid> {
        let child = self.table.create(
            spec.instructions.clone(),
            spec.subroutines.clone(),
            spec.globals.clone(),
            Priority::Normal,
            Some(supervisor),
        )?;
        self.links.link(supervisor, child);
        self.scheduler.lock().enqueue(child);
        debug!(supervisor = supervisor.raw(), child = child.raw(), id = %spec.id, "started child");
        Ok(child)
    }

    /// Terminate every running child from `from` onward, in reverse start
    /// order, detaching them first so their exits are not treated as
    /// supervised failures.
    fn terminate_range(&self, supervisor: &mut Supervisor, from: usize) -> Vec<(Pid, ExitReason)> {
        let mut exits = Vec::new();
        for index in (from..supervisor.children.len()).rev() {
            if let Some(child) = supervisor.children[index].current.take() {
                self.by_child.lock().remove(&child);
                let shutdown = supervisor.children[index].spec.shutdown;
                exits.extend(self.terminate_child(child, shutdown));
            }
        }
        exits
    }

    /// Restart children in `[from, to)` in start order.
    fn restart_range(&self, supervisor: &mut Supervisor, supervisor_pid: Pid, from: usize, to: usize) {
        for index in from..to {
            if supervisor.children[index].current.is_some() {
                continue;
            }
            let spec = supervisor.children[index].spec.clone();
            match self.start_from_spec(supervisor_pid, &spec) {
                Ok(child) => {
                    supervisor.children[index].current = Some(child);
                    self.by_child.lock().insert(child, supervisor_pid);
                }
                Err(err) => {
                    warn!(child = %spec.id, error = %err, "could not restart child");
                }
            }
        }
    }

    /// Take one child down per its shutdown policy, returning the exit the
    /// fault handler must fan out.
    fn terminate_child(&self, child: Pid, shutdown: ShutdownPolicy) -> Vec<(Pid, ExitReason)> {
        match shutdown {
            ShutdownPolicy::Brutal => {
                if let Some(handle) = self.table.get(child) {
                    handle.write().mark_dead(ExitReason::Kill);
                }
                vec![(child, ExitReason::Kill)]
            }
            ShutdownPolicy::Timeout(limit) => {
                self.request_shutdown(child);
                let deadline = Instant::now() + limit;
                while Instant::now() < deadline {
                    if !self.table.is_alive(child) {
                        return Vec::new();
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                if let Some(handle) = self.table.get(child) {
                    handle.write().mark_dead(ExitReason::Kill);
                }
                vec![(child, ExitReason::Kill)]
            }
            ShutdownPolicy::Infinity => {
                self.request_shutdown(child);
                while self.table.is_alive(child) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Vec::new()
            }
        }
    }

    fn request_shutdown(&self, child: Pid) {
        let message = Message::new(
            child,
            Value::map_from(vec![(
                "signal",
                Value::Str("shutdown".to_string()),
            )]),
        );
        if let Some(mailbox) = self.table.mailbox(child) {
            mailbox.lock().push(message.clone());
        }
        self.scheduler.lock().notify_message_delivered(child, &message);
    }
}
