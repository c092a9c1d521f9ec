//! Process lifecycle, link/monitor and registry opcodes

use std::collections::HashMap;

use tracing::debug;

use crate::bytecode::{Instruction, Opcode, Value};
use crate::error::{ExecError, ExecResult, VmError};
use crate::runtime::executor::Executor;
use crate::runtime::process::{ProcessContext, WaitKind};
use crate::types::{ExitReason, Pid};

impl Executor {
    pub(super) fn exec_process(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        let op = instruction.opcode.name();
        let max = self.config.max_stack_size;
        match instruction.opcode {
            Opcode::Spawn | Opcode::SpawnLinked | Opcode::SpawnMonitored => {
                let callee = process.pop_value(op)?;
                let child = self.spawn_from_value(process, callee)?;
                match instruction.opcode {
                    Opcode::SpawnLinked => {
                        self.links.link(process.pid, child);
                    }
                    Opcode::SpawnMonitored => {
                        let reference = self.links.monitor(process.pid, child);
                        self.scheduler.lock().enqueue(child);
                        process.push_value(Value::Uint(child.raw()), max)?;
                        process.push_value(Value::MonitorRef(reference), max)?;
                        return Ok(Value::Null);
                    }
                    _ => {}
                }
                self.scheduler.lock().enqueue(child);
                process.push_value(Value::Uint(child.raw()), max)?;
            }
            Opcode::SelfPid => {
                process.push_value(Value::Uint(process.pid.raw()), max)?;
            }
            Opcode::Exit => {
                let reason_value = process.pop_value(op)?;
                let reason = exit_reason_from_value(reason_value);
                process.mark_dead(reason.clone());
                self.fault.notify_exit(process.pid, reason);
            }
            Opcode::ExitRemote => {
                let reason_value = process.pop_value(op)?;
                let target_value = process.pop_value(op)?;
                let target = self.resolve_address(&target_value)?;
                let reason = exit_reason_from_value(reason_value);
                self.fault.exit_process(process.pid, target, reason);
            }
            Opcode::Kill => {
                let target_value = process.pop_value(op)?;
                let target = self.resolve_address(&target_value)?;
                if target == process.pid {
                    process.mark_dead(ExitReason::Kill);
                } else if let Some(handle) = self.table.get(target) {
                    handle.write().mark_dead(ExitReason::Kill);
                }
                self.fault.notify_exit(target, ExitReason::Kill);
            }
            Opcode::Sleep => {
                let duration_value = self.operand_or_pop(process, instruction)?;
                let duration = Self::value_as_seconds(&duration_value, "sleep duration")?;
                process.park_receiving(WaitKind::Sleep, Some(duration));
            }
            Opcode::Yield => {
                process.yielded = true;
            }
            Opcode::Link => {
                let target_value = process.pop_value(op)?;
                let target = self.resolve_address(&target_value)?;
                if target == process.pid || self.table.is_alive(target) {
                    self.links.link(process.pid, target);
                } else if process.traps_exits() {
                    // Posting a DOWN to our own mailbox stands in for the
                    // exit signal a live link would have produced
                    let down = Value::map_from(vec![
                        ("signal", Value::Str("DOWN".to_string())),
                        ("ref", Value::Null),
                        ("process", Value::Uint(target.raw())),
                        ("reason", Value::Symbol("invalid_process".to_string())),
                    ]);
                    self.push_to_own_mailbox(process, down);
                } else {
                    process.mark_dead(ExitReason::InvalidProcess);
                    self.fault
                        .notify_exit(process.pid, ExitReason::InvalidProcess);
                }
            }
            Opcode::Unlink => {
                let target_value = process.pop_value(op)?;
                let target = self.resolve_address(&target_value)?;
                self.links.unlink(process.pid, target);
            }
            Opcode::Monitor => {
                let target_value = process.pop_value(op)?;
                let target = self.resolve_address(&target_value)?;
                let reference = self.links.monitor(process.pid, target);
                if target != process.pid && !self.table.is_alive(target) {
                    let down = Value::map_from(vec![
                        ("signal", Value::Str("DOWN".to_string())),
                        ("ref", Value::Uint(reference.id)),
                        ("process", Value::Uint(target.raw())),
                        ("reason", Value::Symbol("invalid_process".to_string())),
                    ]);
                    self.push_to_own_mailbox(process, down);
                    // The DOWN fired; the monitor must never fire again
                    self.links.demonitor(&reference);
                }
                process.push_value(Value::MonitorRef(reference), max)?;
            }
            Opcode::Demonitor => {
                let reference_value = process.pop_value(op)?;
                let Value::MonitorRef(reference) = reference_value else {
                    return Err(ExecError::TypeMismatch(format!(
                        "DEMONITOR expects a monitor reference, got {}",
                        reference_value.type_name()
                    )));
                };
                self.links.demonitor(&reference);
            }
            Opcode::TrapExitEnable | Opcode::TrapExitDisable => {
                let enabled = instruction.opcode == Opcode::TrapExitEnable;
                // The registry is the source of truth; the flag mirrors it
                self.links.trap_exit(process.pid, enabled);
                process
                    .flags
                    .insert("trap_exit".to_string(), Value::Bool(enabled));
            }
            Opcode::IsAlive => {
                let target_value = process.pop_value(op)?;
                let alive = match self.resolve_address(&target_value) {
                    Ok(target) => target == process.pid || self.table.is_alive(target),
                    Err(_) => false,
                };
                process.push_value(Value::Bool(alive), max)?;
            }
            Opcode::GetInfo => {
                let target_value = process.pop_value(op)?;
                let info = self.process_info(process, &target_value)?;
                process.push_value(info, max)?;
            }
            Opcode::Register => {
                let name_value = process.pop_value(op)?;
                let name = Self::value_as_name(&name_value, "registered name")?;
                let registered = self.registry.register(&name, process.pid);
                if registered {
                    process.registered_name = Some(name);
                }
                process.push_value(Value::Bool(registered), max)?;
            }
            Opcode::Unregister => {
                let name_value = process.pop_value(op)?;
                let name = Self::value_as_name(&name_value, "registered name")?;
                let removed = self.registry.unregister(&name);
                if process.registered_name.as_deref() == Some(name.as_str()) {
                    process.registered_name = None;
                }
                process.push_value(Value::Bool(removed), max)?;
            }
            Opcode::Whereis => {
                let name_value = process.pop_value(op)?;
                let name = Self::value_as_name(&name_value, "registered name")?;
                let found = self
                    .registry
                    .whereis(&name)
                    .map(|pid| Value::Uint(pid.raw()))
                    .unwrap_or(Value::Null);
                process.push_value(found, max)?;
            }
            Opcode::SetFlag => {
                let value = process.pop_value(op)?;
                let name_value = process.pop_value(op)?;
                let name = Self::value_as_name(&name_value, "flag name")?;
                if name == "trap_exit" {
                    self.links.trap_exit(process.pid, value.is_truthy());
                }
                process.flags.insert(name, value);
            }
            Opcode::GetFlag => {
                let name_value = process.pop_value(op)?;
                let name = Self::value_as_name(&name_value, "flag name")?;
                let value = process.flags.get(&name).cloned().unwrap_or(Value::Null);
                process.push_value(value, max)?;
            }
            _ => unreachable!("non-process opcode routed to exec_process"),
        }
        Ok(Value::Null)
    }

    /// Create a process from a popped code block or lambda. The child gets
    /// its own copies of the code and the parent's subroutines; a lambda's
    /// captures seed the child's globals.
    pub(super) fn spawn_from_value(
        &self,
        process: &ProcessContext,
        callee: Value,
    ) -> ExecResult<Pid> {
        let (main, globals) = match callee {
            Value::Instructions(code) => (code, HashMap::new()),
            Value::Lambda(lambda) => {
                let globals: HashMap<String, Value> = lambda
                    .captured
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                (lambda.instructions.clone(), globals)
            }
            other => {
                return Err(ExecError::TypeMismatch(format!(
                    "spawn expects instructions or a lambda, got {}",
                    other.type_name()
                )))
            }
        };
        let child = self
            .table
            .create(
                main,
                process.subroutine_code(),
                globals,
                process.priority,
                Some(process.pid),
            )
            .map_err(|err| match err {
                VmError::MaxProcesses(limit) => {
                    ExecError::Runtime(format!("process limit ({}) reached", limit))
                }
                other => ExecError::Runtime(other.to_string()),
            })?;
        self.stats.lock().processes_spawned += 1;
        debug!(parent = process.pid.raw(), child = child.raw(), "spawned process");
        Ok(child)
    }

    /// Deliver a runtime-generated message to the current process's own
    /// mailbox, bypassing the capacity policy dance.
    pub(super) fn push_to_own_mailbox(&self, process: &ProcessContext, value: Value) {
        let message = crate::runtime::mailbox::Message::new(process.pid, value);
        process.mailbox.lock().push(message);
        self.stats.lock().messages_delivered += 1;
    }

    fn process_info(
        &self,
        process: &ProcessContext,
        target_value: &Value,
    ) -> ExecResult<Value> {
        let target = if *target_value == Value::Null {
            process.pid
        } else {
            self.resolve_address(target_value)?
        };
        let mut info = if target == process.pid {
            process.info()
        } else {
            match self.table.get(target) {
                Some(handle) => handle.read().info(),
                None => return Ok(Value::Null),
            }
        };
        if let Value::Map(entries) = &mut info {
            entries.insert(
                "links".to_string(),
                Value::Array(
                    self.links
                        .get_links(target)
                        .into_iter()
                        .map(|pid| Value::Uint(pid.raw()))
                        .collect(),
                ),
            );
            entries.insert(
                "monitors".to_string(),
                Value::Array(
                    self.links
                        .monitors_of(target)
                        .into_iter()
                        .map(|reference| Value::Uint(reference.id))
                        .collect(),
                ),
            );
            entries.insert(
                "trap_exit".to_string(),
                Value::Bool(self.links.traps_exit(target)),
            );
        }
        Ok(info)
    }
}

/// Translate a popped reason value into an exit reason.
pub(super) fn exit_reason_from_value(value: Value) -> ExitReason {
    match &value {
        Value::Null => ExitReason::Normal,
        Value::Symbol(name) | Value::Str(name) => match name.as_str() {
            "normal" => ExitReason::Normal,
            "shutdown" => ExitReason::Shutdown,
            "kill" => ExitReason::Kill,
            _ => ExitReason::Custom(value),
        },
        _ => ExitReason::Custom(value),
    }
}
