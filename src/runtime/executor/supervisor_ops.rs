//! Supervisor management opcodes
//!
//! A process becomes a supervisor the first time it starts a child; its
//! strategy and restart budget are read from the process flags at that
//! moment (`supervisor_strategy`, `supervisor_max_restarts`,
//! `supervisor_restart_window`).

use std::time::Duration;

use crate::bytecode::{Instruction, Opcode, Value};
use crate::error::{ExecError, ExecResult};
use crate::runtime::executor::Executor;
use crate::runtime::process::ProcessContext;
use crate::runtime::supervisor::{ChildSpec, RestartStrategy};

impl Executor {
    pub(super) fn exec_supervisor(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        let op = instruction.opcode.name();
        let max = self.config.max_stack_size;
        match instruction.opcode {
            Opcode::StartChild => {
                let spec_value = process.pop_value(op)?;
                let spec = ChildSpec::from_value(&spec_value)
                    .map_err(|err| ExecError::Value(err.to_string()))?;
                self.ensure_supervisor(process);
                let child = self
                    .supervisors
                    .add_child(process.pid, spec)
                    .map_err(|err| ExecError::Runtime(err.to_string()))?;
                process.push_value(Value::Uint(child.raw()), max)?;
            }
            Opcode::StopChild => {
                let id_value = process.pop_value(op)?;
                let id = Self::value_as_name(&id_value, "child id")?;
                match self.supervisors.stop_child(process.pid, &id) {
                    Ok(exits) => {
                        for (target, reason) in exits {
                            self.fault.notify_exit(target, reason);
                        }
                        process.push_value(Value::Bool(true), max)?;
                    }
                    Err(err) => {
                        tracing::debug!(child = %id, error = %err, "stop child failed");
                        process.push_value(Value::Bool(false), max)?;
                    }
                }
            }
            Opcode::RestartChild => {
                let id_value = process.pop_value(op)?;
                let id = Self::value_as_name(&id_value, "child id")?;
                match self.supervisors.restart_child(process.pid, &id) {
                    Ok((child, exits)) => {
                        for (target, reason) in exits {
                            self.fault.notify_exit(target, reason);
                        }
                        process.push_value(Value::Uint(child.raw()), max)?;
                    }
                    Err(err) => {
                        tracing::debug!(child = %id, error = %err, "restart child failed");
                        process.push_value(Value::Null, max)?;
                    }
                }
            }
            Opcode::ListChildren => {
                let listing = self
                    .supervisors
                    .list_children(process.pid)
                    .unwrap_or(Value::Array(Vec::new()));
                process.push_value(listing, max)?;
            }
            Opcode::CountChildren => {
                let counts = self.supervisors.count_children(process.pid).unwrap_or_else(|| {
                    Value::map_from(vec![
                        ("specs", Value::Uint(0)),
                        ("active", Value::Uint(0)),
                        ("workers", Value::Uint(0)),
                        ("supervisors", Value::Uint(0)),
                    ])
                });
                process.push_value(counts, max)?;
            }
            _ => unreachable!("non-supervisor opcode routed to exec_supervisor"),
        }
        Ok(Value::Null)
    }

    fn ensure_supervisor(&self, process: &ProcessContext) {
        let strategy = process
            .flags
            .get("supervisor_strategy")
            .and_then(|value| match value {
                Value::Symbol(name) | Value::Str(name) => RestartStrategy::parse(name),
                _ => None,
            })
            .unwrap_or(RestartStrategy::OneForOne);
        let max_restarts = process
            .flags
            .get("supervisor_max_restarts")
            .and_then(|value| value.as_int())
            .map(|max| max.max(0) as u32)
            .unwrap_or(3);
        let restart_window = process
            .flags
            .get("supervisor_restart_window")
            .and_then(|value| value.as_float())
            .map(|seconds| Duration::from_secs_f64(seconds.max(0.0)))
            .unwrap_or(Duration::from_secs(5));
        self.supervisors
            .ensure(process.pid, strategy, max_restarts, restart_window);
    }
}
