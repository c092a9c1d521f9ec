//! Exception opcodes and the unwind path

use crate::bytecode::{Instruction, Opcode, Value};
use crate::error::{ExecError, ExecResult};
use crate::runtime::executor::Executor;
use crate::runtime::process::{HandlerFrame, ProcessContext};
use crate::types::ExitReason;

impl Executor {
    pub(super) fn exec_exception(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        let op = instruction.opcode.name();
        match instruction.opcode {
            Opcode::TryBegin => {
                let offset = Self::value_as_index(&instruction.operand, "handler offset")?;
                let catch_ip = process.ip + offset;
                if catch_ip >= process.instructions.len() {
                    return Err(ExecError::InvalidJumpTarget {
                        target: catch_ip as i64,
                        len: process.instructions.len(),
                    });
                }
                process.exception_handlers.push(HandlerFrame {
                    catch_ip,
                    stack_len: process.stack.len(),
                    call_stack_len: process.call_stack.len(),
                    saved_instructions_len: process.saved_instructions.len(),
                    locals_len: process.locals.len(),
                    frame_pointer: process.frame_pointer,
                });
            }
            Opcode::TryEnd => {
                if process.exception_handlers.pop().is_none() {
                    return Err(ExecError::Runtime(
                        "TRY_END without an installed handler".to_string(),
                    ));
                }
            }
            Opcode::Throw => {
                let value = process.pop_value(op)?;
                let exception = self.shape_exception(process, value);
                self.throw_value(process, exception);
            }
            Opcode::Rethrow => {
                let exception = process.current_exception.clone().ok_or_else(|| {
                    ExecError::Runtime("RETHROW with no current exception".to_string())
                })?;
                self.throw_value(process, exception);
            }
            Opcode::Catch => {
                // Marks the catch-block entry: the exception value the
                // unwind pushed is recorded as current
                process.require_depth(1, op)?;
                process.current_exception =
                    Some(process.stack[process.stack.len() - 1].clone());
            }
            Opcode::GetStacktrace => {
                let trace = stacktrace_value(process);
                process.push_value(trace, self.config.max_stack_size)?;
            }
            _ => unreachable!("non-exception opcode routed to exec_exception"),
        }
        Ok(Value::Null)
    }

    /// Route an execution error through the exception machinery: unwind to
    /// the innermost handler, or kill the process with reason `Exception`.
    pub(crate) fn raise(&self, process: &mut ProcessContext, err: ExecError) {
        let exception = build_exception_value(process, &err);
        self.throw_value(process, exception);
    }

    /// Throw an already-shaped exception value.
    pub(super) fn throw_value(&self, process: &mut ProcessContext, exception: Value) {
        if process.exception_handlers.is_empty() {
            process.mark_dead(ExitReason::Exception(exception));
            self.fault
                .notify_exit(process.pid, process.exit_reason.clone().unwrap_or(ExitReason::Normal));
            return;
        }
        self.unwind(process, exception);
    }

    /// Unwind to the topmost handler frame, restoring every snapshotted
    /// depth. Saved-instruction frames above the handler's depth are
    /// popped (restoring the instructions and globals active at install
    /// time) so the call stack and saved-instructions stack stay paired.
    fn unwind(&self, process: &mut ProcessContext, exception: Value) {
        let Some(handler) = process.exception_handlers.pop() else {
            return;
        };

        if process.saved_instructions.len() > handler.saved_instructions_len {
            let popped: Vec<_> = process
                .saved_instructions
                .drain(handler.saved_instructions_len..)
                .collect();
            for frame in popped.iter().rev() {
                for (name, previous) in frame.saved_globals.iter().rev() {
                    match previous {
                        Some(value) => {
                            process.globals.insert(name.clone(), value.clone());
                        }
                        None => {
                            process.globals.remove(name);
                        }
                    }
                }
            }
            if let Some(outermost) = popped.into_iter().next() {
                process.instructions = outermost.instructions;
                process.end_of_main = process.instructions.len();
                process.current_closure = outermost.closure;
            }
        }

        process.stack.truncate(handler.stack_len);
        process.call_stack.truncate(handler.call_stack_len);
        process.locals.truncate(handler.locals_len);
        process.frame_pointer = handler.frame_pointer;
        process.stack.push(exception.clone());
        process.current_exception = Some(exception);
        process.ip = handler.catch_ip;
    }

    /// Wrap a thrown value into the structured exception shape unless it
    /// already is one.
    pub(super) fn shape_exception(&self, process: &ProcessContext, value: Value) -> Value {
        if let Value::Map(entries) = &value {
            if entries.get("type") == Some(&Value::Symbol("exception".to_string())) {
                return value;
            }
        }
        let message = match &value {
            Value::Map(entries) => match entries.get("message") {
                Some(Value::Str(message)) => message.clone(),
                _ => value.to_string(),
            },
            Value::Str(message) => message.clone(),
            other => other.to_string(),
        };
        Value::map_from(vec![
            ("type", Value::Symbol("exception".to_string())),
            ("message", Value::Str(message)),
            ("error", value),
            ("stacktrace", stacktrace_value(process)),
            ("process", Value::Uint(process.pid.raw())),
            ("counter", Value::Uint(process.ip as u64)),
        ])
    }
}

/// Build the structured exception value for a host-raised error.
pub(super) fn build_exception_value(process: &ProcessContext, err: &ExecError) -> Value {
    Value::map_from(vec![
        ("type", Value::Symbol("exception".to_string())),
        ("message", Value::Str(err.to_string())),
        ("error", Value::Str(err.kind().to_string())),
        ("stacktrace", stacktrace_value(process)),
        ("process", Value::Uint(process.pid.raw())),
        ("counter", Value::Uint(process.ip as u64)),
    ])
}

/// Frames for the current counter and each call-stack entry.
pub(super) fn stacktrace_value(process: &ProcessContext) -> Value {
    let mut frames = Vec::new();
    frames.push(frame_value(process, process.ip, None));
    for frame in process.call_stack.iter().rev() {
        frames.push(frame_value(process, frame.return_ip, frame.function.clone()));
    }
    Value::Array(frames)
}

fn frame_value(process: &ProcessContext, address: usize, function: Option<String>) -> Value {
    let opcode_name = process
        .instructions
        .get(address)
        .or_else(|| process.instructions.get(address.saturating_sub(1)))
        .map(|instruction| instruction.opcode.name().to_string())
        .unwrap_or_else(|| "END".to_string());
    let mut pairs = vec![
        ("address", Value::Uint(address as u64)),
        ("instruction", Value::Str(opcode_name)),
    ];
    if let Some(function) = function {
        pairs.push(("function", Value::Str(function)));
    }
    Value::map_from(pairs)
}
