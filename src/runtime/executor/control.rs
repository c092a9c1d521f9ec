//! Control-flow opcodes: jumps, calls, returns

use crate::bytecode::{Instruction, Opcode, Value};
use crate::error::{ExecError, ExecResult};
use crate::runtime::executor::Executor;
use crate::runtime::process::{CallFrame, ProcessContext, SavedFrame};
use crate::types::ExitReason;

impl Executor {
    pub(super) fn exec_control(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        let op = instruction.opcode.name();
        match instruction.opcode {
            Opcode::Nop => {}
            Opcode::Halt => {
                process.mark_dead(ExitReason::Normal);
            }
            Opcode::Jump => {
                // Absolute: sets the counter directly, no pre-increment
                let target = validate_target(&instruction.operand, process)?;
                process.ip = target;
            }
            Opcode::JumpForward | Opcode::JumpBackward => {
                let offset = Self::value_as_index(&instruction.operand, "jump offset")? as i64;
                let address = process.ip as i64 - 1;
                let target = if instruction.opcode == Opcode::JumpForward {
                    address + offset
                } else {
                    address - offset
                };
                if target < 0 || target as usize >= process.instructions.len() {
                    return Err(ExecError::InvalidJumpTarget {
                        target,
                        len: process.instructions.len(),
                    });
                }
                process.ip = target as usize;
            }
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                let target = validate_target(&instruction.operand, process)?;
                let condition = process.pop_value(op)?.is_truthy();
                let jump = if instruction.opcode == Opcode::JumpIfTrue {
                    condition
                } else {
                    !condition
                };
                if jump {
                    process.ip = target;
                }
            }
            Opcode::JumpIfTruePeek | Opcode::JumpIfFalsePeek => {
                let target = validate_target(&instruction.operand, process)?;
                process.require_depth(1, op)?;
                let condition = process.stack[process.stack.len() - 1].is_truthy();
                let jump = if instruction.opcode == Opcode::JumpIfTruePeek {
                    condition
                } else {
                    !condition
                };
                if jump {
                    process.ip = target;
                }
            }
            Opcode::Call => {
                let name = Self::value_as_name(&instruction.operand, "subroutine name")?;
                self.call_subroutine(process, &name)?;
            }
            Opcode::CallDynamic => {
                let popped = process.pop_value(op)?;
                let name = Self::value_as_name(&popped, "subroutine name")?;
                self.call_subroutine(process, &name)?;
            }
            Opcode::CallIndirect => {
                let callee = process.pop_value(op)?;
                self.call_indirect(process, callee)?;
            }
            Opcode::CallBuiltin => {
                self.call_builtin(process, instruction)?;
            }
            Opcode::Return | Opcode::ReturnValue => {
                self.do_return(process)?;
            }
            _ => unreachable!("non-control opcode routed to exec_control"),
        }
        Ok(Value::Null)
    }

    fn call_subroutine(&self, process: &mut ProcessContext, name: &str) -> ExecResult<()> {
        let subroutine = process
            .subroutines
            .get(name)
            .cloned()
            .ok_or_else(|| ExecError::UndefinedSubroutine(name.to_string()))?;
        process.call_stack.push(CallFrame {
            return_ip: process.ip,
            saved_frame_pointer: process.frame_pointer,
            saved_locals_len: process.locals.len(),
            function: Some(name.to_string()),
        });
        process.frame_pointer = process.locals.len();
        process.ip = subroutine.start;
        Ok(())
    }

    /// Switch execution to a popped code block or lambda, saving the
    /// current instructions for restore on return. The call stack and the
    /// saved-instructions stack move in lock-step here.
    fn call_indirect(&self, process: &mut ProcessContext, callee: Value) -> ExecResult<()> {
        let (code, closure, saved_globals) = match callee {
            Value::Instructions(code) => (code, None, Vec::new()),
            Value::Lambda(lambda) => {
                let mut saved = Vec::new();
                for (name, value) in &lambda.captured {
                    saved.push((name.clone(), process.globals.insert(name.clone(), value.clone())));
                }
                (lambda.instructions.clone(), Some(lambda), saved)
            }
            other => {
                return Err(ExecError::TypeMismatch(format!(
                    "CALL_INDIRECT expects instructions or a lambda, got {}",
                    other.type_name()
                )))
            }
        };
        process.call_stack.push(CallFrame {
            return_ip: process.ip,
            saved_frame_pointer: process.frame_pointer,
            saved_locals_len: process.locals.len(),
            function: None,
        });
        let at_call_depth = process.call_stack.len();
        let caller_code = std::mem::replace(&mut process.instructions, code);
        let caller_closure = std::mem::replace(&mut process.current_closure, closure);
        process.saved_instructions.push(SavedFrame {
            at_call_depth,
            instructions: caller_code,
            closure: caller_closure,
            saved_globals,
        });
        process.end_of_main = process.instructions.len();
        process.frame_pointer = process.locals.len();
        process.ip = 0;
        Ok(())
    }

    /// Pop the call stack; restore saved instructions when this return
    /// pairs with an indirect call. An empty call stack terminates the
    /// process cleanly.
    pub(super) fn do_return(&self, process: &mut ProcessContext) -> ExecResult<()> {
        let Some(frame) = process.call_stack.pop() else {
            process.mark_dead(ExitReason::Normal);
            return Ok(());
        };
        let depth_before_pop = process.call_stack.len() + 1;
        let pairs_with_indirect = process
            .saved_instructions
            .last()
            .map(|saved| saved.at_call_depth == depth_before_pop)
            .unwrap_or(false);
        if pairs_with_indirect {
            if let Some(saved) = process.saved_instructions.pop() {
                process.instructions = saved.instructions;
                process.end_of_main = process.instructions.len();
                process.current_closure = saved.closure;
                for (name, previous) in saved.saved_globals.into_iter().rev() {
                    match previous {
                        Some(value) => {
                            process.globals.insert(name, value);
                        }
                        None => {
                            process.globals.remove(&name);
                        }
                    }
                }
            }
        }
        process.locals.truncate(frame.saved_locals_len);
        process.frame_pointer = frame.saved_frame_pointer;
        process.ip = frame.return_ip;
        Ok(())
    }

    fn call_builtin(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<()> {
        let op = instruction.opcode.name();
        let (module, function, arity) = parse_builtin_key(&instruction.operand)?;
        process.require_depth(arity, op)?;
        // Arguments are popped right to left
        let mut args = vec![Value::Null; arity];
        for slot in (0..arity).rev() {
            args[slot] = process.pop_value(op)?;
        }
        let result = self.builtins.call(&module, &function, &args)?;
        process.push_value(result, self.config.max_stack_size)?;
        Ok(())
    }
}

fn validate_target(operand: &Value, process: &ProcessContext) -> ExecResult<usize> {
    let target = match operand {
        Value::Int(i) => *i,
        Value::Uint(u) => *u as i64,
        other => {
            return Err(ExecError::InvalidInstruction(format!(
                "jump target must be an integer, got {}",
                other.type_name()
            )))
        }
    };
    if target < 0 || target as usize >= process.instructions.len() {
        return Err(ExecError::InvalidJumpTarget {
            target,
            len: process.instructions.len(),
        });
    }
    Ok(target as usize)
}

fn parse_builtin_key(operand: &Value) -> ExecResult<(String, String, usize)> {
    match operand {
        Value::Array(parts) if parts.len() == 3 => {
            let module = Executor::value_as_name(&parts[0], "builtin module")?;
            let function = Executor::value_as_name(&parts[1], "builtin function")?;
            let arity = Executor::value_as_index(&parts[2], "builtin arity")?;
            Ok((module, function, arity))
        }
        Value::Map(entries) => {
            let module = entries
                .get("module")
                .map(|v| Executor::value_as_name(v, "builtin module"))
                .transpose()?
                .ok_or_else(|| {
                    ExecError::InvalidInstruction("builtin key missing module".to_string())
                })?;
            let function = entries
                .get("function")
                .map(|v| Executor::value_as_name(v, "builtin function"))
                .transpose()?
                .ok_or_else(|| {
                    ExecError::InvalidInstruction("builtin key missing function".to_string())
                })?;
            let arity = entries
                .get("arity")
                .map(|v| Executor::value_as_index(v, "builtin arity"))
                .transpose()?
                .unwrap_or(0);
            Ok((module, function, arity))
        }
        other => Err(ExecError::InvalidInstruction(format!(
            "CALL_BUILT_IN expects a (module, function, arity) operand, got {}",
            other.type_name()
        ))),
    }
}
