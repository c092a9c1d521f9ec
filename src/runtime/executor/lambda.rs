//! Closure creation, invocation and partial application

use crate::bytecode::{Instruction, Lambda, Opcode, Value};
use crate::error::{ExecError, ExecResult};
use crate::runtime::executor::Executor;
use crate::runtime::process::ProcessContext;
use crate::types::ProcessState;

impl Executor {
    pub(super) fn exec_lambda(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        let op = instruction.opcode.name();
        match instruction.opcode {
            Opcode::LambdaCreate => {
                let lambda = self.create_lambda(process, &instruction.operand)?;
                process.push_value(Value::Lambda(lambda), self.config.max_stack_size)?;
            }
            Opcode::LambdaInvoke => {
                let argc = Self::value_as_index(&instruction.operand, "argument count")?;
                process.require_depth(argc + 1, op)?;
                let mut args = vec![Value::Null; argc];
                for slot in (0..argc).rev() {
                    args[slot] = process.pop_value(op)?;
                }
                let callee = process.pop_value(op)?;
                let Value::Lambda(lambda) = callee else {
                    return Err(ExecError::TypeMismatch(format!(
                        "LAMBDA_INVOKE expects a lambda, got {}",
                        callee.type_name()
                    )));
                };
                let result = self.run_inline(process, &lambda, args)?;
                process.push_value(result, self.config.max_stack_size)?;
            }
            Opcode::LambdaBind => {
                let argc = Self::value_as_index(&instruction.operand, "argument count")?;
                process.require_depth(argc + 1, op)?;
                let mut args = vec![Value::Null; argc];
                for slot in (0..argc).rev() {
                    args[slot] = process.pop_value(op)?;
                }
                let callee = process.pop_value(op)?;
                let Value::Lambda(lambda) = callee else {
                    return Err(ExecError::TypeMismatch(format!(
                        "LAMBDA_BIND expects a lambda, got {}",
                        callee.type_name()
                    )));
                };
                // A partial application is a new function with its own
                // identity; invocation prepends the bound arguments.
                let mut bound = Lambda::new(lambda.params.clone(), lambda.instructions.clone());
                bound.captured = lambda.captured.clone();
                bound.upvalues = lambda.upvalues.clone();
                bound.bound_args = lambda.bound_args.clone();
                bound.bound_args.extend(args);
                process.push_value(Value::Lambda(bound), self.config.max_stack_size)?;
            }
            _ => unreachable!("non-lambda opcode routed to exec_lambda"),
        }
        Ok(Value::Null)
    }

    /// Build a lambda from a `(body, capture-names)` operand, optionally
    /// with parameter names: `[body, captures]` or `[body, params,
    /// captures]`. Captures are snapshotted from globals; names that are
    /// not bound are skipped.
    fn create_lambda(
        &self,
        process: &ProcessContext,
        operand: &Value,
    ) -> ExecResult<Lambda> {
        let Value::Array(parts) = operand else {
            return Err(ExecError::InvalidInstruction(format!(
                "LAMBDA_CREATE expects an array operand, got {}",
                operand.type_name()
            )));
        };
        let (body, params, captures) = match parts.as_slice() {
            [body, captures] => (body, None, captures),
            [body, params, captures] => (body, Some(params), captures),
            _ => {
                return Err(ExecError::InvalidInstruction(
                    "LAMBDA_CREATE expects (body, capture-names)".to_string(),
                ))
            }
        };
        let Value::Instructions(body) = body else {
            return Err(ExecError::InvalidInstruction(format!(
                "lambda body must be instructions, got {}",
                body.type_name()
            )));
        };
        let params = match params {
            Some(Value::Array(names)) => names
                .iter()
                .map(|name| Self::value_as_name(name, "parameter name"))
                .collect::<ExecResult<Vec<_>>>()?,
            Some(other) => {
                return Err(ExecError::InvalidInstruction(format!(
                    "lambda parameters must be an array, got {}",
                    other.type_name()
                )))
            }
            None => Vec::new(),
        };
        let Value::Array(capture_names) = captures else {
            return Err(ExecError::InvalidInstruction(format!(
                "capture names must be an array, got {}",
                captures.type_name()
            )));
        };

        let mut lambda = Lambda::new(params, body.clone());
        for name in capture_names {
            let name = Self::value_as_name(name, "capture name")?;
            if let Some(value) = process.globals.get(&name) {
                lambda.captured.insert(name, value.clone());
                lambda.upvalues.push(value.clone());
            }
        }
        Ok(lambda)
    }

    /// Run a lambda to completion inside the current opcode.
    ///
    /// The execution state is saved, the lambda's code installed, bound
    /// and call arguments become fresh locals, and its captures are merged
    /// into globals. Everything is restored afterward and the lambda's
    /// return value handed back. Selective-receive matchers run through
    /// this same path.
    pub(crate) fn run_inline(
        &self,
        process: &mut ProcessContext,
        lambda: &Lambda,
        args: Vec<Value>,
    ) -> ExecResult<Value> {
        let saved_ip = process.ip;
        let saved_instructions =
            std::mem::replace(&mut process.instructions, lambda.instructions.clone());
        let saved_end_of_main =
            std::mem::replace(&mut process.end_of_main, lambda.instructions.len());
        let saved_frame_pointer = process.frame_pointer;
        let saved_locals_len = process.locals.len();
        let saved_stack_len = process.stack.len();
        let saved_handlers_len = process.exception_handlers.len();
        let saved_closure = std::mem::replace(&mut process.current_closure, Some(lambda.clone()));
        let entry_call_depth = process.call_stack.len();

        let mut saved_globals = Vec::new();
        for (name, value) in &lambda.captured {
            saved_globals.push((
                name.clone(),
                process.globals.insert(name.clone(), value.clone()),
            ));
        }

        process.frame_pointer = process.locals.len();
        let mut all_args = lambda.bound_args.clone();
        all_args.extend(args);
        let slots = lambda.params.len().max(all_args.len());
        for index in 0..slots {
            process
                .locals
                .push(all_args.get(index).cloned().unwrap_or(Value::Null));
        }
        process.ip = 0;

        // Budget the inline run so a looping matcher cannot wedge the
        // dispatch loop
        let budget = self.config.max_reductions_per_slice.saturating_mul(4).max(1);
        let mut steps: u64 = 0;

        let outcome = loop {
            if process.state != ProcessState::Alive {
                break Ok(Value::Null);
            }
            if process.ip >= process.instructions.len() {
                let fell_off = if process.stack.len() > saved_stack_len {
                    process.stack.last().cloned().unwrap_or(Value::Null)
                } else {
                    Value::Null
                };
                break Ok(fell_off);
            }
            if steps >= budget {
                break Err(ExecError::Runtime(
                    "inline function exceeded its reduction budget".to_string(),
                ));
            }
            let instruction = process.instructions[process.ip].clone();
            if process.call_stack.len() == entry_call_depth
                && matches!(instruction.opcode, Opcode::Return | Opcode::ReturnValue)
            {
                let result = if instruction.opcode == Opcode::ReturnValue {
                    process.pop_value("RETURN_VALUE")?
                } else {
                    Value::Null
                };
                break Ok(result);
            }
            // A throw not caught inside the lambda must not unwind into the
            // caller's handlers while the lambda's code is still installed;
            // it propagates as an error and re-raises at the call site.
            if process.exception_handlers.len() == saved_handlers_len
                && matches!(instruction.opcode, Opcode::Throw | Opcode::Rethrow)
            {
                let thrown = if instruction.opcode == Opcode::Throw {
                    process.pop_value("THROW")?
                } else {
                    process.current_exception.clone().unwrap_or(Value::Null)
                };
                let message = match &thrown {
                    Value::Map(entries) => match entries.get("message") {
                        Some(Value::Str(message)) => message.clone(),
                        _ => thrown.to_string(),
                    },
                    Value::Str(message) => message.clone(),
                    other => other.to_string(),
                };
                break Err(ExecError::Unhandled(message));
            }
            match self.dispatch(process, &instruction) {
                Ok(_) => {}
                Err(err) => {
                    // Handlers installed inside the lambda catch their own
                    // errors; anything else propagates to the caller opcode
                    if process.exception_handlers.len() > saved_handlers_len {
                        let exception = super::exception::build_exception_value(process, &err);
                        self.inline_unwind(process, exception);
                    } else {
                        break Err(err);
                    }
                }
            }
            if matches!(
                process.state,
                ProcessState::Waiting | ProcessState::Blocked
            ) {
                break Err(ExecError::Runtime(
                    "cannot suspend inside an inline function".to_string(),
                ));
            }
            steps += 1;
            process.reductions += 1;
        };

        // Restore the caller's execution state
        process.instructions = saved_instructions;
        process.end_of_main = saved_end_of_main;
        process.ip = saved_ip;
        process.frame_pointer = saved_frame_pointer;
        process.locals.truncate(saved_locals_len);
        process.stack.truncate(saved_stack_len);
        process.call_stack.truncate(entry_call_depth);
        process.exception_handlers.truncate(saved_handlers_len);
        process.current_closure = saved_closure;
        for (name, previous) in saved_globals.into_iter().rev() {
            match previous {
                Some(value) => {
                    process.globals.insert(name, value);
                }
                None => {
                    process.globals.remove(&name);
                }
            }
        }

        outcome
    }

    fn inline_unwind(&self, process: &mut ProcessContext, exception: Value) {
        // Same unwind as the outer machinery; reuse through throw_value is
        // not possible here because an empty handler stack must not kill
        // the process mid-restore.
        if let Some(handler) = process.exception_handlers.pop() {
            process.stack.truncate(handler.stack_len);
            process.call_stack.truncate(handler.call_stack_len);
            process.locals.truncate(handler.locals_len);
            process.frame_pointer = handler.frame_pointer;
            process.stack.push(exception.clone());
            process.current_exception = Some(exception);
            process.ip = handler.catch_ip;
        }
    }
}
