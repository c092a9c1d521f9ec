//! The instruction executor: one dispatch per opcode family
//!
//! `execute` is the single entry point. Dead processes are a no-op. A
//! custom-handler table may intercept any opcode before the built-in
//! dispatch runs. Every error raised inside an opcode is routed through
//! the process's exception machinery.

mod arith;
mod control;
mod exception;
mod lambda;
mod message_ops;
mod process_ops;
mod stack;
mod supervisor_ops;
mod vars;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bytecode::{Instruction, Opcode, Value};
use crate::error::{ExecError, ExecResult};
use crate::runtime::builtins::BuiltinRegistry;
use crate::runtime::links::LinkRegistry;
use crate::runtime::fault::FaultHandler;
use crate::runtime::process::{ProcessContext, ProcessTable};
use crate::runtime::registry::ProcessRegistry;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::supervisor::SupervisorRegistry;
use crate::runtime::timer::TimerManager;
use crate::types::{EngineStats, Pid, ProcessState, VmConfig};

/// A custom opcode handler, invoked in place of the built-in dispatch.
pub type OpcodeHandler =
    Arc<dyn Fn(&mut ProcessContext, &Instruction) -> ExecResult<Value> + Send + Sync>;

/// Executes instructions against process contexts, with access to every
/// shared runtime structure an opcode can touch.
pub struct Executor {
    pub(crate) config: VmConfig,
    pub(crate) table: Arc<ProcessTable>,
    pub(crate) scheduler: Arc<Mutex<Scheduler>>,
    pub(crate) links: Arc<LinkRegistry>,
    pub(crate) registry: Arc<ProcessRegistry>,
    pub(crate) timers: Arc<Mutex<TimerManager>>,
    pub(crate) supervisors: Arc<SupervisorRegistry>,
    pub(crate) fault: Arc<FaultHandler>,
    pub(crate) builtins: BuiltinRegistry,
    pub(crate) reactivations: Arc<Mutex<VecDeque<Pid>>>,
    pub(crate) stats: Arc<Mutex<EngineStats>>,
    custom_handlers: HashMap<Opcode, OpcodeHandler>,
}

impl Executor {
    /// Wire an executor to the shared runtime structures.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: VmConfig,
        table: Arc<ProcessTable>,
        scheduler: Arc<Mutex<Scheduler>>,
        links: Arc<LinkRegistry>,
        registry: Arc<ProcessRegistry>,
        timers: Arc<Mutex<TimerManager>>,
        supervisors: Arc<SupervisorRegistry>,
        fault: Arc<FaultHandler>,
        builtins: BuiltinRegistry,
        reactivations: Arc<Mutex<VecDeque<Pid>>>,
        stats: Arc<Mutex<EngineStats>>,
    ) -> Self {
        Executor {
            config,
            table,
            scheduler,
            links,
            registry,
            timers,
            supervisors,
            fault,
            builtins,
            reactivations,
            stats,
            custom_handlers: HashMap::new(),
        }
    }

    /// Intercept an opcode with a custom handler.
    pub fn register_handler(&mut self, opcode: Opcode, handler: OpcodeHandler) {
        self.custom_handlers.insert(opcode, handler);
    }

    /// Remove a custom handler.
    pub fn unregister_handler(&mut self, opcode: Opcode) {
        self.custom_handlers.remove(&opcode);
    }

    /// Additional built-in functions.
    pub fn builtins_mut(&mut self) -> &mut BuiltinRegistry {
        &mut self.builtins
    }

    /// Execute one instruction against a process.
    ///
    /// Dead (or otherwise non-alive) processes are a no-op returning
    /// `Null`. Errors raised by the opcode go through the exception
    /// machinery: a handler frame catches them, otherwise the process dies
    /// with reason `Exception`.
    pub fn execute(&self, process: &mut ProcessContext, instruction: &Instruction) -> Value {
        if process.state != ProcessState::Alive {
            return Value::Null;
        }
        if let Some(handler) = self.custom_handlers.get(&instruction.opcode) {
            let handler = Arc::clone(handler);
            return match (handler.as_ref())(process, instruction) {
                Ok(value) => value,
                Err(err) => {
                    self.raise(process, err);
                    Value::Null
                }
            };
        }
        match self.dispatch(process, instruction) {
            Ok(value) => value,
            Err(err) => {
                self.raise(process, err);
                Value::Null
            }
        }
    }

    /// Built-in dispatch.
    ///
    /// Counter policy: every opcode except the absolute `JUMP` increments
    /// the counter before reading operands or touching the stack, so an
    /// unwind observes the address of the next instruction. `JUMP` sets
    /// the counter directly.
    pub(crate) fn dispatch(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        use crate::bytecode::OpcodeFamily::*;

        if instruction.opcode != Opcode::Jump {
            process.ip += 1;
        }
        match instruction.opcode.family() {
            Stack => self.exec_stack(process, instruction),
            Push => self.exec_push(process, instruction),
            Arithmetic => self.exec_arithmetic(process, instruction),
            Bitwise => self.exec_bitwise(process, instruction),
            Logical => self.exec_logical(process, instruction),
            Comparison => self.exec_comparison(process, instruction),
            Variable => self.exec_variable(process, instruction),
            Control => self.exec_control(process, instruction),
            Lambda => self.exec_lambda(process, instruction),
            Process => self.exec_process(process, instruction),
            Message => self.exec_message(process, instruction),
            Supervisor => self.exec_supervisor(process, instruction),
            Exception => self.exec_exception(process, instruction),
        }
    }

    // Operand helpers shared by the opcode families.

    /// Use the operand when present, otherwise pop from the stack.
    pub(crate) fn operand_or_pop(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        if instruction.operand != Value::Null {
            Ok(instruction.operand.clone())
        } else {
            process.pop_value(instruction.opcode.name())
        }
    }

    /// Interpret a value as a non-negative index.
    pub(crate) fn value_as_index(value: &Value, what: &str) -> ExecResult<usize> {
        match value {
            Value::Int(i) if *i >= 0 => Ok(*i as usize),
            Value::Uint(u) => Ok(*u as usize),
            Value::Int(_) => Err(ExecError::Value(format!("{} must be non-negative", what))),
            other => Err(ExecError::TypeMismatch(format!(
                "{} must be an integer, got {}",
                what,
                other.type_name()
            ))),
        }
    }

    /// Interpret a value as a name (string or symbol).
    pub(crate) fn value_as_name(value: &Value, what: &str) -> ExecResult<String> {
        match value {
            Value::Str(s) | Value::Symbol(s) => Ok(s.clone()),
            other => Err(ExecError::TypeMismatch(format!(
                "{} must be a string or symbol, got {}",
                what,
                other.type_name()
            ))),
        }
    }

    /// Interpret a value as a duration in seconds.
    pub(crate) fn value_as_seconds(value: &Value, what: &str) -> ExecResult<Duration> {
        let seconds = value.as_float().ok_or_else(|| {
            ExecError::TypeMismatch(format!(
                "{} must be numeric seconds, got {}",
                what,
                value.type_name()
            ))
        })?;
        if seconds.is_sign_negative() {
            return Ok(Duration::ZERO);
        }
        Ok(Duration::from_secs_f64(seconds))
    }

    /// Resolve a message target: an integer address, or a registered name
    /// given as a string or symbol.
    pub(crate) fn resolve_address(&self, value: &Value) -> ExecResult<Pid> {
        match value {
            Value::Int(i) if *i >= 0 => Ok(Pid::from_raw(*i as u64)),
            Value::Uint(u) => Ok(Pid::from_raw(*u)),
            Value::Str(name) | Value::Symbol(name) => {
                self.registry.whereis(name).ok_or_else(|| {
                    ExecError::InvalidAddress(format!("no process registered as {}", name))
                })
            }
            other => Err(ExecError::InvalidAddress(format!(
                "cannot address a process with a {}",
                other.type_name()
            ))),
        }
    }

    /// Push literal opcodes. Each copies the operand after a capacity check.
    fn exec_push(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        let max = self.config.max_stack_size;
        let value = match instruction.opcode {
            Opcode::PushNull => Value::Null,
            Opcode::PushTrue => Value::Bool(true),
            Opcode::PushFalse => Value::Bool(false),
            Opcode::PushInt => match &instruction.operand {
                Value::Int(_) => instruction.operand.clone(),
                Value::Uint(u) => Value::Int(i64::try_from(*u).map_err(|_| {
                    ExecError::Conversion(format!("{} does not fit a signed integer", u))
                })?),
                other => {
                    return Err(ExecError::InvalidInstruction(format!(
                        "PUSH_INT expects an integer operand, got {}",
                        other.type_name()
                    )))
                }
            },
            Opcode::PushUint => match &instruction.operand {
                Value::Uint(_) => instruction.operand.clone(),
                Value::Int(i) if *i >= 0 => Value::Uint(*i as u64),
                other => {
                    return Err(ExecError::InvalidInstruction(format!(
                        "PUSH_UINT expects a non-negative integer operand, got {}",
                        other.type_name()
                    )))
                }
            },
            Opcode::PushFloat => match &instruction.operand {
                Value::Float(_) => instruction.operand.clone(),
                Value::Int(i) => Value::Float(*i as f64),
                Value::Uint(u) => Value::Float(*u as f64),
                other => {
                    return Err(ExecError::InvalidInstruction(format!(
                        "PUSH_FLOAT expects a numeric operand, got {}",
                        other.type_name()
                    )))
                }
            },
            Opcode::PushString => match &instruction.operand {
                Value::Str(_) => instruction.operand.clone(),
                other => {
                    return Err(ExecError::InvalidInstruction(format!(
                        "PUSH_STRING expects a string operand, got {}",
                        other.type_name()
                    )))
                }
            },
            Opcode::PushSymbol => match &instruction.operand {
                Value::Symbol(_) => instruction.operand.clone(),
                Value::Str(s) => Value::Symbol(s.clone()),
                other => {
                    return Err(ExecError::InvalidInstruction(format!(
                        "PUSH_SYMBOL expects a string or symbol operand, got {}",
                        other.type_name()
                    )))
                }
            },
            Opcode::PushCustom => instruction.operand.clone(),
            Opcode::PushInstructions => match &instruction.operand {
                Value::Instructions(_) => instruction.operand.clone(),
                other => {
                    return Err(ExecError::InvalidInstruction(format!(
                        "PUSH_INSTRUCTIONS expects a code block operand, got {}",
                        other.type_name()
                    )))
                }
            },
            _ => unreachable!("non-push opcode routed to exec_push"),
        };
        process.push_value(value, max)?;
        Ok(Value::Null)
    }
}
