//! Locals, globals and upvalue opcodes

use crate::bytecode::{Instruction, Opcode, Value};
use crate::error::{ExecError, ExecResult};
use crate::runtime::executor::Executor;
use crate::runtime::process::ProcessContext;

impl Executor {
    pub(super) fn exec_variable(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        let op = instruction.opcode.name();
        let max = self.config.max_stack_size;
        match instruction.opcode {
            Opcode::LoadLocal => {
                let slot = Self::value_as_index(&instruction.operand, "local slot")?;
                let value = process.load_local(slot)?;
                process.push_value(value, max)?;
            }
            Opcode::StoreLocal => {
                let slot = Self::value_as_index(&instruction.operand, "local slot")?;
                let value = process.pop_value(op)?;
                process.store_local(slot, value);
            }
            Opcode::LoadGlobal => {
                let name = Self::value_as_name(&instruction.operand, "global name")?;
                let value = process.globals.get(&name).cloned().ok_or_else(|| {
                    ExecError::UndefinedVariable(name.clone())
                })?;
                process.push_value(value, max)?;
            }
            Opcode::StoreGlobal => {
                let name = Self::value_as_name(&instruction.operand, "global name")?;
                let value = process.pop_value(op)?;
                process.globals.insert(name, value);
            }
            Opcode::LoadUpvalue => {
                let index = Self::value_as_index(&instruction.operand, "upvalue index")?;
                let closure = process.current_closure.as_ref().ok_or_else(|| {
                    ExecError::Runtime("upvalue access outside a closure".to_string())
                })?;
                let value = closure.upvalues.get(index).cloned().ok_or_else(|| {
                    ExecError::UndefinedVariable(format!("upvalue {}", index))
                })?;
                process.push_value(value, max)?;
            }
            Opcode::StoreUpvalue => {
                let index = Self::value_as_index(&instruction.operand, "upvalue index")?;
                let value = process.pop_value(op)?;
                let closure = process.current_closure.as_mut().ok_or_else(|| {
                    ExecError::Runtime("upvalue access outside a closure".to_string())
                })?;
                let slot = closure.upvalues.get_mut(index).ok_or_else(|| {
                    ExecError::UndefinedVariable(format!("upvalue {}", index))
                })?;
                *slot = value;
            }
            _ => unreachable!("non-variable opcode routed to exec_variable"),
        }
        Ok(Value::Null)
    }
}
