//! Data stack shuffling opcodes

use crate::bytecode::{Instruction, Opcode, Value};
use crate::error::ExecResult;
use crate::runtime::executor::Executor;
use crate::runtime::process::ProcessContext;

impl Executor {
    pub(super) fn exec_stack(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        let op = instruction.opcode.name();
        let max = self.config.max_stack_size;
        match instruction.opcode {
            Opcode::Pop => {
                process.pop_value(op)?;
            }
            Opcode::Dup => {
                process.require_depth(1, op)?;
                let top = process.stack[process.stack.len() - 1].clone();
                process.push_value(top, max)?;
            }
            Opcode::Dup2 => {
                process.require_depth(2, op)?;
                let len = process.stack.len();
                let under = process.stack[len - 2].clone();
                let top = process.stack[len - 1].clone();
                process.push_value(under, max)?;
                process.push_value(top, max)?;
            }
            Opcode::Swap => {
                process.require_depth(2, op)?;
                let len = process.stack.len();
                process.stack.swap(len - 1, len - 2);
            }
            Opcode::RotUp => {
                // ( a b c -- b c a )
                process.require_depth(3, op)?;
                let len = process.stack.len();
                let third = process.stack.remove(len - 3);
                process.stack.push(third);
            }
            Opcode::RotDown => {
                // ( a b c -- c a b )
                process.require_depth(3, op)?;
                let top = process.pop_value(op)?;
                let len = process.stack.len();
                process.stack.insert(len - 2, top);
            }
            Opcode::Nip => {
                process.require_depth(2, op)?;
                let len = process.stack.len();
                process.stack.remove(len - 2);
            }
            Opcode::Tuck => {
                // ( a b -- b a b )
                process.require_depth(2, op)?;
                let top = process.stack[process.stack.len() - 1].clone();
                let len = process.stack.len();
                if process.stack.len() >= max {
                    return Err(crate::error::ExecError::StackOverflow(max));
                }
                process.stack.insert(len - 2, top);
            }
            Opcode::Depth => {
                let depth = process.stack.len() as u64;
                process.push_value(Value::Uint(depth), max)?;
            }
            Opcode::Pick => {
                let n = Self::value_as_index(&instruction.operand, "PICK depth")?;
                process.require_depth(n + 1, op)?;
                let index = process.stack.len() - 1 - n;
                let picked = process.stack[index].clone();
                process.push_value(picked, max)?;
            }
            Opcode::Roll => {
                let n = Self::value_as_index(&instruction.operand, "ROLL depth")?;
                process.require_depth(n + 1, op)?;
                let index = process.stack.len() - 1 - n;
                let rolled = process.stack.remove(index);
                process.stack.push(rolled);
            }
            _ => unreachable!("non-stack opcode routed to exec_stack"),
        }
        Ok(Value::Null)
    }
}
