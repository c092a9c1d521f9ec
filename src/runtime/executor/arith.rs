//! Arithmetic, bitwise, logical and comparison opcodes

use std::cmp::Ordering;

use crate::bytecode::{Instruction, Opcode, Value};
use crate::error::{ExecError, ExecResult};
use crate::runtime::executor::Executor;
use crate::runtime::process::ProcessContext;

/// Operand pair after numeric promotion: float wins, then unsigned when
/// both sides are unsigned, otherwise signed.
enum NumericPair {
    Float(f64, f64),
    Uint(u64, u64),
    Int(i64, i64),
}

fn numeric_pair(lhs: &Value, rhs: &Value, op: &str) -> ExecResult<NumericPair> {
    if !lhs.is_numeric() || !rhs.is_numeric() {
        return Err(ExecError::TypeMismatch(format!(
            "{} expects numbers, got {} and {}",
            op,
            lhs.type_name(),
            rhs.type_name()
        )));
    }
    if matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_)) {
        return Ok(NumericPair::Float(
            lhs.as_float().unwrap_or(f64::NAN),
            rhs.as_float().unwrap_or(f64::NAN),
        ));
    }
    if let (Value::Uint(a), Value::Uint(b)) = (lhs, rhs) {
        return Ok(NumericPair::Uint(*a, *b));
    }
    let a = lhs.as_int().ok_or_else(|| {
        ExecError::Conversion(format!("{} does not fit a signed integer", lhs))
    })?;
    let b = rhs.as_int().ok_or_else(|| {
        ExecError::Conversion(format!("{} does not fit a signed integer", rhs))
    })?;
    Ok(NumericPair::Int(a, b))
}

fn integer_pair(lhs: &Value, rhs: &Value, op: &str) -> ExecResult<(i64, i64)> {
    let a = lhs.as_int().ok_or_else(|| {
        ExecError::TypeMismatch(format!("{} expects integers, got {}", op, lhs.type_name()))
    })?;
    let b = rhs.as_int().ok_or_else(|| {
        ExecError::TypeMismatch(format!("{} expects integers, got {}", op, rhs.type_name()))
    })?;
    Ok((a, b))
}

fn overflow(op: &str) -> ExecError {
    ExecError::Value(format!("integer overflow in {}", op))
}

impl Executor {
    pub(super) fn exec_arithmetic(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        let op = instruction.opcode.name();
        let max = self.config.max_stack_size;
        let result = match instruction.opcode {
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow => {
                let rhs = process.pop_value(op)?;
                let lhs = process.pop_value(op)?;
                binary_arithmetic(instruction.opcode, &lhs, &rhs, op)?
            }
            Opcode::Min | Opcode::Max => {
                let rhs = process.pop_value(op)?;
                let lhs = process.pop_value(op)?;
                let ordering = lhs.compare(&rhs)?;
                let keep_lhs = match instruction.opcode {
                    Opcode::Min => ordering != Ordering::Greater,
                    _ => ordering != Ordering::Less,
                };
                if keep_lhs {
                    lhs
                } else {
                    rhs
                }
            }
            Opcode::Inc | Opcode::Dec => {
                let value = process.pop_value(op)?;
                let delta = Value::Int(if instruction.opcode == Opcode::Inc { 1 } else { -1 });
                binary_arithmetic(Opcode::Add, &value, &delta, op)?
            }
            Opcode::Neg => {
                let value = process.pop_value(op)?;
                match value {
                    Value::Int(i) => Value::Int(i.checked_neg().ok_or_else(|| overflow(op))?),
                    Value::Uint(u) => {
                        let signed = i64::try_from(u).map_err(|_| overflow(op))?;
                        Value::Int(-signed)
                    }
                    Value::Float(f) => Value::Float(-f),
                    other => {
                        return Err(ExecError::TypeMismatch(format!(
                            "NEG expects a number, got {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Opcode::Abs => {
                let value = process.pop_value(op)?;
                match value {
                    Value::Int(i) => Value::Int(i.checked_abs().ok_or_else(|| overflow(op))?),
                    Value::Uint(u) => Value::Uint(u),
                    Value::Float(f) => Value::Float(f.abs()),
                    other => {
                        return Err(ExecError::TypeMismatch(format!(
                            "ABS expects a number, got {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Opcode::Floor | Opcode::Ceil | Opcode::Round => {
                let value = process.pop_value(op)?;
                match value {
                    Value::Float(f) => Value::Float(match instruction.opcode {
                        Opcode::Floor => f.floor(),
                        Opcode::Ceil => f.ceil(),
                        _ => f.round(),
                    }),
                    v @ (Value::Int(_) | Value::Uint(_)) => v,
                    other => {
                        return Err(ExecError::TypeMismatch(format!(
                            "{} expects a number, got {}",
                            op,
                            other.type_name()
                        )))
                    }
                }
            }
            _ => unreachable!("non-arithmetic opcode routed to exec_arithmetic"),
        };
        process.push_value(result, max)?;
        Ok(Value::Null)
    }

    pub(super) fn exec_bitwise(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        let op = instruction.opcode.name();
        let max = self.config.max_stack_size;
        let result = match instruction.opcode {
            Opcode::BitNot => {
                let value = process.pop_value(op)?;
                match value {
                    Value::Int(i) => Value::Int(!i),
                    Value::Uint(u) => Value::Uint(!u),
                    other => {
                        return Err(ExecError::TypeMismatch(format!(
                            "BIT_NOT expects an integer, got {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor => {
                let rhs = process.pop_value(op)?;
                let lhs = process.pop_value(op)?;
                match (&lhs, &rhs) {
                    (Value::Uint(a), Value::Uint(b)) => Value::Uint(match instruction.opcode {
                        Opcode::BitAnd => a & b,
                        Opcode::BitOr => a | b,
                        _ => a ^ b,
                    }),
                    _ => {
                        let (a, b) = integer_pair(&lhs, &rhs, op)?;
                        Value::Int(match instruction.opcode {
                            Opcode::BitAnd => a & b,
                            Opcode::BitOr => a | b,
                            _ => a ^ b,
                        })
                    }
                }
            }
            Opcode::Shl | Opcode::Shr | Opcode::ShrUnsigned => {
                let amount = process.pop_value(op)?;
                let value = process.pop_value(op)?;
                let shift = Self::value_as_index(&amount, "shift amount")? as u32;
                shift_value(instruction.opcode, &value, shift, op)?
            }
            _ => unreachable!("non-bitwise opcode routed to exec_bitwise"),
        };
        process.push_value(result, max)?;
        Ok(Value::Null)
    }

    pub(super) fn exec_logical(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        let op = instruction.opcode.name();
        let max = self.config.max_stack_size;
        let result = match instruction.opcode {
            Opcode::Not => {
                let value = process.pop_value(op)?;
                Value::Bool(!value.is_truthy())
            }
            Opcode::And | Opcode::Or | Opcode::Xor => {
                let rhs = process.pop_value(op)?;
                let lhs = process.pop_value(op)?;
                let (a, b) = (lhs.is_truthy(), rhs.is_truthy());
                Value::Bool(match instruction.opcode {
                    Opcode::And => a && b,
                    Opcode::Or => a || b,
                    _ => a ^ b,
                })
            }
            _ => unreachable!("non-logical opcode routed to exec_logical"),
        };
        process.push_value(result, max)?;
        Ok(Value::Null)
    }

    pub(super) fn exec_comparison(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        let op = instruction.opcode.name();
        let max = self.config.max_stack_size;
        let result = match instruction.opcode {
            Opcode::IsNull => {
                let value = process.pop_value(op)?;
                Value::Bool(value == Value::Null)
            }
            Opcode::IsNotNull => {
                let value = process.pop_value(op)?;
                Value::Bool(value != Value::Null)
            }
            Opcode::Eq | Opcode::Neq => {
                let rhs = process.pop_value(op)?;
                let lhs = process.pop_value(op)?;
                let equal = lhs == rhs;
                Value::Bool(if instruction.opcode == Opcode::Eq {
                    equal
                } else {
                    !equal
                })
            }
            Opcode::Id | Opcode::Nid => {
                let rhs = process.pop_value(op)?;
                let lhs = process.pop_value(op)?;
                let identical = lhs.type_name() == rhs.type_name() && lhs == rhs;
                Value::Bool(if instruction.opcode == Opcode::Id {
                    identical
                } else {
                    !identical
                })
            }
            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                let rhs = process.pop_value(op)?;
                let lhs = process.pop_value(op)?;
                let ordering = lhs.compare(&rhs)?;
                Value::Bool(match instruction.opcode {
                    Opcode::Lt => ordering == Ordering::Less,
                    Opcode::Le => ordering != Ordering::Greater,
                    Opcode::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                })
            }
            _ => unreachable!("non-comparison opcode routed to exec_comparison"),
        };
        process.push_value(result, max)?;
        Ok(Value::Null)
    }
}

fn binary_arithmetic(opcode: Opcode, lhs: &Value, rhs: &Value, op: &str) -> ExecResult<Value> {
    if matches!(opcode, Opcode::Div | Opcode::Mod) {
        let denominator = rhs.as_float().ok_or_else(|| {
            ExecError::TypeMismatch(format!(
                "{} expects numbers, got {}",
                op,
                rhs.type_name()
            ))
        })?;
        if denominator == 0.0 {
            return Err(ExecError::DivisionByZero);
        }
    }
    match numeric_pair(lhs, rhs, op)? {
        NumericPair::Float(a, b) => Ok(Value::Float(match opcode {
            Opcode::Add => a + b,
            Opcode::Sub => a - b,
            Opcode::Mul => a * b,
            Opcode::Div => a / b,
            Opcode::Mod => a % b,
            Opcode::Pow => a.powf(b),
            _ => unreachable!(),
        })),
        NumericPair::Uint(a, b) => match opcode {
            Opcode::Add => a.checked_add(b).map(Value::Uint).ok_or_else(|| overflow(op)),
            Opcode::Sub => match a.checked_sub(b) {
                Some(result) => Ok(Value::Uint(result)),
                // Below zero; the difference is expressible signed
                None => i64::try_from(b - a)
                    .map(|delta| Value::Int(-delta))
                    .map_err(|_| overflow(op)),
            },
            Opcode::Mul => a.checked_mul(b).map(Value::Uint).ok_or_else(|| overflow(op)),
            Opcode::Div => Ok(Value::Uint(a / b)),
            Opcode::Mod => Ok(Value::Uint(a % b)),
            Opcode::Pow => {
                let exponent = u32::try_from(b).map_err(|_| overflow(op))?;
                a.checked_pow(exponent)
                    .map(Value::Uint)
                    .ok_or_else(|| overflow(op))
            }
            _ => unreachable!(),
        },
        NumericPair::Int(a, b) => match opcode {
            Opcode::Add => a.checked_add(b).map(Value::Int).ok_or_else(|| overflow(op)),
            Opcode::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(|| overflow(op)),
            Opcode::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(|| overflow(op)),
            Opcode::Div => a.checked_div(b).map(Value::Int).ok_or_else(|| overflow(op)),
            Opcode::Mod => a.checked_rem(b).map(Value::Int).ok_or_else(|| overflow(op)),
            Opcode::Pow => {
                if b < 0 {
                    Ok(Value::Float((a as f64).powf(b as f64)))
                } else {
                    let exponent = u32::try_from(b).map_err(|_| overflow(op))?;
                    a.checked_pow(exponent)
                        .map(Value::Int)
                        .ok_or_else(|| overflow(op))
                }
            }
            _ => unreachable!(),
        },
    }
}

/// Shifts of 64 bits or more saturate: zero everywhere except the
/// arithmetic right shift of a negative signed value, which sign-fills.
fn shift_value(opcode: Opcode, value: &Value, shift: u32, op: &str) -> ExecResult<Value> {
    match value {
        Value::Uint(u) => Ok(Value::Uint(match opcode {
            Opcode::Shl => {
                if shift >= 64 {
                    0
                } else {
                    u << shift
                }
            }
            _ => {
                if shift >= 64 {
                    0
                } else {
                    u >> shift
                }
            }
        })),
        Value::Int(i) => Ok(match opcode {
            Opcode::Shl => Value::Int(if shift >= 64 { 0 } else { i << shift }),
            Opcode::Shr => Value::Int(if shift >= 64 {
                if *i < 0 {
                    -1
                } else {
                    0
                }
            } else {
                i >> shift
            }),
            Opcode::ShrUnsigned => Value::Int(if shift >= 64 {
                0
            } else {
                ((*i as u64) >> shift) as i64
            }),
            _ => unreachable!(),
        }),
        other => Err(ExecError::TypeMismatch(format!(
            "{} expects an integer, got {}",
            op,
            other.type_name()
        ))),
    }
}
