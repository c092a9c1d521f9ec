//! Tagged runtime values

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::bytecode::instruction::Instruction;
use crate::error::ExecError;
use crate::types::MonitorRef;

/// A lambda value: code plus the environment it closed over.
///
/// Captures live twice, as the source machine kept them: by name in
/// `captured` (spliced into globals on invocation so `LOAD_GLOBAL` sees
/// them) and by index in `upvalues` for `LOAD_UPVALUE` / `STORE_UPVALUE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lambda {
    /// Identity for equality; clones keep the id
    pub id: u64,
    /// Parameter names, bound to fresh locals on invocation
    pub params: Vec<String>,
    /// The lambda body
    pub instructions: Vec<Instruction>,
    /// Name-addressed captures, injected into globals while running
    pub captured: IndexMap<String, Value>,
    /// Index-addressed captures, in capture order
    pub upvalues: Vec<Value>,
    /// Arguments pre-bound by `LAMBDA_BIND`, prepended on invocation
    pub bound_args: Vec<Value>,
}

impl Lambda {
    /// Create a lambda with a fresh identity.
    pub fn new(params: Vec<String>, instructions: Vec<Instruction>) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Lambda {
            id: COUNTER.fetch_add(1, AtomicOrdering::SeqCst),
            params,
            instructions,
            captured: IndexMap::new(),
            upvalues: Vec::new(),
            bound_args: Vec::new(),
        }
    }
}

impl PartialEq for Lambda {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Runtime value.
///
/// Equality is structural for primitives and collections and crosses the
/// numeric variants (an `Int`, `Uint` and `Float` holding the same number
/// compare equal); lambdas and monitor references compare by identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed 64-bit integer
    Int(i64),
    /// Unsigned 64-bit integer
    Uint(u64),
    /// 64-bit float
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Interned symbol, compared by name
    Symbol(String),
    /// Ordered sequence
    Array(Vec<Value>),
    /// Insertion-ordered string-keyed map
    Map(IndexMap<String, Value>),
    /// Raw byte sequence
    Binary(Vec<u8>),
    /// Closure
    Lambda(Lambda),
    /// Raw code block, for closure creation and indirect calls
    Instructions(Vec<Instruction>),
    /// Monitor reference carrier
    MonitorRef(MonitorRef),
}

impl Value {
    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Binary(_) => "binary",
            Value::Lambda(_) => "lambda",
            Value::Instructions(_) => "instructions",
            Value::MonitorRef(_) => "monitor_ref",
        }
    }

    /// Truthiness: `Null` and `false` are falsy, and so are empty strings,
    /// arrays, maps and binaries; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Binary(b) => !b.is_empty(),
            _ => true,
        }
    }

    /// Whether the value is one of the numeric variants.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Uint(_) | Value::Float(_))
    }

    /// Widen any numeric variant to a float.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Uint(u) => Some(*u as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Narrow to a signed integer where the value holds one exactly.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Build a map value from key/value pairs.
    pub fn map_from(pairs: Vec<(&str, Value)>) -> Value {
        let mut m = IndexMap::new();
        for (k, v) in pairs {
            m.insert(k.to_string(), v);
        }
        Value::Map(m)
    }

    /// Total comparison for the ordering opcodes.
    ///
    /// Numbers compare across variants; strings and symbols lexicographically;
    /// binaries as byte sequences; arrays pairwise with length as tiebreaker.
    /// Unlike non-numeric types and NaN operands are a `TypeMismatch`.
    pub fn compare(&self, other: &Value) -> Result<Ordering, ExecError> {
        if self.is_numeric() && other.is_numeric() {
            let a = self.as_float().unwrap_or(f64::NAN);
            let b = other.as_float().unwrap_or(f64::NAN);
            return a.partial_cmp(&b).ok_or_else(|| {
                ExecError::TypeMismatch("cannot order NaN".to_string())
            });
        }
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::Symbol(a), Value::Symbol(b)) => Ok(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Ok(a.cmp(b)),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        ord => return Ok(ord),
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            _ => Err(ExecError::TypeMismatch(format!(
                "cannot order {} and {}",
                self.type_name(),
                other.type_name()
            ))),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
            }
            (Value::Lambda(a), Value::Lambda(b)) => a.id == b.id,
            (Value::MonitorRef(a), Value::MonitorRef(b)) => a == b,
            (Value::Instructions(a), Value::Instructions(b)) => a == b,
            (a, b) if a.is_numeric() && b.is_numeric() => match (a, b) {
                (Value::Int(x), Value::Int(y)) => x == y,
                (Value::Uint(x), Value::Uint(y)) => x == y,
                (Value::Int(x), Value::Uint(y)) | (Value::Uint(y), Value::Int(x)) => {
                    *x >= 0 && *x as u64 == *y
                }
                _ => {
                    let x = a.as_float().unwrap_or(f64::NAN);
                    let y = b.as_float().unwrap_or(f64::NAN);
                    x == y
                }
            },
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Uint(u) => write!(f, "{}", u),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Symbol(s) => write!(f, ":{}", s),
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Binary(b) => write!(f, "<<{} bytes>>", b.len()),
            Value::Lambda(l) => write!(f, "lambda#{}", l.id),
            Value::Instructions(i) => write!(f, "instructions({})", i.len()),
            Value::MonitorRef(r) => write!(f, "ref#{}", r.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pid;

    #[test]
    fn test_numeric_cross_type_equality() {
        assert_eq!(Value::Int(1), Value::Uint(1));
        assert_eq!(Value::Uint(2), Value::Float(2.0));
        assert_eq!(Value::Int(-3), Value::Float(-3.0));
        assert_ne!(Value::Int(-1), Value::Uint(u64::MAX));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(!Value::Array(vec![]).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::Str("x".to_string()).is_truthy());
    }

    #[test]
    fn test_compare_arrays_pairwise() {
        let a = Value::Array(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::Array(vec![Value::Int(1), Value::Int(3)]);
        let c = Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(0)]);
        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
        assert_eq!(a.compare(&c).unwrap(), Ordering::Less);
        assert_eq!(a.compare(&a.clone()).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_compare_unlike_types_fails() {
        let err = Value::Str("a".to_string()).compare(&Value::Int(1));
        assert!(err.is_err());
    }

    #[test]
    fn test_nan_ordering_fails() {
        let err = Value::Float(f64::NAN).compare(&Value::Float(1.0));
        assert!(err.is_err());
    }

    #[test]
    fn test_lambda_identity_equality() {
        let l1 = Lambda::new(vec![], vec![]);
        let l2 = Lambda::new(vec![], vec![]);
        assert_ne!(Value::Lambda(l1.clone()), Value::Lambda(l2));
        assert_eq!(Value::Lambda(l1.clone()), Value::Lambda(l1));
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let original = Value::Array(vec![Value::Int(1)]);
        let mut clone = original.clone();
        if let Value::Array(items) = &mut clone {
            items.push(Value::Int(2));
        }
        assert_eq!(original, Value::Array(vec![Value::Int(1)]));
    }

    #[test]
    fn test_monitor_ref_value_equality() {
        let r = MonitorRef::new(Pid::new(), Pid::new());
        assert_eq!(
            Value::MonitorRef(r.clone()),
            Value::MonitorRef(r.clone())
        );
        let other = MonitorRef::new(Pid::new(), Pid::new());
        assert_ne!(Value::MonitorRef(r), Value::MonitorRef(other));
    }
}
