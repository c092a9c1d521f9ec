//! Built-in function registry for `CALL_BUILT_IN`

use std::collections::HashMap;
use std::sync::Arc;

use crate::bytecode::Value;
use crate::error::{ExecError, ExecResult};

/// A built-in function body: a pure transformer over its argument slice.
pub type BuiltinFn = Arc<dyn Fn(&[Value]) -> ExecResult<Value> + Send + Sync>;

/// Registry keyed by `(module, function, arity)`.
///
/// Ships a small default set so dispatch and selective-receive matchers
/// are exercisable; hosts register richer libraries at engine setup.
pub struct BuiltinRegistry {
    functions: HashMap<(String, String, usize), BuiltinFn>,
}

impl BuiltinRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        BuiltinRegistry {
            functions: HashMap::new(),
        }
    }

    /// A registry pre-loaded with the default function set.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.install_defaults();
        registry
    }

    /// Register a function under `(module, name, arity)`.
    pub fn register<F>(&mut self, module: &str, name: &str, arity: usize, body: F)
    where
        F: Fn(&[Value]) -> ExecResult<Value> + Send + Sync + 'static,
    {
        self.functions.insert(
            (module.to_string(), name.to_string(), arity),
            Arc::new(body),
        );
    }

    /// Dispatch a call, raising `UndefinedFunction` for unknown keys.
    pub fn call(
        &self,
        module: &str,
        name: &str,
        args: &[Value],
    ) -> ExecResult<Value> {
        let key = (module.to_string(), name.to_string(), args.len());
        let body = self.functions.get(&key).ok_or_else(|| {
            ExecError::UndefinedFunction(format!("{}.{}/{}", module, name, args.len()))
        })?;
        body(args)
    }

    /// Whether a function is registered.
    pub fn contains(&self, module: &str, name: &str, arity: usize) -> bool {
        self.functions
            .contains_key(&(module.to_string(), name.to_string(), arity))
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn install_defaults(&mut self) {
        self.register("core", "is_integer", 1, |args| {
            Ok(Value::Bool(matches!(
                args[0],
                Value::Int(_) | Value::Uint(_)
            )))
        });
        self.register("core", "is_float", 1, |args| {
            Ok(Value::Bool(matches!(args[0], Value::Float(_))))
        });
        self.register("core", "is_string", 1, |args| {
            Ok(Value::Bool(matches!(args[0], Value::Str(_))))
        });
        self.register("core", "type_of", 1, |args| {
            Ok(Value::Symbol(args[0].type_name().to_string()))
        });
        self.register("string", "length", 1, |args| match &args[0] {
            Value::Str(s) => Ok(Value::Uint(s.chars().count() as u64)),
            other => Err(ExecError::TypeMismatch(format!(
                "string.length expects a string, got {}",
                other.type_name()
            ))),
        });
        self.register("string", "concat", 2, |args| match (&args[0], &args[1]) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
            (a, b) => Err(ExecError::TypeMismatch(format!(
                "string.concat expects strings, got {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        });
        self.register("array", "length", 1, |args| match &args[0] {
            Value::Array(items) => Ok(Value::Uint(items.len() as u64)),
            other => Err(ExecError::TypeMismatch(format!(
                "array.length expects an array, got {}",
                other.type_name()
            ))),
        });
        self.register("array", "push", 2, |args| match &args[0] {
            Value::Array(items) => {
                let mut items = items.clone();
                items.push(args[1].clone());
                Ok(Value::Array(items))
            }
            other => Err(ExecError::TypeMismatch(format!(
                "array.push expects an array, got {}",
                other.type_name()
            ))),
        });
        self.register("array", "get", 2, |args| match (&args[0], &args[1]) {
            (Value::Array(items), index) => {
                let index = index.as_int().ok_or_else(|| {
                    ExecError::TypeMismatch("array.get expects an integer index".to_string())
                })?;
                if index < 0 || index as usize >= items.len() {
                    return Err(ExecError::IndexOutOfBounds {
                        index,
                        len: items.len(),
                    });
                }
                Ok(items[index as usize].clone())
            }
            (other, _) => Err(ExecError::TypeMismatch(format!(
                "array.get expects an array, got {}",
                other.type_name()
            ))),
        });
        self.register("map", "get", 2, |args| match (&args[0], &args[1]) {
            (Value::Map(entries), Value::Str(key)) => {
                Ok(entries.get(key).cloned().unwrap_or(Value::Null))
            }
            (a, b) => Err(ExecError::TypeMismatch(format!(
                "map.get expects a map and string key, got {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        });
        self.register("map", "put", 3, |args| match (&args[0], &args[1]) {
            (Value::Map(entries), Value::Str(key)) => {
                let mut entries = entries.clone();
                entries.insert(key.clone(), args[2].clone());
                Ok(Value::Map(entries))
            }
            (a, b) => Err(ExecError::TypeMismatch(format!(
                "map.put expects a map and string key, got {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        });
        self.register("math", "sqrt", 1, |args| {
            let x = args[0].as_float().ok_or_else(|| {
                ExecError::TypeMismatch("math.sqrt expects a number".to_string())
            })?;
            if x < 0.0 {
                return Err(ExecError::Value("math.sqrt of a negative number".to_string()));
            }
            Ok(Value::Float(x.sqrt()))
        });
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_installed() {
        let registry = BuiltinRegistry::with_defaults();
        assert!(registry.contains("core", "is_integer", 1));
        assert!(registry.contains("string", "concat", 2));
        assert!(!registry.contains("core", "is_integer", 2));
    }

    #[test]
    fn test_dispatch() {
        let registry = BuiltinRegistry::with_defaults();
        let result = registry
            .call("core", "is_integer", &[Value::Int(3)])
            .unwrap();
        assert_eq!(result, Value::Bool(true));

        let result = registry
            .call("core", "is_integer", &[Value::Str("x".to_string())])
            .unwrap();
        assert_eq!(result, Value::Bool(false));
    }

    #[test]
    fn test_unknown_function() {
        let registry = BuiltinRegistry::with_defaults();
        let err = registry.call("nope", "missing", &[]).unwrap_err();
        assert!(matches!(err, ExecError::UndefinedFunction(_)));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = BuiltinRegistry::new();
        registry.register("host", "answer", 0, |_| Ok(Value::Int(42)));
        assert_eq!(registry.call("host", "answer", &[]).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_arity_is_part_of_the_key() {
        let registry = BuiltinRegistry::with_defaults();
        let err = registry
            .call("string", "concat", &[Value::Str("a".to_string())])
            .unwrap_err();
        assert!(matches!(err, ExecError::UndefinedFunction(_)));
    }
}
