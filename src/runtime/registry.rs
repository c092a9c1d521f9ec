//! Name registration for processes

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::Pid;

/// Name → address table. Names are unique; registering a taken name fails.
pub struct ProcessRegistry {
    names: Mutex<HashMap<String, Pid>>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        ProcessRegistry {
            names: Mutex::new(HashMap::new()),
        }
    }

    /// Register a name. Returns false when the name is already taken.
    pub fn register(&self, name: &str, pid: Pid) -> bool {
        let mut names = self.names.lock();
        if names.contains_key(name) {
            return false;
        }
        names.insert(name.to_string(), pid);
        true
    }

    /// Remove a name. Returns false when the name was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.names.lock().remove(name).is_some()
    }

    /// Look up the address registered under a name.
    pub fn whereis(&self, name: &str) -> Option<Pid> {
        self.names.lock().get(name).copied()
    }

    /// Remove every name pointing at a process. Used at exit fan-out.
    pub fn unregister_pid(&self, pid: Pid) {
        self.names.lock().retain(|_, registered| *registered != pid);
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    /// Whether no names are registered.
    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unique_names() {
        let registry = ProcessRegistry::new();
        let a = Pid::new();
        let b = Pid::new();

        assert!(registry.register("worker", a));
        assert!(!registry.register("worker", b));
        assert_eq!(registry.whereis("worker"), Some(a));
    }

    #[test]
    fn test_unregister() {
        let registry = ProcessRegistry::new();
        let pid = Pid::new();
        registry.register("db", pid);

        assert!(registry.unregister("db"));
        assert!(!registry.unregister("db"));
        assert_eq!(registry.whereis("db"), None);
    }

    #[test]
    fn test_unregister_pid_clears_all_names() {
        let registry = ProcessRegistry::new();
        let pid = Pid::new();
        registry.register("a", pid);
        registry.register("b", pid);

        registry.unregister_pid(pid);
        assert!(registry.is_empty());
    }
}
