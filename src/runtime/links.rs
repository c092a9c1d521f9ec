//! Links, monitors and the trap-exit set

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::types::{MonitorRef, Pid};

#[derive(Default)]
struct LinkTables {
    /// Symmetric link sets keyed by address
    links: HashMap<Pid, HashSet<Pid>>,
    /// Watcher → monitors it holds
    forward: HashMap<Pid, Vec<MonitorRef>>,
    /// Watched → monitors pointing at it
    reverse: HashMap<Pid, Vec<MonitorRef>>,
    /// Processes converting exit signals to messages
    trapping: HashSet<Pid>,
}

/// The link and monitor registry.
///
/// All four tables live under one lock so link symmetry and the
/// forward/reverse monitor indices can never be observed half-updated.
pub struct LinkRegistry {
    tables: Mutex<LinkTables>,
}

impl LinkRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        LinkRegistry {
            tables: Mutex::new(LinkTables::default()),
        }
    }

    /// Record a symmetric link between two processes. Self-links are a no-op.
    pub fn link(&self, a: Pid, b: Pid) {
        if a == b {
            return;
        }
        let mut tables = self.tables.lock();
        tables.links.entry(a).or_default().insert(b);
        tables.links.entry(b).or_default().insert(a);
    }

    /// Remove a link in both directions.
    pub fn unlink(&self, a: Pid, b: Pid) {
        let mut tables = self.tables.lock();
        if let Some(set) = tables.links.get_mut(&a) {
            set.remove(&b);
        }
        if let Some(set) = tables.links.get_mut(&b) {
            set.remove(&a);
        }
    }

    /// Whether two processes are linked.
    pub fn linked(&self, a: Pid, b: Pid) -> bool {
        self.tables
            .lock()
            .links
            .get(&a)
            .map(|set| set.contains(&b))
            .unwrap_or(false)
    }

    /// The link set of a process.
    pub fn get_links(&self, pid: Pid) -> Vec<Pid> {
        self.tables
            .lock()
            .links
            .get(&pid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Mint a monitor reference and record it in both indices.
    pub fn monitor(&self, watcher: Pid, watched: Pid) -> MonitorRef {
        let reference = MonitorRef::new(watcher, watched);
        let mut tables = self.tables.lock();
        tables
            .forward
            .entry(watcher)
            .or_default()
            .push(reference.clone());
        tables
            .reverse
            .entry(watched)
            .or_default()
            .push(reference.clone());
        reference
    }

    /// Remove a monitor from both indices. Returns false when unknown.
    pub fn demonitor(&self, reference: &MonitorRef) -> bool {
        let mut tables = self.tables.lock();
        let mut found = false;
        if let Some(refs) = tables.forward.get_mut(&reference.watcher) {
            let before = refs.len();
            refs.retain(|r| r.id != reference.id);
            found = refs.len() != before;
        }
        if let Some(refs) = tables.reverse.get_mut(&reference.watched) {
            refs.retain(|r| r.id != reference.id);
        }
        found
    }

    /// Monitors held by a watcher.
    pub fn monitors_of(&self, watcher: Pid) -> Vec<MonitorRef> {
        self.tables
            .lock()
            .forward
            .get(&watcher)
            .cloned()
            .unwrap_or_default()
    }

    /// Monitors pointing at a watched process.
    pub fn watchers_of(&self, watched: Pid) -> Vec<MonitorRef> {
        self.tables
            .lock()
            .reverse
            .get(&watched)
            .cloned()
            .unwrap_or_default()
    }

    /// Toggle trap-exit for a process.
    pub fn trap_exit(&self, pid: Pid, enabled: bool) {
        let mut tables = self.tables.lock();
        if enabled {
            tables.trapping.insert(pid);
        } else {
            tables.trapping.remove(&pid);
        }
    }

    /// Whether a process traps exit signals.
    pub fn traps_exit(&self, pid: Pid) -> bool {
        self.tables.lock().trapping.contains(&pid)
    }

    /// Remove a dying process from every table.
    ///
    /// Returns the addresses it was linked to and the monitors that were
    /// watching it, so the fault handler can fan out exit signals and
    /// DOWN messages.
    pub fn cleanup(&self, pid: Pid) -> (Vec<Pid>, Vec<MonitorRef>) {
        let mut tables = self.tables.lock();

        let linked: Vec<Pid> = tables
            .links
            .remove(&pid)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for peer in &linked {
            if let Some(set) = tables.links.get_mut(peer) {
                set.remove(&pid);
            }
        }

        // Monitors this process held over others
        let held = tables.forward.remove(&pid).unwrap_or_default();
        for reference in &held {
            if let Some(refs) = tables.reverse.get_mut(&reference.watched) {
                refs.retain(|r| r.id != reference.id);
            }
        }

        // Monitors others held over this process
        let watchers = tables.reverse.remove(&pid).unwrap_or_default();
        for reference in &watchers {
            if let Some(refs) = tables.forward.get_mut(&reference.watcher) {
                refs.retain(|r| r.id != reference.id);
            }
        }

        tables.trapping.remove(&pid);
        (linked, watchers)
    }
}

impl Default for LinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_links_are_symmetric() {
        let registry = LinkRegistry::new();
        let a = Pid::new();
        let b = Pid::new();

        registry.link(a, b);
        assert!(registry.linked(a, b));
        assert!(registry.linked(b, a));
        assert_eq!(registry.get_links(a), vec![b]);
        assert_eq!(registry.get_links(b), vec![a]);

        registry.unlink(b, a);
        assert!(!registry.linked(a, b));
        assert!(!registry.linked(b, a));
    }

    #[test]
    fn test_self_link_is_noop() {
        let registry = LinkRegistry::new();
        let a = Pid::new();
        registry.link(a, a);
        assert!(registry.get_links(a).is_empty());
    }

    #[test]
    fn test_monitor_appears_in_both_indices() {
        let registry = LinkRegistry::new();
        let watcher = Pid::new();
        let watched = Pid::new();

        let reference = registry.monitor(watcher, watched);
        assert_eq!(registry.monitors_of(watcher), vec![reference.clone()]);
        assert_eq!(registry.watchers_of(watched), vec![reference.clone()]);

        assert!(registry.demonitor(&reference));
        assert!(registry.monitors_of(watcher).is_empty());
        assert!(registry.watchers_of(watched).is_empty());
        assert!(!registry.demonitor(&reference));
    }

    #[test]
    fn test_trap_exit_toggling() {
        let registry = LinkRegistry::new();
        let pid = Pid::new();

        assert!(!registry.traps_exit(pid));
        registry.trap_exit(pid, true);
        assert!(registry.traps_exit(pid));
        registry.trap_exit(pid, false);
        assert!(!registry.traps_exit(pid));
    }

    #[test]
    fn test_cleanup_returns_fanout_sets() {
        let registry = LinkRegistry::new();
        let dying = Pid::new();
        let peer = Pid::new();
        let watcher = Pid::new();
        let watched_elsewhere = Pid::new();

        registry.link(dying, peer);
        let watching_ref = registry.monitor(watcher, dying);
        registry.monitor(dying, watched_elsewhere);
        registry.trap_exit(dying, true);

        let (linked, watchers) = registry.cleanup(dying);
        assert_eq!(linked, vec![peer]);
        assert_eq!(watchers, vec![watching_ref]);

        // Every trace of the dying process is gone
        assert!(registry.get_links(peer).is_empty());
        assert!(registry.watchers_of(watched_elsewhere).is_empty());
        assert!(!registry.traps_exit(dying));
    }
}
