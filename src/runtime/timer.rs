//! Deadline-ordered delayed message delivery

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::runtime::mailbox::Message;
use crate::types::Pid;

/// A pending delayed send.
#[derive(Debug, Clone)]
pub struct TimerEntry {
    /// Timer reference returned by `SEND_AFTER`
    pub id: u64,
    /// Delivery target
    pub target: Pid,
    /// The message to deliver
    pub message: Message,
    /// When it becomes due
    pub deadline: Instant,
}

/// Deadline-ordered set of pending messages.
///
/// One structure serves every delayed-delivery path, keyed by timer
/// reference so `CANCEL_TIMER` can remove entries before they fire.
pub struct TimerManager {
    entries: BTreeMap<(Instant, u64), TimerEntry>,
    by_id: HashMap<u64, Instant>,
}

impl TimerManager {
    /// Create an empty timer set.
    pub fn new() -> Self {
        TimerManager {
            entries: BTreeMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Schedule a message for delivery after `delay`, returning the timer
    /// reference.
    pub fn schedule(&mut self, target: Pid, message: Message, delay: Duration) -> u64 {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + delay;
        self.entries.insert(
            (deadline, id),
            TimerEntry {
                id,
                target,
                message,
                deadline,
            },
        );
        self.by_id.insert(id, deadline);
        id
    }

    /// Cancel a pending timer. Returns false when the timer already fired
    /// or never existed.
    pub fn cancel(&mut self, id: u64) -> bool {
        match self.by_id.remove(&id) {
            Some(deadline) => self.entries.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    /// Remove and return every entry due at `now`, oldest first.
    pub fn due(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut fired = Vec::new();
        while let Some((&(deadline, id), _)) = self.entries.iter().next() {
            if deadline > now {
                break;
            }
            if let Some(entry) = self.entries.remove(&(deadline, id)) {
                self.by_id.remove(&id);
                fired.push(entry);
            }
        }
        fired
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timers are pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}
