//! Multi-priority reduction scheduler
//!
//! Four containers, and every live process is in exactly one of them:
//! the priority run queues, the waiting set, the deadline-ordered timed
//! waits, and the blocked-on-send set. The process being sliced is
//! considered to occupy its run queue slot.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::bytecode::Value;
use crate::runtime::mailbox::{matches, Message};
use crate::runtime::process::{ProcessTable, WaitKind};
use crate::types::{Pid, Priority, ProcessState};

/// Priority run queues plus the waiting, timed-waiting and blocked sets.
pub struct Scheduler {
    run_queues: [VecDeque<Pid>; 4],
    waiting: HashSet<Pid>,
    timed_waiting: BTreeSet<(Instant, Pid)>,
    deadlines: HashMap<Pid, Instant>,
    blocked: HashSet<Pid>,
    table: Arc<ProcessTable>,
}

impl Scheduler {
    /// Create a scheduler over a process table.
    pub fn new(table: Arc<ProcessTable>) -> Self {
        Scheduler {
            run_queues: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            waiting: HashSet::new(),
            timed_waiting: BTreeSet::new(),
            deadlines: HashMap::new(),
            blocked: HashSet::new(),
            table,
        }
    }

    /// Place a process in the queue matching its state.
    pub fn enqueue(&mut self, pid: Pid) {
        let Some(handle) = self.table.get(pid) else {
            return;
        };
        let (state, priority, deadline) = {
            let process = handle.read();
            let deadline = match (process.waiting_since, process.waiting_timeout) {
                (Some(since), Some(timeout)) => Some(since + timeout),
                _ => None,
            };
            (process.state, process.priority, deadline)
        };
        match state {
            ProcessState::Alive | ProcessState::Stale => self.push_runnable(pid, priority),
            ProcessState::Waiting => self.park_waiting(pid, deadline),
            ProcessState::Blocked => self.block_on_send(pid),
            ProcessState::Dead => {}
        }
    }

    /// Pop the head of the highest non-empty priority queue.
    pub fn next_runnable(&mut self) -> Option<Pid> {
        for priority in Priority::descending() {
            while let Some(pid) = self.run_queues[priority.index()].pop_front() {
                match self.table.get(pid) {
                    Some(handle) if handle.state() == ProcessState::Alive => return Some(pid),
                    Some(_) | None => {
                        // Stale entry from a racing exit; drop it
                        debug!(pid = pid.raw(), "dropping stale run queue entry");
                    }
                }
            }
        }
        None
    }

    /// Wake a process: remove it from any waiting set, clear its waiting
    /// fields, set it alive and queue it to run.
    pub fn make_runnable(&mut self, pid: Pid) {
        let Some(handle) = self.table.get(pid) else {
            return;
        };
        self.remove_from_parked(pid);
        let priority = {
            let mut process = handle.write();
            if process.state == ProcessState::Dead {
                return;
            }
            process.clear_waiting();
            process.state = ProcessState::Alive;
            process.priority
        };
        self.push_runnable(pid, priority);
    }

    /// Park a process waiting for a message, with an optional deadline.
    pub fn park_waiting(&mut self, pid: Pid, deadline: Option<Instant>) {
        self.remove_everywhere(pid);
        match deadline {
            Some(deadline) => {
                self.timed_waiting.insert((deadline, pid));
                self.deadlines.insert(pid, deadline);
            }
            None => {
                self.waiting.insert(pid);
            }
        }
    }

    /// Park a process blocked on a full target mailbox.
    pub fn block_on_send(&mut self, pid: Pid) {
        self.remove_everywhere(pid);
        self.blocked.insert(pid);
    }

    /// Wake every timed wait past its deadline.
    ///
    /// Receives armed with a timeout indicator get `Null` and `false`
    /// pushed and are stepped past the receive opcode; sleeps simply wake.
    pub fn check_timeouts(&mut self) -> Vec<Pid> {
        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some(&(deadline, pid)) = self.timed_waiting.iter().next() {
            if deadline > now {
                break;
            }
            self.timed_waiting.remove(&(deadline, pid));
            self.deadlines.remove(&pid);
            expired.push(pid);
        }

        let mut woken = Vec::new();
        for pid in expired {
            let Some(handle) = self.table.get(pid) else {
                continue;
            };
            let priority = {
                let mut process = handle.write();
                if process.state != ProcessState::Waiting {
                    continue;
                }
                if let Some(WaitKind::Receive {
                    timeout_result: true,
                    ..
                }) = process.waiting
                {
                    // The receive rewound its counter when parking; deliver
                    // the timeout indicator and step past it.
                    process.stack.push(Value::Null);
                    process.stack.push(Value::Bool(false));
                    process.ip += 1;
                }
                process.clear_waiting();
                process.state = ProcessState::Alive;
                process.priority
            };
            self.push_runnable(pid, priority);
            woken.push(pid);
        }
        woken
    }

    /// Retry every parked send. Entries whose target died are abandoned;
    /// senders whose queue drains completely become runnable again.
    ///
    /// Returns `(receiver, message)` pairs for successful deliveries so the
    /// caller can run receiver wakeups without holding sender locks.
    pub fn check_blocked(&mut self) -> Vec<(Pid, Message)> {
        let mut delivered = Vec::new();
        let blocked: Vec<Pid> = self.blocked.iter().copied().collect();
        for pid in blocked {
            let Some(handle) = self.table.get(pid) else {
                self.blocked.remove(&pid);
                continue;
            };
            let (drained, priority) = {
                let mut process = handle.write();
                let mut remaining = VecDeque::new();
                while let Some((target, message)) = process.blocked_sends.pop_front() {
                    if !self.table.is_alive(target) {
                        // Target died; the send is abandoned
                        debug!(
                            sender = pid.raw(),
                            target = target.raw(),
                            "abandoning blocked send to dead process"
                        );
                        continue;
                    }
                    let accepted = self
                        .table
                        .mailbox(target)
                        .map(|mailbox| mailbox.lock().push(message.clone()))
                        .unwrap_or(false);
                    if accepted {
                        delivered.push((target, message));
                    } else {
                        remaining.push_back((target, message));
                    }
                }
                process.blocked_sends = remaining;
                let drained = process.blocked_sends.is_empty();
                if drained {
                    process.state = ProcessState::Alive;
                    process.dependencies.clear();
                }
                (drained, process.priority)
            };
            if drained {
                self.blocked.remove(&pid);
                self.push_runnable(pid, priority);
            }
        }
        delivered
    }

    /// Wake a waiting receiver if the delivered message satisfies its
    /// waiting predicate. Matcher-based waits wake unconditionally and
    /// re-scan when they run.
    pub fn notify_message_delivered(&mut self, receiver: Pid, message: &Message) {
        if !self.waiting.contains(&receiver) && !self.deadlines.contains_key(&receiver) {
            return;
        }
        let Some(handle) = self.table.get(receiver) else {
            return;
        };
        let should_wake = {
            let process = handle.read();
            match &process.waiting {
                Some(WaitKind::Receive {
                    pattern, matcher, ..
                }) => match (pattern, matcher) {
                    (Some(pattern), _) => matches(&message.value, pattern),
                    (None, Some(_)) => true,
                    (None, None) => true,
                },
                Some(WaitKind::Sleep) | None => false,
            }
        };
        if should_wake {
            self.make_runnable(receiver);
        }
    }

    /// Drop a process from every queue.
    pub fn mark_dead(&mut self, pid: Pid) {
        self.remove_everywhere(pid);
    }

    /// Re-queue a process at the tail of its priority queue.
    pub fn yield_process(&mut self, pid: Pid) {
        let Some(handle) = self.table.get(pid) else {
            return;
        };
        if handle.state() == ProcessState::Alive {
            let priority = handle.priority();
            self.push_runnable(pid, priority);
        }
    }

    /// Whether any process is parked waiting, timed-waiting or blocked.
    pub fn has_parked_work(&self) -> bool {
        !self.waiting.is_empty() || !self.timed_waiting.is_empty() || !self.blocked.is_empty()
    }

    /// Whether any run queue is non-empty.
    pub fn has_runnable(&self) -> bool {
        self.run_queues.iter().any(|queue| !queue.is_empty())
    }

    /// Pids currently parked in a waiting state (timed or not).
    pub fn waiting_pids(&self) -> Vec<Pid> {
        self.waiting
            .iter()
            .copied()
            .chain(self.deadlines.keys().copied())
            .collect()
    }

    /// Pids currently blocked on sends.
    pub fn blocked_pids(&self) -> Vec<Pid> {
        self.blocked.iter().copied().collect()
    }

    fn push_runnable(&mut self, pid: Pid, priority: Priority) {
        let queue = &mut self.run_queues[priority.index()];
        if !queue.contains(&pid) {
            queue.push_back(pid);
        } else {
            warn!(pid = pid.raw(), "process already queued; skipping enqueue");
        }
    }

    fn remove_from_parked(&mut self, pid: Pid) {
        self.waiting.remove(&pid);
        self.blocked.remove(&pid);
        if let Some(deadline) = self.deadlines.remove(&pid) {
            self.timed_waiting.remove(&(deadline, pid));
        }
    }

    fn remove_everywhere(&mut self, pid: Pid) {
        for queue in &mut self.run_queues {
            queue.retain(|queued| *queued != pid);
        }
        self.remove_from_parked(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    fn setup() -> (Arc<ProcessTable>, Scheduler) {
        let table = Arc::new(ProcessTable::new(100, 100));
        let scheduler = Scheduler::new(Arc::clone(&table));
        (table, scheduler)
    }

    fn spawn(table: &ProcessTable, priority: Priority) -> Pid {
        table
            .create(
                vec![],
                StdHashMap::new(),
                StdHashMap::new(),
                priority,
                None,
            )
            .unwrap()
    }

    #[test]
    fn test_priority_order() {
        let (table, mut scheduler) = setup();
        let low = spawn(&table, Priority::Low);
        let normal = spawn(&table, Priority::Normal);
        let max = spawn(&table, Priority::Max);

        scheduler.enqueue(low);
        scheduler.enqueue(normal);
        scheduler.enqueue(max);

        assert_eq!(scheduler.next_runnable(), Some(max));
        assert_eq!(scheduler.next_runnable(), Some(normal));
        assert_eq!(scheduler.next_runnable(), Some(low));
        assert_eq!(scheduler.next_runnable(), None);
    }

    #[test]
    fn test_fifo_within_priority() {
        let (table, mut scheduler) = setup();
        let first = spawn(&table, Priority::Normal);
        let second = spawn(&table, Priority::Normal);

        scheduler.enqueue(first);
        scheduler.enqueue(second);
        assert_eq!(scheduler.next_runnable(), Some(first));
        scheduler.yield_process(first);
        assert_eq!(scheduler.next_runnable(), Some(second));
        assert_eq!(scheduler.next_runnable(), Some(first));
    }

    #[test]
    fn test_wait_and_wake() {
        let (table, mut scheduler) = setup();
        let pid = spawn(&table, Priority::Normal);
        {
            let handle = table.get(pid).unwrap();
            handle.write().park_receiving(
                WaitKind::Receive {
                    pattern: None,
                    matcher: None,
                    timeout_result: false,
                },
                None,
            );
        }
        scheduler.enqueue(pid);
        assert_eq!(scheduler.next_runnable(), None);
        assert!(scheduler.has_parked_work());

        let message = Message::new(Pid::new(), Value::Int(1));
        scheduler.notify_message_delivered(pid, &message);
        assert_eq!(scheduler.next_runnable(), Some(pid));
        assert_eq!(table.get(pid).unwrap().state(), ProcessState::Alive);
    }

    #[test]
    fn test_pattern_gated_wake() {
        let (table, mut scheduler) = setup();
        let pid = spawn(&table, Priority::Normal);
        {
            let handle = table.get(pid).unwrap();
            handle.write().park_receiving(
                WaitKind::Receive {
                    pattern: Some(Value::Int(42)),
                    matcher: None,
                    timeout_result: false,
                },
                None,
            );
        }
        scheduler.enqueue(pid);

        scheduler.notify_message_delivered(pid, &Message::new(Pid::new(), Value::Int(1)));
        assert_eq!(scheduler.next_runnable(), None);

        scheduler.notify_message_delivered(pid, &Message::new(Pid::new(), Value::Int(42)));
        assert_eq!(scheduler.next_runnable(), Some(pid));
    }

    #[test]
    fn test_timeout_pushes_indicator() {
        let (table, mut scheduler) = setup();
        let pid = spawn(&table, Priority::Normal);
        {
            let handle = table.get(pid).unwrap();
            let mut process = handle.write();
            process.ip = 5;
            process.park_receiving(
                WaitKind::Receive {
                    pattern: None,
                    matcher: None,
                    timeout_result: true,
                },
                Some(Duration::ZERO),
            );
        }
        scheduler.enqueue(pid);

        std::thread::sleep(Duration::from_millis(2));
        let woken = scheduler.check_timeouts();
        assert_eq!(woken, vec![pid]);

        let handle = table.get(pid).unwrap();
        let process = handle.read();
        assert_eq!(process.state, ProcessState::Alive);
        assert_eq!(process.ip, 6);
        assert_eq!(
            process.stack,
            vec![Value::Null, Value::Bool(false)]
        );
    }

    #[test]
    fn test_mark_dead_removes_from_queues() {
        let (table, mut scheduler) = setup();
        let pid = spawn(&table, Priority::High);
        scheduler.enqueue(pid);
        scheduler.mark_dead(pid);
        assert_eq!(scheduler.next_runnable(), None);
        assert!(!scheduler.has_runnable());
    }

    #[test]
    fn test_blocked_send_drains_when_target_dies() {
        let (table, mut scheduler) = setup();
        let sender = spawn(&table, Priority::Normal);
        let target = spawn(&table, Priority::Normal);
        {
            let handle = table.get(sender).unwrap();
            let mut process = handle.write();
            process.state = ProcessState::Blocked;
            process
                .blocked_sends
                .push_back((target, Message::new(sender, Value::Int(1))));
        }
        scheduler.block_on_send(sender);
        table.get(target).unwrap().write().mark_dead(crate::types::ExitReason::Normal);

        let delivered = scheduler.check_blocked();
        assert!(delivered.is_empty());
        assert_eq!(scheduler.next_runnable(), Some(sender));
    }
}
