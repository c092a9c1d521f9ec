//! Core types and data structures for Krill

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::bytecode::Value;

/// Process address - unique across the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub u64);

impl Pid {
    /// Mint a new unique process address
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Pid(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw address value
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Create an address from a raw value
    pub fn from_raw(raw: u64) -> Self {
        Pid(raw)
    }
}

impl Default for Pid {
    fn default() -> Self {
        Pid::new()
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Process priority levels.
///
/// Ordering matters: `Max` outranks `High` outranks `Normal` outranks `Low`
/// in the run queues, and the reduction budget scales with priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Background work
    Low = 0,
    /// Default for user processes
    Normal = 1,
    /// Latency-sensitive processes
    High = 2,
    /// System-critical processes
    Max = 3,
}

impl Priority {
    /// Reduction budget for one slice, scaled from the configured base.
    /// Low runs a quarter slice, High double, Max quadruple.
    pub fn reduction_budget(&self, base: u64) -> u64 {
        match self {
            Priority::Low => (base / 4).max(1),
            Priority::Normal => base,
            Priority::High => base * 2,
            Priority::Max => base * 4,
        }
    }

    /// Queue index, lowest priority first.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// All priorities from highest to lowest.
    pub fn descending() -> [Priority; 4] {
        [Priority::Max, Priority::High, Priority::Normal, Priority::Low]
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    /// Runnable or running
    Alive,
    /// Created but not yet enqueued
    Stale,
    /// Parked until a message arrives or a timeout fires
    Waiting,
    /// Parked on a full target mailbox
    Blocked,
    /// Terminated; queue entries removed, exit fan-out pending or done
    Dead,
}

/// Why a process terminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Clean termination
    Normal,
    /// Ordered shutdown, typically by a supervisor
    Shutdown,
    /// Untrappable kill
    Kill,
    /// Linked or monitored a dead or nonexistent process
    InvalidProcess,
    /// Uncaught exception; carries the structured exception value
    Exception(Value),
    /// Arbitrary user-supplied reason
    Custom(Value),
}

impl ExitReason {
    /// Whether a trapping process receives this reason as a message.
    /// Everything except `Kill` is trappable.
    pub fn is_trappable(&self) -> bool {
        !matches!(self, ExitReason::Kill)
    }

    /// Whether this reason counts as a normal exit for restart policies.
    pub fn is_normal(&self) -> bool {
        matches!(self, ExitReason::Normal | ExitReason::Shutdown)
    }

    /// Render the reason as a runtime value for messages and dumps.
    pub fn to_value(&self) -> Value {
        match self {
            ExitReason::Normal => Value::Symbol("normal".to_string()),
            ExitReason::Shutdown => Value::Symbol("shutdown".to_string()),
            ExitReason::Kill => Value::Symbol("kill".to_string()),
            ExitReason::InvalidProcess => Value::Symbol("invalid_process".to_string()),
            ExitReason::Exception(v) => v.clone(),
            ExitReason::Custom(v) => v.clone(),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Shutdown => write!(f, "shutdown"),
            ExitReason::Kill => write!(f, "kill"),
            ExitReason::InvalidProcess => write!(f, "invalid_process"),
            ExitReason::Exception(v) => write!(f, "exception: {}", v),
            ExitReason::Custom(v) => write!(f, "{}", v),
        }
    }
}

/// Monitor reference handed out by `MONITOR`.
///
/// Equality is identity on the reference id, not structural.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct MonitorRef {
    /// Unique reference id
    pub id: u64,
    /// The watching process
    pub watcher: Pid,
    /// The watched process
    pub watched: Pid,
    /// Creation timestamp, milliseconds since the epoch
    pub created_at: u64,
}

impl MonitorRef {
    /// Mint a fresh monitor reference.
    pub fn new(watcher: Pid, watched: Pid) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        MonitorRef {
            id: COUNTER.fetch_add(1, Ordering::SeqCst),
            watcher,
            watched,
            created_at: now_millis(),
        }
    }
}

impl PartialEq for MonitorRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::hash::Hash for MonitorRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Behavior when a send targets a full mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MailboxPolicy {
    /// Park the sender until the target mailbox drains
    Block,
    /// Silently discard the message
    Drop,
    /// Raise `MailboxOverflow` in the sender
    Fail,
}

impl Default for MailboxPolicy {
    fn default() -> Self {
        MailboxPolicy::Block
    }
}

/// Configuration for the Krill engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    /// Maximum number of live processes
    pub max_processes: usize,
    /// Maximum data stack depth per process
    pub max_stack_size: usize,
    /// Maximum messages per mailbox
    pub max_mailbox_size: usize,
    /// Base reduction budget per scheduler slice
    pub max_reductions_per_slice: u64,
    /// Maximum event loop iterations per `run`
    pub iteration_limit: usize,
    /// Default message time-to-live
    pub default_message_ttl: Duration,
    /// Default timeout for `RECEIVE_WITH_TIMEOUT` when none is given
    pub default_receive_timeout: Duration,
    /// What a send does when the target mailbox is full
    pub mailbox_full_behavior: MailboxPolicy,
    /// Post delivery acknowledgments back to senders
    pub enable_message_acknowledgments: bool,
    /// Automatically wake waiting receivers when messages arrive
    pub auto_reactivate_processes: bool,
    /// How often expired messages are swept from mailboxes
    pub message_cleanup_interval: Duration,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_processes: 100,
            max_stack_size: 1000,
            max_mailbox_size: 100,
            max_reductions_per_slice: 4000,
            iteration_limit: 10_000,
            default_message_ttl: Duration::from_secs(30),
            default_receive_timeout: Duration::from_secs(5),
            mailbox_full_behavior: MailboxPolicy::Block,
            enable_message_acknowledgments: false,
            auto_reactivate_processes: true,
            message_cleanup_interval: Duration::from_secs(5),
        }
    }
}

/// Engine statistics
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    /// Total messages accepted by `SEND`
    pub messages_sent: u64,
    /// Messages placed into a mailbox
    pub messages_delivered: u64,
    /// Messages discarded under the `drop` policy or for dead targets
    pub messages_dropped: u64,
    /// Messages removed by TTL cleanup
    pub messages_expired: u64,
    /// Processes created
    pub processes_spawned: u64,
    /// Processes terminated
    pub processes_exited: u64,
    /// Reduction slices executed
    pub context_switches: u64,
    /// Total reductions across all processes
    pub reductions: u64,
    /// Wait-for cycles found by deadlock detection
    pub deadlocks_detected: u64,
    /// Event loop iterations completed
    pub iterations: u64,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_monotonic() {
        let a = Pid::new();
        let b = Pid::new();
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn test_priority_budget_scaling() {
        assert_eq!(Priority::Low.reduction_budget(4000), 1000);
        assert_eq!(Priority::Normal.reduction_budget(4000), 4000);
        assert_eq!(Priority::High.reduction_budget(4000), 8000);
        assert_eq!(Priority::Max.reduction_budget(4000), 16000);
    }

    #[test]
    fn test_exit_reason_trappable() {
        assert!(ExitReason::Normal.is_trappable());
        assert!(ExitReason::Shutdown.is_trappable());
        assert!(!ExitReason::Kill.is_trappable());
    }

    #[test]
    fn test_monitor_ref_identity() {
        let a = Pid::new();
        let b = Pid::new();
        let r1 = MonitorRef::new(a, b);
        let r2 = MonitorRef::new(a, b);
        assert_ne!(r1, r2);
        assert_eq!(r1, r1.clone());
    }

    #[test]
    fn test_config_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.max_processes, 100);
        assert_eq!(config.max_stack_size, 1000);
        assert_eq!(config.max_mailbox_size, 100);
        assert_eq!(config.max_reductions_per_slice, 4000);
        assert_eq!(config.mailbox_full_behavior, MailboxPolicy::Block);
    }
}
