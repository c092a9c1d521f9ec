//! Per-process message queues with pattern-selective reads

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bytecode::Value;
use crate::types::{now_millis, Pid};

/// Delivery status carried by an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    /// Placed into the target mailbox
    Delivered,
    /// Consumed by the receiver
    Processed,
    /// Refused by the receiver
    Rejected,
    /// TTL expired before delivery
    TimedOut,
}

/// Acknowledgment posted back to a sender when acks are enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acknowledgment {
    /// Id of the acknowledged message
    pub message_id: u64,
    /// The process that received it
    pub receiver: Pid,
    /// What happened to it
    pub status: AckStatus,
}

/// A message in flight between processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Monotonic message id
    pub id: u64,
    /// Sending process
    pub from: Pid,
    /// Payload
    pub value: Value,
    /// Sender expects an acknowledgment
    pub needs_ack: bool,
    /// Send timestamp, milliseconds since the epoch
    pub timestamp: u64,
    /// Optional time-to-live
    pub ttl: Option<Duration>,
}

impl Message {
    /// Build a message with a fresh id.
    pub fn new(from: Pid, value: Value) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Message {
            id: COUNTER.fetch_add(1, Ordering::SeqCst),
            from,
            value,
            needs_ack: false,
            timestamp: now_millis(),
            ttl: None,
        }
    }

    /// Set a time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Request an acknowledgment on delivery.
    pub fn with_ack(mut self) -> Self {
        self.needs_ack = true;
        self
    }

    /// Whether the TTL has lapsed at the given time.
    pub fn is_expired(&self, now: u64) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_sub(self.timestamp) > ttl.as_millis() as u64,
            None => false,
        }
    }
}

/// Match a message value against a receive pattern.
///
/// A `Null` pattern matches anything. A map pattern matches a map value iff
/// every pattern key is present in the value and the pattern's entry is
/// either `Null` (wildcard) or equal to the value's entry. Anything else
/// matches by structural equality.
pub fn matches(value: &Value, pattern: &Value) -> bool {
    match pattern {
        Value::Null => true,
        Value::Map(pattern_entries) => match value {
            Value::Map(entries) => pattern_entries.iter().all(|(key, expected)| {
                match entries.get(key) {
                    Some(actual) => *expected == Value::Null || expected == actual,
                    None => false,
                }
            }),
            _ => false,
        },
        other => value == other,
    }
}

/// FIFO message queue with a capacity, TTL sweeping and selective reads.
#[derive(Debug)]
pub struct Mailbox {
    messages: VecDeque<Message>,
    acks: VecDeque<Acknowledgment>,
    capacity: usize,
    stats: MailboxStats,
}

/// Counters kept by each mailbox.
#[derive(Debug, Default, Clone)]
pub struct MailboxStats {
    /// Messages accepted by `push`
    pub messages_received: u64,
    /// Messages removed by `shift`, `select` or `remove_at`
    pub messages_consumed: u64,
    /// Pushes refused because the queue was full
    pub overflows: u64,
    /// Messages dropped by TTL cleanup
    pub expired: u64,
}

impl Mailbox {
    /// Create a mailbox with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Mailbox {
            messages: VecDeque::new(),
            acks: VecDeque::new(),
            capacity,
            stats: MailboxStats::default(),
        }
    }

    /// Append a message. Returns false without inserting when full.
    pub fn push(&mut self, message: Message) -> bool {
        if self.messages.len() >= self.capacity {
            self.stats.overflows += 1;
            return false;
        }
        self.messages.push_back(message);
        self.stats.messages_received += 1;
        true
    }

    /// Remove and return the oldest message.
    pub fn shift(&mut self) -> Option<Message> {
        let message = self.messages.pop_front();
        if message.is_some() {
            self.stats.messages_consumed += 1;
        }
        message
    }

    /// Clone the oldest message without removing it.
    pub fn peek(&self) -> Option<Message> {
        self.messages.front().cloned()
    }

    /// Remove and return the first message whose value matches the pattern.
    pub fn select(&mut self, pattern: &Value) -> Option<Message> {
        let position = self
            .messages
            .iter()
            .position(|m| matches(&m.value, pattern))?;
        self.stats.messages_consumed += 1;
        self.messages.remove(position)
    }

    /// Remove the message at the given queue position.
    pub fn remove_at(&mut self, index: usize) -> Option<Message> {
        let message = self.messages.remove(index);
        if message.is_some() {
            self.stats.messages_consumed += 1;
        }
        message
    }

    /// Read-only view of the queued messages, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Drop messages whose TTL has lapsed, returning how many were removed.
    pub fn cleanup_expired_messages(&mut self) -> usize {
        let now = now_millis();
        let before = self.messages.len();
        self.messages.retain(|m| !m.is_expired(now));
        let removed = before - self.messages.len();
        self.stats.expired += removed as u64;
        removed
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether another push would be refused.
    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.capacity
    }

    /// Discard all queued messages and acknowledgments.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.acks.clear();
    }

    /// Queue an acknowledgment for the owning process.
    pub fn push_ack(&mut self, ack: Acknowledgment) {
        self.acks.push_back(ack);
    }

    /// Remove and return the oldest acknowledgment.
    pub fn shift_ack(&mut self) -> Option<Acknowledgment> {
        self.acks.pop_front()
    }

    /// Mailbox counters.
    pub fn stats(&self) -> &MailboxStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(value: Value) -> Message {
        Message::new(Pid::new(), value)
    }

    #[test]
    fn test_push_shift_fifo() {
        let mut mailbox = Mailbox::with_capacity(10);
        assert!(mailbox.push(msg(Value::Int(1))));
        assert!(mailbox.push(msg(Value::Int(2))));
        assert_eq!(mailbox.shift().unwrap().value, Value::Int(1));
        assert_eq!(mailbox.shift().unwrap().value, Value::Int(2));
        assert!(mailbox.shift().is_none());
    }

    #[test]
    fn test_push_refuses_when_full() {
        let mut mailbox = Mailbox::with_capacity(1);
        assert!(mailbox.push(msg(Value::Int(1))));
        assert!(!mailbox.push(msg(Value::Int(2))));
        assert_eq!(mailbox.len(), 1);
        assert_eq!(mailbox.stats().overflows, 1);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut mailbox = Mailbox::with_capacity(10);
        mailbox.push(msg(Value::Str("head".to_string())));
        assert_eq!(mailbox.peek().unwrap().value, Value::Str("head".to_string()));
        assert_eq!(mailbox.len(), 1);
    }

    #[test]
    fn test_null_pattern_matches_anything() {
        assert!(matches(&Value::Int(7), &Value::Null));
        assert!(matches(&Value::Str("x".to_string()), &Value::Null));
    }

    #[test]
    fn test_map_pattern_subset_with_wildcards() {
        let value = Value::map_from(vec![
            ("signal", Value::Str("DOWN".to_string())),
            ("process", Value::Uint(9)),
        ]);
        let pattern = Value::map_from(vec![
            ("signal", Value::Str("DOWN".to_string())),
            ("process", Value::Null),
        ]);
        assert!(matches(&value, &pattern));

        let wrong = Value::map_from(vec![("signal", Value::Str("EXIT".to_string()))]);
        assert!(!matches(&value, &wrong));

        let missing_key = Value::map_from(vec![("ref", Value::Null)]);
        assert!(!matches(&value, &missing_key));
    }

    #[test]
    fn test_select_removes_first_match_only() {
        let mut mailbox = Mailbox::with_capacity(10);
        mailbox.push(msg(Value::Str("skip".to_string())));
        mailbox.push(msg(Value::Int(1)));
        mailbox.push(msg(Value::Int(2)));

        let selected = mailbox.select(&Value::Int(2)).unwrap();
        assert_eq!(selected.value, Value::Int(2));
        assert_eq!(mailbox.len(), 2);

        assert!(mailbox.select(&Value::Int(99)).is_none());
        assert_eq!(mailbox.len(), 2);
    }

    #[test]
    fn test_cleanup_expired() {
        let mut mailbox = Mailbox::with_capacity(10);
        let mut stale = msg(Value::Int(1));
        stale.timestamp = now_millis().saturating_sub(60_000);
        stale.ttl = Some(Duration::from_secs(1));
        mailbox.push(stale);
        mailbox.push(msg(Value::Int(2)));

        assert_eq!(mailbox.cleanup_expired_messages(), 1);
        assert_eq!(mailbox.len(), 1);
        assert_eq!(mailbox.shift().unwrap().value, Value::Int(2));
    }

    #[test]
    fn test_ack_queue() {
        let mut mailbox = Mailbox::with_capacity(10);
        mailbox.push_ack(Acknowledgment {
            message_id: 1,
            receiver: Pid::new(),
            status: AckStatus::Delivered,
        });
        let ack = mailbox.shift_ack().unwrap();
        assert_eq!(ack.status, AckStatus::Delivered);
        assert!(mailbox.shift_ack().is_none());
    }
}
