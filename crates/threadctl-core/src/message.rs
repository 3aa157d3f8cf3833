//! Controller message queue.
//!
//! Messages are point-to-point items placed directly in one controller's
//! queue. Each tag has its own min-heap keyed on `(priority, sequence)`:
//! lower priority values come out first, equal priorities in send order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use serde_json::Value;
use tracing::trace;

/// Tag under which queued remote calls are drained by schedulers.
pub const EXECUTE_TAG: &str = "control.execute";

/// A callable travelling through a message queue.
pub struct QueuedCall(Box<dyn FnOnce() + Send + 'static>);

impl QueuedCall {
    pub(crate) fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Run the call on the current thread.
    pub fn run(self) {
        (self.0)()
    }
}

impl std::fmt::Debug for QueuedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("QueuedCall")
    }
}

/// Message payload.
#[derive(Debug)]
pub enum Payload {
    /// Plain data.
    Value(Value),
    /// Remote call placed with an explicit tag.
    Call(QueuedCall),
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

/// A queued message.
#[derive(Debug)]
pub struct Message {
    /// Message tag.
    pub tag: String,

    /// Priority (lower is delivered first).
    pub priority: i32,

    /// Arrival order within the controller.
    pub sequence: u64,

    /// Message payload.
    pub payload: Payload,
}

impl Message {
    /// Get the data value, if this is not a call.
    pub fn value(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Value(v) => Some(v),
            Payload::Call(_) => None,
        }
    }

    /// Consume the message into its data value.
    pub fn into_value(self) -> Option<Value> {
        match self.payload {
            Payload::Value(v) => Some(v),
            Payload::Call(_) => None,
        }
    }

    /// Run the message if it carries a call; returns whether it did.
    pub fn execute(self) -> bool {
        match self.payload {
            Payload::Call(call) => {
                call.run();
                true
            }
            Payload::Value(_) => false,
        }
    }
}

/// Heap entry: reversed so the max-heap pops the smallest key first.
struct Queued(Message);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.sequence == other.0.sequence
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .priority
            .cmp(&self.0.priority)
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

/// Per-tag priority queues plus synchronization tokens.
#[derive(Default)]
pub struct MessageQueue {
    queues: HashMap<String, BinaryHeap<Queued>>,
    sync_tokens: HashMap<String, HashSet<u64>>,
    sequence: u64,
}

impl MessageQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a payload under a tag; returns its sequence number.
    pub fn push(&mut self, tag: &str, payload: Payload, priority: i32) -> u64 {
        self.sequence += 1;
        let sequence = self.sequence;
        trace!(tag, priority, sequence, "MessageQueue: push");
        self.queues
            .entry(tag.to_string())
            .or_default()
            .push(Queued(Message {
                tag: tag.to_string(),
                priority,
                sequence,
                payload,
            }));
        sequence
    }

    /// Pop the first message with the given tag.
    pub fn pop(&mut self, tag: &str) -> Option<Message> {
        let heap = self.queues.get_mut(tag)?;
        let message = heap.pop().map(|q| q.0);
        if heap.is_empty() {
            self.queues.remove(tag);
        }
        message
    }

    /// Number of messages queued under a tag.
    pub fn len_of(&self, tag: &str) -> usize {
        self.queues.get(tag).map_or(0, BinaryHeap::len)
    }

    /// Total number of queued messages.
    pub fn len(&self) -> usize {
        self.queues.values().map(BinaryHeap::len).sum()
    }

    /// Check if no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Record a synchronization token.
    pub fn push_sync(&mut self, tag: &str, uid: u64) {
        self.sync_tokens
            .entry(tag.to_string())
            .or_default()
            .insert(uid);
    }

    /// Consume a synchronization token if present.
    pub fn take_sync(&mut self, tag: &str, uid: u64) -> bool {
        let Some(tokens) = self.sync_tokens.get_mut(tag) else {
            return false;
        };
        let found = tokens.remove(&uid);
        if tokens.is_empty() {
            self.sync_tokens.remove(tag);
        }
        found
    }

    /// Remove everything; returns the dropped messages.
    pub fn drain(&mut self) -> Vec<Message> {
        self.sync_tokens.clear();
        self.queues
            .drain()
            .flat_map(|(_, heap)| heap.into_vec().into_iter().map(|q| q.0))
            .collect()
    }
}
