//! Bounded work queue for attempts that arrive while every slot is busy.
//!
//! Higher priority drains first; equal priorities drain in arrival order.
//! Priority only orders the queue, it never preempts a running task.
//! One waiting attempt per task id: a second one is coalesced.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use tradeflow_core::OverflowPolicy;

/// An attempt waiting for a free slot.
#[derive(Debug, Clone)]
pub struct QueuedAttempt {
    pub task_id: String,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    seq: u64,
}

impl PartialEq for QueuedAttempt {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedAttempt {}

impl Ord for QueuedAttempt {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (older) first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedAttempt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of offering an attempt to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// Accepted; carries the queue length after insertion.
    Queued(usize),
    Full,
    Duplicate,
}

pub struct WorkQueue {
    heap: BinaryHeap<QueuedAttempt>,
    members: HashSet<String>,
    capacity: usize,
    next_seq: u64,
    total_dequeued: u64,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            members: HashSet::new(),
            capacity,
            next_seq: 0,
            total_dequeued: 0,
        }
    }

    pub fn push(&mut self, task_id: &str, priority: i32) -> Enqueue {
        if self.members.contains(task_id) {
            return Enqueue::Duplicate;
        }
        if self.heap.len() >= self.capacity {
            return Enqueue::Full;
        }
        self.members.insert(task_id.to_string());
        self.heap.push(QueuedAttempt {
            task_id: task_id.to_string(),
            priority,
            queued_at: Utc::now(),
            seq: self.next_seq,
        });
        self.next_seq += 1;
        tracing::debug!(
            "📥 Queue enqueue: {} (priority {}, queued {})",
            task_id,
            priority,
            self.heap.len()
        );
        Enqueue::Queued(self.heap.len())
    }

    pub fn pop(&mut self) -> Option<QueuedAttempt> {
        let attempt = self.heap.pop()?;
        self.members.remove(&attempt.task_id);
        self.total_dequeued += 1;
        Some(attempt)
    }

    /// Drop any waiting attempt for `task_id`.
    pub fn remove(&mut self, task_id: &str) -> bool {
        if !self.members.remove(task_id) {
            return false;
        }
        self.heap.retain(|a| a.task_id != task_id);
        true
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.members.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.heap.len(),
            capacity: self.capacity,
            total_dequeued: self.total_dequeued,
        }
    }
}

/// Work queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub capacity: usize,
    pub total_dequeued: u64,
}
