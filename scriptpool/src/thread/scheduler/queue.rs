use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use crate::thread::task::{TaskId, TaskPriority, TaskRef};

/// Ordering key: higher priority first, then lower submission sequence.
type QueueKey = (Reverse<TaskPriority>, u64);

/// A task waiting in the scheduler, with its effective priority.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: TaskRef,
    /// Starts at the task's own priority and rises with aging
    pub priority: TaskPriority,
    /// Submission sequence; kept across promotions
    pub sequence: u64,
    /// When the task entered the queue or was last promoted
    pub since: Instant,
}

impl QueuedTask {
    fn key(&self) -> QueueKey {
        (Reverse(self.priority), self.sequence)
    }
}

/// Stable priority queue for pending tasks.
///
/// Tasks of equal priority come out in submission order. Lookups by id
/// support cancellation of a queued task.
#[derive(Default)]
pub struct PriorityQueue {
    entries: BTreeMap<QueueKey, QueuedTask>,
    index: HashMap<TaskId, QueueKey>,
    next_sequence: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue at the task's own priority. A task already queued is left
    /// where it is.
    pub fn push(&mut self, task: TaskRef) -> bool {
        if self.index.contains_key(&task.id()) {
            return false;
        }
        let entry = QueuedTask {
            priority: task.priority(),
            sequence: self.next_sequence,
            since: Instant::now(),
            task,
        };
        self.next_sequence += 1;
        self.insert(entry);
        true
    }

    pub fn pop(&mut self) -> Option<QueuedTask> {
        let (_, entry) = self.entries.pop_first()?;
        self.index.remove(&entry.task.id());
        Some(entry)
    }

    /// Put back an entry returned by `pop`, at its original position.
    pub fn reinsert(&mut self, entry: QueuedTask) {
        self.insert(entry);
    }

    pub fn peek(&self) -> Option<&QueuedTask> {
        self.entries.values().next()
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<QueuedTask> {
        let key = self.index.remove(id)?;
        self.entries.remove(&key)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every entry out, in dispatch order.
    pub fn drain(&mut self) -> Vec<QueuedTask> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Promote every non-`High` entry that has waited at least `bound` since
    /// it was queued or last promoted. Returns how many were promoted.
    pub fn promote_aged(&mut self, bound: Duration, now: Instant) -> usize {
        let aged: Vec<QueueKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.priority < TaskPriority::High
                    && now.saturating_duration_since(entry.since) >= bound
            })
            .map(|(key, _)| *key)
            .collect();

        for key in &aged {
            if let Some(mut entry) = self.entries.remove(key) {
                entry.priority = entry.priority.promoted();
                entry.since = now;
                self.insert(entry);
            }
        }
        aged.len()
    }

    fn insert(&mut self, entry: QueuedTask) {
        let key = entry.key();
        self.index.insert(entry.task.id(), key);
        self.entries.insert(key, entry);
    }
}

impl fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.entries.len())
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}
