//! Keyed job queue.
//!
//! Items are FIFO per key. A key handed out by [`KeyedQueue::next_ready`]
//! stays in flight until [`KeyedQueue::complete`] is called, and no other
//! item for that key is handed out meanwhile. Items for different keys are
//! handed out round-robin so one busy document cannot starve the others.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use thiserror::Error;

/// Error type for queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Queue is at capacity.
    #[error("queue full (capacity: {capacity})")]
    Full {
        /// Current queue capacity.
        capacity: usize,
    },
}

/// FIFO-per-key queue with in-flight tracking.
#[derive(Debug)]
pub struct KeyedQueue<K, T> {
    capacity: usize,
    queues: HashMap<K, VecDeque<T>>,
    /// Keys with queued items, in the order they will be considered.
    order: VecDeque<K>,
    in_flight: HashSet<K>,
    len: usize,
}

impl<K, T> KeyedQueue<K, T>
where
    K: Hash + Eq + Clone,
{
    /// Create a queue holding at most `capacity` waiting items.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queues: HashMap::new(),
            order: VecDeque::new(),
            in_flight: HashSet::new(),
            len: 0,
        }
    }

    /// Add an item behind every earlier item with the same key.
    pub fn enqueue(&mut self, key: K, item: T) -> Result<(), QueueError> {
        if self.len >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        let queue = self.queues.entry(key.clone()).or_default();
        if queue.is_empty() {
            self.order.push_back(key);
        }
        queue.push_back(item);
        self.len += 1;
        Ok(())
    }

    /// Take the oldest item of the first key that is not in flight.
    ///
    /// The key is marked in flight until [`complete`](Self::complete).
    pub fn next_ready(&mut self) -> Option<(K, T)> {
        let position = self
            .order
            .iter()
            .position(|key| !self.in_flight.contains(key))?;
        let key = self.order.remove(position)?;
        let queue = self.queues.get_mut(&key)?;
        let item = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(&key);
        } else {
            self.order.push_back(key.clone());
        }
        self.len -= 1;
        self.in_flight.insert(key.clone());
        Some((key, item))
    }

    /// Release a key handed out by `next_ready`.
    ///
    /// Returns false when the key was not in flight.
    pub fn complete(&mut self, key: &K) -> bool {
        self.in_flight.remove(key)
    }

    /// Check whether an item for `key` is currently being processed.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.contains(key)
    }

    /// Number of items waiting for `key`.
    pub fn pending_for(&self, key: &K) -> usize {
        self.queues.get(key).map_or(0, VecDeque::len)
    }

    /// Number of waiting items (not including in-flight ones).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if no items are waiting.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of keys currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// True when nothing is waiting and nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.is_empty() && self.in_flight.is_empty()
    }

    /// Remove every waiting item, oldest key first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.len);
        while let Some(key) = self.order.pop_front() {
            if let Some(queue) = self.queues.remove(&key) {
                items.extend(queue);
            }
        }
        self.len = 0;
        items
    }
}
