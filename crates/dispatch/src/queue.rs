//! Dual-priority FIFO queue
//!
//! Two ordered sequences of identifiers, `foreground` and `background`, plus a
//! closed flag. Foreground strictly precedes background; order within a class
//! is FIFO. An identifier appears in at most one sequence at a time.
//!
//! The queue holds no lock of its own: the [`Dispatcher`](crate::Dispatcher)
//! mutates it inside its single exclusive section and performs the blocking
//! half of `pop` on its own condition variable. Submissions therefore report
//! whether a waiter has to be woken instead of signalling themselves.

use std::collections::VecDeque;

/// Result of popping from the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop<K> {
    /// Next identifier to dispatch
    Item(K),
    /// Nothing queued; the caller should wait for a new arrival
    Empty,
    /// Queue was shut down; any remaining entries are discarded
    Closed,
}

/// Dual-priority queue with promotion and a shutdown signal
#[derive(Debug)]
pub struct PriorityQueue<K> {
    foreground: VecDeque<K>,
    background: VecDeque<K>,
    closed: bool,
}

impl<K> Default for PriorityQueue<K> {
    fn default() -> Self {
        Self {
            foreground: VecDeque::new(),
            background: VecDeque::new(),
            closed: false,
        }
    }
}

impl<K: PartialEq> PriorityQueue<K> {
    /// Create an empty, open queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id` to the background sequence
    ///
    /// No-op if the queue is closed or `id` is already queued (an id waiting
    /// in foreground is never demoted). Returns `true` when a waiter on `pop`
    /// should be woken.
    pub fn submit_background(&mut self, id: K) -> bool {
        if self.closed || self.contains(&id) {
            return false;
        }
        self.background.push_back(id);
        true
    }

    /// Append `id` to the foreground sequence, promoting it out of background
    ///
    /// No-op if the queue is closed or `id` is already queued in foreground.
    /// A promotion does not wake anyone (a waiter was signalled when the id
    /// first arrived); a new arrival does. Returns `true` when a waiter on
    /// `pop` should be woken.
    pub fn submit_foreground(&mut self, id: K) -> bool {
        if self.closed || self.foreground.contains(&id) {
            return false;
        }

        let promoted = match self.background.iter().position(|queued| *queued == id) {
            Some(index) => {
                self.background.remove(index);
                true
            }
            None => false,
        };

        self.foreground.push_back(id);
        !promoted
    }

    /// Remove and return the next identifier
    ///
    /// Returns [`Pop::Closed`] as soon as the queue is shut down, even if
    /// entries remain.
    pub fn pop(&mut self) -> Pop<K> {
        if self.closed {
            return Pop::Closed;
        }
        match self
            .foreground
            .pop_front()
            .or_else(|| self.background.pop_front())
        {
            Some(id) => Pop::Item(id),
            None => Pop::Empty,
        }
    }

    /// Close the queue and discard unstarted entries
    ///
    /// Idempotent. Returns `true` only for the call that closed the queue;
    /// the caller should then wake every waiter.
    pub fn shutdown(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.foreground.clear();
        self.background.clear();
        true
    }

    /// Check whether `id` is queued in either sequence
    pub fn contains(&self, id: &K) -> bool {
        self.foreground.contains(id) || self.background.contains(id)
    }
}

impl<K> PriorityQueue<K> {
    /// Check whether both sequences are empty
    pub fn is_empty(&self) -> bool {
        self.foreground.is_empty() && self.background.is_empty()
    }

    /// Check whether the queue has been shut down
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Total number of queued identifiers
    pub fn len(&self) -> usize {
        self.foreground.len() + self.background.len()
    }

    /// Number of identifiers queued in foreground
    pub fn foreground_len(&self) -> usize {
        self.foreground.len()
    }

    /// Number of identifiers queued in background
    pub fn background_len(&self) -> usize {
        self.background.len()
    }
}
