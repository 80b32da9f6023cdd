//! Timer Wheel
//!
//! Deadline-ordered store of deferred messages. Backed by a binary heap of
//! `(deadline, id)` keys plus an id-indexed entry map; cancellation removes
//! the entry and leaves a stale heap key that is skipped on pop. Timer ids
//! are allocated monotonically, so ordering by `(deadline, id)` gives
//! deadline order with FIFO tie-breaking.
//!
//! Deadlines are `tokio::time::Instant`s so a paused tokio clock drives the
//! wheel deterministically in tests.

use crate::message::Message;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Handle returned by `schedule`, valid until the timer fires or is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// What a timer is for. Decides the lane its payload is fired into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Implicit per-request timeout, fires a terminal error
    Timeout,
    /// Explicit deferred delivery of an arbitrary message
    Scheduled,
    /// Internal retry (actor respawn after backoff)
    Retry,
}

#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub id: TimerId,
    pub deadline: Instant,
    pub payload: Arc<Message>,
    pub kind: TimerKind,
}

#[derive(Debug, Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, TimerEntry>,
    next_id: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `payload` to fire at `deadline`
    pub fn schedule_at(&mut self, deadline: Instant, payload: Arc<Message>, kind: TimerKind) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.heap.push(Reverse((deadline, id)));
        self.entries.insert(
            id,
            TimerEntry {
                id,
                deadline,
                payload,
                kind,
            },
        );
        id
    }

    /// Schedule `payload` to fire `delay` after `now`. Delays past the
    /// representable range are clamped to a far-future deadline.
    pub fn schedule(&mut self, now: Instant, delay: Duration, payload: Arc<Message>, kind: TimerKind) -> TimerId {
        let deadline = now.checked_add(delay).unwrap_or_else(|| far_future(now));
        self.schedule_at(deadline, payload, kind)
    }

    /// Cancel a pending timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let removed = self.entries.remove(&id).is_some();
        if removed && self.heap.len() > 2 * self.entries.len() + 64 {
            self.compact();
        }
        removed
    }

    /// Drain every entry with `deadline <= now`, deadline order, ties FIFO
    pub fn pop_ready(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut ready = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(entry) = self.entries.remove(&id) {
                ready.push(entry);
            }
        }
        ready
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.entries.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop stale heap keys left behind by cancellation
    fn compact(&mut self) {
        let entries = &self.entries;
        self.heap.retain(|Reverse((_, id))| entries.contains_key(id));
    }
}

/// Roughly 30 years out, the same horizon tokio uses for unbounded sleeps
fn far_future(now: Instant) -> Instant {
    now + FAR_FUTURE
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
