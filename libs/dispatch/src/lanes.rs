//! Priority Lanes
//!
//! Two disjoint FIFO queues feeding the scheduler. System (control plane)
//! always drains before a User item is taken; within a lane order is strict
//! FIFO.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Lane selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    System,
    User,
}

impl Lane {
    /// Default lane for a message type: System when the type starts with a
    /// reserved control-plane prefix, otherwise User
    pub fn classify<S: AsRef<str>>(msg_type: &str, control_prefixes: &[S]) -> Lane {
        if control_prefixes
            .iter()
            .any(|prefix| msg_type.starts_with(prefix.as_ref()))
        {
            Lane::System
        } else {
            Lane::User
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::System => f.write_str("system"),
            Lane::User => f.write_str("user"),
        }
    }
}

/// Fixed pair of lanes (System ≻ User) with O(1) enqueue/dequeue
#[derive(Debug)]
pub struct Lanes<T> {
    system: VecDeque<T>,
    user: VecDeque<T>,
}

impl<T> Default for Lanes<T> {
    fn default() -> Self {
        Self {
            system: VecDeque::new(),
            user: VecDeque::new(),
        }
    }
}

impl<T> Lanes<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `item` at the back of `lane`
    pub fn enqueue(&mut self, lane: Lane, item: T) {
        match lane {
            Lane::System => self.system.push_back(item),
            Lane::User => self.user.push_back(item),
        }
    }

    pub fn pop_system(&mut self) -> Option<T> {
        self.system.pop_front()
    }

    pub fn pop_user(&mut self) -> Option<T> {
        self.user.pop_front()
    }

    /// Depth of each lane ordered as [System, User]
    pub fn len_per_lane(&self) -> [usize; 2] {
        [self.system.len(), self.user.len()]
    }

    pub fn is_empty(&self) -> bool {
        self.system.is_empty() && self.user.is_empty()
    }
}
