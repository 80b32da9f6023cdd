//! Dispatcher statistics
//!
//! Plain counters owned by the coordinating thread plus point-in-time
//! snapshots for observability tooling.

use crate::lanes::Lane;
use serde::Serialize;
use std::collections::BTreeMap;

/// Monotonic counters updated during turns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub turns: u64,
    pub system_processed: u64,
    pub user_processed: u64,
    pub timers_fired: u64,
    pub dispatched_requests: u64,
    pub delivered_events: u64,
    pub skipped_unhealthy: u64,
    pub published: u64,
    pub resolved: u64,
    pub timeouts: u64,
    pub orphans: u64,
    pub routing_failures: u64,
    pub validation_failures: u64,
    pub actor_faults: u64,
    pub respawns: u64,
    pub quarantines: u64,
}

impl Counters {
    pub fn record_processed(&mut self, lane: Lane) {
        match lane {
            Lane::System => self.system_processed += 1,
            Lane::User => self.user_processed += 1,
        }
    }
}

/// Per-actor view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActorSnapshot {
    pub messages_processed: u64,
    pub avg_processing_time_ns: f64,
    pub faults: u64,
    pub in_flight: usize,
    /// Handler body currently running
    pub processing: bool,
    pub healthy: bool,
    pub last_fault: Option<String>,
}

/// Full dispatcher snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchStats {
    pub counters: Counters,
    pub live_correlations: usize,
    pub pending_timers: usize,
    /// [System, User]
    pub lane_depth: [usize; 2],
    pub unhealthy: Vec<String>,
    /// Ids of the most recently observed orphans, oldest first
    pub recent_orphans: Vec<String>,
    pub actors: BTreeMap<String, ActorSnapshot>,
}

/// Items handled by one turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnReport {
    pub timers_fired: usize,
    pub system: usize,
    pub user: usize,
}
