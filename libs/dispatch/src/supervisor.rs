//! Supervisor
//!
//! Bounded restart policy for faulted actors. Each handler gets at most
//! `max_restarts` restarts inside a sliding `window`; a fault beyond that
//! quarantines the handler (marked unhealthy) until cleared by an operator.
//! Subscriber faults follow the same policy as command/query handlers.

use crate::config::SupervisorConfig;
use crate::router::HandlerId;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Supervision decision for one fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorDirective {
    /// Respawn a fresh instance after the fixed backoff
    Restart { after: Duration, attempt: u32 },
    /// Budget exhausted, routes short-circuit until cleared
    Quarantine,
}

#[derive(Debug)]
pub struct Supervisor {
    max_restarts: u32,
    window: Duration,
    backoff: Duration,
    /// Restart timestamps inside the current window, oldest first
    history: HashMap<HandlerId, VecDeque<Instant>>,
    unhealthy: BTreeSet<HandlerId>,
}

impl Supervisor {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            window: Duration::from_millis(config.window_ms),
            backoff: Duration::from_millis(config.backoff_ms),
            history: HashMap::new(),
            unhealthy: BTreeSet::new(),
        }
    }

    /// Decide what happens to `handler` after a fault observed at `now`
    pub fn on_fault(&mut self, handler: &HandlerId, now: Instant) -> SupervisorDirective {
        if self.unhealthy.contains(handler) {
            return SupervisorDirective::Quarantine;
        }

        let window = self.window;
        let history = self.history.entry(handler.clone()).or_default();
        while let Some(oldest) = history.front() {
            if now.duration_since(*oldest) >= window {
                history.pop_front();
            } else {
                break;
            }
        }

        if (history.len() as u32) < self.max_restarts {
            history.push_back(now);
            let attempt = history.len() as u32;
            warn!(
                handler = %handler,
                attempt,
                max_restarts = self.max_restarts,
                backoff_ms = self.backoff.as_millis() as u64,
                "Restarting actor within restart limits"
            );
            SupervisorDirective::Restart {
                after: self.backoff,
                attempt,
            }
        } else {
            self.unhealthy.insert(handler.clone());
            error!(
                handler = %handler,
                max_restarts = self.max_restarts,
                window_ms = window.as_millis() as u64,
                "Actor exceeded restart limit - marking handler unhealthy"
            );
            SupervisorDirective::Quarantine
        }
    }

    pub fn is_healthy(&self, handler: &HandlerId) -> bool {
        !self.unhealthy.contains(handler)
    }

    /// Manual clear: handler becomes routable again with a fresh budget
    pub fn clear(&mut self, handler: &HandlerId) -> bool {
        let cleared = self.unhealthy.remove(handler);
        if cleared {
            self.history.remove(handler);
            info!(handler = %handler, "Handler cleared and marked healthy");
        }
        cleared
    }

    pub fn unhealthy(&self) -> Vec<HandlerId> {
        self.unhealthy.iter().cloned().collect()
    }
}
