//! Correlation Table
//!
//! Tracks in-flight command/query requests until exactly one terminal outcome
//! (reply, error or timeout) is observed. Only mutated from the scheduler's
//! bookkeeping step.

use crate::error::ValidationError;
use crate::message::Kind;
use crate::router::HandlerId;
use crate::timer::TimerId;
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationEntry {
    pub request_id: String,
    pub created_at: Instant,
    pub handler: HandlerId,
    pub timeout_timer: TimerId,
    pub kind: Kind,
    pub msg_type: String,
}

#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: HashMap<String, CorrelationEntry>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live request. At most one live entry per request id.
    pub fn open(&mut self, entry: CorrelationEntry) -> Result<(), ValidationError> {
        if self.entries.contains_key(&entry.request_id) {
            return Err(ValidationError::DuplicateRequest {
                id: entry.request_id,
            });
        }
        self.entries.insert(entry.request_id.clone(), entry);
        Ok(())
    }

    /// Remove and return the live entry a terminal message resolves
    pub fn resolve(&mut self, request_id: &str) -> Option<CorrelationEntry> {
        self.entries.remove(request_id)
    }

    pub fn is_live(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn get(&self, request_id: &str) -> Option<&CorrelationEntry> {
        self.entries.get(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
