//! Message Envelope and Schema Validation
//!
//! Canonical structured message shared by every component of the core:
//! `kind`, `type`, `data` and `metadata`. Messages are immutable once built;
//! the builder methods consume `self` and are only used at creation time.
//! Inside the core messages travel as `Arc<Message>` so fan-out and lane
//! hand-off never copy payloads.

use crate::error::{codes, ValidationError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use uuid::Uuid;

/// `UpperCamel.UpperCamel` dot notation for message types
static TYPE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z][A-Za-z0-9]*\.[A-Z][A-Za-z0-9]*$").expect("static type pattern compiles")
});

/// Fixed five-value message kind set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Command,
    Query,
    Event,
    Reply,
    Error,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Command => "command",
            Kind::Query => "query",
            Kind::Event => "event",
            Kind::Reply => "reply",
            Kind::Error => "error",
        }
    }

    /// Command or query: routed to exactly one handler and correlated
    pub fn is_request(&self) -> bool {
        matches!(self, Kind::Command | Kind::Query)
    }

    /// Reply or error: resolves a correlation
    pub fn is_terminal(&self) -> bool {
        matches!(self, Kind::Reply | Kind::Error)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message identity and causality metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metadata {
    id: String,
    timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    causation: Option<String>,
    /// Request timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

impl Metadata {
    fn fresh() -> Self {
        Self {
            id: new_message_id(),
            timestamp: now_millis(),
            correlation: None,
            causation: None,
            timeout: None,
        }
    }
}

/// Structured message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    kind: Kind,
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    data: Value,
    metadata: Metadata,
}

impl Message {
    /// Build a message with a fresh unique id and the current timestamp
    pub fn new(kind: Kind, msg_type: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            msg_type: msg_type.into(),
            data,
            metadata: Metadata::fresh(),
        }
    }

    pub fn command(msg_type: impl Into<String>, data: Value) -> Self {
        Self::new(Kind::Command, msg_type, data)
    }

    pub fn query(msg_type: impl Into<String>, data: Value) -> Self {
        Self::new(Kind::Query, msg_type, data)
    }

    pub fn event(msg_type: impl Into<String>, data: Value) -> Self {
        Self::new(Kind::Event, msg_type, data)
    }

    /// Reply answering `parent`: same type, `causation = parent.id`
    pub fn reply_to(parent: &Message, data: Value) -> Self {
        Self::new(Kind::Reply, parent.msg_type.clone(), data).caused_by(parent)
    }

    /// Error answering `parent` with a `{code, message}` body
    pub fn error_to(parent: &Message, code: &str, message: impl Into<String>) -> Self {
        let data = json!({ "code": code, "message": message.into() });
        Self::new(Kind::Error, parent.msg_type.clone(), data).caused_by(parent)
    }

    /// Error answering `parent` that names the handler responsible
    pub(crate) fn handler_error_to(parent: &Message, code: &str, message: impl Into<String>, handler: &str) -> Self {
        let data = json!({ "code": code, "message": message.into(), "handler": handler });
        Self::new(Kind::Error, parent.msg_type.clone(), data).caused_by(parent)
    }

    /// Core-generated error for an item whose shape could not be trusted
    pub(crate) fn validation_error(causation: Option<String>, message: impl Into<String>) -> Self {
        let data = json!({ "code": codes::VALIDATION_ERROR, "message": message.into() });
        let mut msg = Self::new(Kind::Error, "System.ValidationError", data);
        msg.metadata.correlation = causation.clone();
        msg.metadata.causation = causation;
        msg
    }

    /// Fill causation/correlation from the parent message
    fn caused_by(mut self, parent: &Message) -> Self {
        self.metadata.causation = Some(parent.metadata.id.clone());
        self.metadata.correlation = Some(
            parent
                .metadata
                .correlation
                .clone()
                .unwrap_or_else(|| parent.metadata.id.clone()),
        );
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.metadata.timestamp = timestamp;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.metadata.timeout = Some(timeout_ms);
        self
    }

    pub fn with_correlation(mut self, correlation: impl Into<String>) -> Self {
        self.metadata.correlation = Some(correlation.into());
        self
    }

    pub fn with_causation(mut self, causation: impl Into<String>) -> Self {
        self.metadata.causation = Some(causation.into());
        self
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn timestamp(&self) -> u64 {
        self.metadata.timestamp
    }

    pub fn correlation(&self) -> Option<&str> {
        self.metadata.correlation.as_deref()
    }

    pub fn causation(&self) -> Option<&str> {
        self.metadata.causation.as_deref()
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.metadata.timeout
    }

    /// `data.code` of an error message, if present
    pub fn error_code(&self) -> Option<&str> {
        if self.kind != Kind::Error {
            return None;
        }
        self.data.get("code").and_then(Value::as_str)
    }

    /// Parse one wire record
    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(text).map_err(|e| ValidationError::malformed(e.to_string()))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Serialized size in bytes
    pub fn wire_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    /// Conformance check against the wire contract
    pub fn validate(&self, max_bytes: usize) -> Result<(), ValidationError> {
        if self.metadata.id.is_empty() {
            return Err(ValidationError::MissingField {
                field: "metadata.id",
            });
        }
        if !is_valid_type(&self.msg_type) {
            return Err(ValidationError::invalid_type(&self.msg_type));
        }
        let size = self.wire_size();
        if size > max_bytes {
            return Err(ValidationError::Oversized {
                id: self.metadata.id.clone(),
                size,
                limit: max_bytes,
            });
        }
        Ok(())
    }
}

/// True when `msg_type` follows `UpperCamel.UpperCamel`
pub fn is_valid_type(msg_type: &str) -> bool {
    TYPE_PATTERN.is_match(msg_type)
}

/// Process-unique message id
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Wall clock in epoch milliseconds
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
