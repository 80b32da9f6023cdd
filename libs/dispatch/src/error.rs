//! Dispatch Error Types
//!
//! Error taxonomy for the dispatcher core: schema validation, boot-time
//! discovery, routing, and handler failures. Boot errors are always fatal;
//! everything else is converted into an `error`-kind message at the point it
//! is discovered and never propagates out of a turn.

use crate::message::Kind;
use thiserror::Error;

/// Wire codes carried in the `data.code` field of core-generated errors
pub mod codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const ROUTING_ERROR: &str = "ROUTING_ERROR";
    pub const HANDLER_UNHEALTHY: &str = "HANDLER_UNHEALTHY";
    pub const ACTOR_FAULT: &str = "ACTOR_FAULT";
    pub const TIMEOUT: &str = "TIMEOUT";
}

/// Message shape violations found by the Validate step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Malformed message: {message}")]
    Malformed { message: String },

    #[error("Invalid type '{msg_type}': expected UpperCamel.UpperCamel")]
    InvalidType { msg_type: String },

    #[error("Missing field: {field}")]
    MissingField { field: &'static str },

    #[error("Message {id} is {size} bytes, exceeds limit of {limit}")]
    Oversized { id: String, size: usize, limit: usize },

    #[error("Request id {id} already has a live correlation")]
    DuplicateRequest { id: String },
}

impl ValidationError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    pub fn invalid_type(msg_type: impl Into<String>) -> Self {
        Self::InvalidType {
            msg_type: msg_type.into(),
        }
    }
}

/// Fatal errors raised while building the routing index at boot
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootError {
    #[error("Handler '{handler}' declares a non-enumerable inbound contract: {detail}")]
    NonEnumerable { handler: String, detail: String },

    #[error("Handlers '{first}' and '{second}' both claim ({kind}, {msg_type})")]
    DuplicateRoute {
        kind: Kind,
        msg_type: String,
        first: String,
        second: String,
    },

    #[error("Handler id '{handler}' registered twice")]
    DuplicateHandler { handler: String },

    #[error("Handler '{handler}' cannot accept {kind} messages ({msg_type})")]
    UnroutableKind {
        handler: String,
        kind: Kind,
        msg_type: String,
    },

    #[error("Handler '{handler}' subscribes to invalid event type '{msg_type}'")]
    InvalidSubscription { handler: String, msg_type: String },

    #[error("Configuration error: {message} (field: {field:?})")]
    Configuration {
        message: String,
        field: Option<String>,
    },
}

impl BootError {
    pub fn non_enumerable(handler: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::NonEnumerable {
            handler: handler.into(),
            detail: detail.into(),
        }
    }

    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }
}

/// Runtime routing failures. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("No route for ({kind}, {msg_type})")]
    NoRoute { kind: Kind, msg_type: String },

    #[error("Handler '{handler}' is unhealthy")]
    Unhealthy { handler: String },
}

impl RouteError {
    /// Wire code for the error message produced from this failure
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoRoute { .. } => codes::ROUTING_ERROR,
            Self::Unhealthy { .. } => codes::HANDLER_UNHEALTHY,
        }
    }
}

/// Failure declared by handler logic. Treated as an actor fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Umbrella error for the public dispatcher API
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Boot(#[from] BootError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Dispatcher is shut down")]
    Shutdown,
}

/// Result type alias for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;

impl DispatchError {
    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Boot(_) => "boot",
            Self::Route(_) => "routing",
            Self::Handler(_) => "handler",
            Self::Serialization(_) => "serialization",
            Self::Shutdown => "shutdown",
        }
    }
}
