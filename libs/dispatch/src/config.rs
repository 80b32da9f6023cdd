//! Dispatcher Configuration
//!
//! Boot-time parameters as one immutable value passed into
//! `Dispatcher::boot`. Loadable from a TOML file layered under
//! `DISPATCH__*` environment overrides.

use crate::error::BootError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Top-level dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Timeout applied to commands/queries without `metadata.timeout`
    pub default_timeout_ms: u64,
    /// Upper bound on a serialized message
    pub max_message_bytes: usize,
    /// Type prefixes that default to the System lane
    pub control_prefixes: Vec<String>,
    /// Recently observed orphans kept for inspection
    pub orphan_history: usize,
    pub supervisor: SupervisorConfig,
}

/// Restart budget for faulted actors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub window_ms: u64,
    pub backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_message_bytes: 32 * 1024,
            control_prefixes: vec!["System.".to_string()],
            orphan_history: 64,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window_ms: 60_000,
            backoff_ms: 100,
        }
    }
}

impl DispatchConfig {
    /// Load from an optional TOML file, then apply `DISPATCH__` environment
    /// overrides (`DISPATCH__SUPERVISOR__MAX_RESTARTS=3`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!("Loading dispatcher config: {:?}", path);
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("DISPATCH")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("control_prefixes"),
        );

        let config: DispatchConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate().context("Invalid dispatcher configuration")?;
        debug!(?config, "Dispatcher configuration loaded");
        Ok(config)
    }

    /// Reject values the core cannot operate with
    pub fn validate(&self) -> std::result::Result<(), BootError> {
        if self.default_timeout_ms == 0 {
            return Err(BootError::configuration(
                "default timeout must be positive",
                Some("default_timeout_ms"),
            ));
        }
        if self.max_message_bytes < 256 {
            return Err(BootError::configuration(
                "message size bound must be at least 256 bytes",
                Some("max_message_bytes"),
            ));
        }
        if self.control_prefixes.iter().any(|p| p.is_empty()) {
            return Err(BootError::configuration(
                "control prefixes must be non-empty",
                Some("control_prefixes"),
            ));
        }
        if self.supervisor.window_ms == 0 {
            return Err(BootError::configuration(
                "restart window must be positive",
                Some("supervisor.window_ms"),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
