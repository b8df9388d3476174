//! Bridge configuration types and defaults.
//!
//! This module defines the configuration options for a registered module,
//! including the native worker pool, pending operation limits and the
//! compatibility checks performed at registration.

use crate::CONTRACT_VERSION;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of native worker threads per module
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Default maximum number of live pending operations per module
pub const DEFAULT_MAX_PENDING_OPERATIONS: usize = 1024;

/// Default tracing filter directive
pub const DEFAULT_LOG_FILTER: &str = "lni_native_bridge=info";

/// Configuration for a registered bridge module
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Number of native worker threads driving async operations
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Maximum number of pending operations alive at once
    #[serde(default = "default_max_pending_operations")]
    pub max_pending_operations: usize,

    /// Contract version the binding was generated against
    #[serde(default = "default_contract_version")]
    pub contract_version: u32,

    /// Verify per-method API checksums at registration (default: true)
    #[serde(default = "default_true")]
    pub verify_checksums: bool,

    /// Tracing filter directive used by `init`
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Enable debug mode (default: false)
    #[serde(default)]
    pub debug: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            max_pending_operations: DEFAULT_MAX_PENDING_OPERATIONS,
            contract_version: CONTRACT_VERSION,
            verify_checksums: true,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            debug: false,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: BridgeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the number of native worker threads
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the pending operation limit
    pub fn with_max_pending_operations(mut self, max: usize) -> Self {
        self.max_pending_operations = max;
        self
    }

    /// Set the expected contract version
    pub fn with_contract_version(mut self, version: u32) -> Self {
        self.contract_version = version;
        self
    }

    /// Enable or disable checksum verification
    pub fn with_checksum_verification(mut self, enable: bool) -> Self {
        self.verify_checksums = enable;
        self
    }

    /// Set the tracing filter directive
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Enable debug mode
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker_threads".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.max_pending_operations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_pending_operations".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "log_filter".into(),
                reason: "must not be empty".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}

fn default_max_pending_operations() -> usize {
    DEFAULT_MAX_PENDING_OPERATIONS
}

fn default_contract_version() -> u32 {
    CONTRACT_VERSION
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

fn default_true() -> bool {
    true
}
