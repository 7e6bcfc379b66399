//! Configuration Module
//!
//! This module defines all configuration structures for the batch manager.
//! Configuration is loaded from TOML files and parsed using serde. Every
//! section has defaults, so a partial file (or no file at all) is valid.

use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::error::BatchError;

/// Main configuration structure
///
/// Contains all configuration sections for the batch manager.
/// Loaded from a TOML file (e.g., config/default.toml).
///
/// # Example TOML
/// ```toml
/// [manager]
/// read_page_size = 100
/// message_poll_timeout_ms = 30000
///
/// [broadcast]
/// batch_max_size = 200
/// batch_timeout_ms = 500
/// dispose_timeout_ms = 120000
///
/// [logging]
/// level = "info"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub retry: RetryConfig,
    pub broadcast: DispatcherConfig,
    pub private: DispatcherConfig,
    pub logging: LoggingConfig,
}

/// Message sequencer configuration
///
/// # Fields
/// - `read_page_size`: Maximum messages read per sequencer round, also the
///   capacity of the new-message notification queue
/// - `message_poll_timeout_ms`: Longest wait between rounds when no shoulder tap arrives
/// - `startup_retry_attempts`: Attempts at restoring the offset before `start()` fails
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub read_page_size: usize,
    pub message_poll_timeout_ms: u64,
    pub startup_retry_attempts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            read_page_size: 100,
            message_poll_timeout_ms: 30_000,
            startup_retry_attempts: 5,
        }
    }
}

impl ManagerConfig {
    pub fn message_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.message_poll_timeout_ms)
    }
}

/// Exponential backoff used for store writes and dispatch attempts
///
/// The delay before retry `n` is `initial_delay_ms * factor^n`, capped at
/// `maximum_delay_ms`. `max_attempts` bounds one retry run; 0 means unbounded
/// (only cancellation stops it).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub maximum_delay_ms: u64,
    pub factor: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            maximum_delay_ms: 30_000,
            factor: 2.0,
            max_attempts: 5,
        }
    }
}

/// Batching policy for one family of message types
///
/// # Fields
/// - `batch_max_size`: Seal once this many messages are buffered (0 seals every message alone)
/// - `batch_timeout_ms`: Seal a partial batch this long after its first message (0 seals immediately)
/// - `dispose_timeout_ms`: Remove an idle processor after this long without work
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub batch_max_size: usize,
    pub batch_timeout_ms: u64,
    pub dispose_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_max_size: 200,
            batch_timeout_ms: 500,
            dispose_timeout_ms: 120_000,
        }
    }
}

/// Logging configuration
///
/// `level` is an `EnvFilter` directive; `RUST_LOG` takes precedence when set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Returns
    /// * `Ok(Config)` if the file was successfully loaded, parsed and validated
    /// * `Err` if the file couldn't be read, the TOML is invalid, or a value is out of range
    ///
    /// # Example
    /// ```no_run
    /// # use batch_sequencer::Config;
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::from_toml(&content)?)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, BatchError> {
        let config: Config =
            toml::from_str(content).map_err(|e| BatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the manager cannot run with
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.manager.read_page_size == 0 {
            return Err(BatchError::Config("manager.read_page_size must be > 0".into()));
        }
        if self.retry.factor < 1.0 {
            return Err(BatchError::Config("retry.factor must be >= 1.0".into()));
        }
        if self.retry.maximum_delay_ms < self.retry.initial_delay_ms {
            return Err(BatchError::Config(
                "retry.maximum_delay_ms must be >= retry.initial_delay_ms".into(),
            ));
        }
        Ok(())
    }
}
