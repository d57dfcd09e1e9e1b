//! Supervisor configuration parameters
//!
//! All tunable parameters for the vending supervisor.  Loaded from a JSON
//! file at boot (see `main.rs`); anything absent falls back to the defaults
//! below.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Core supervisor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    // --- Fan-out ---
    /// Bounded buffer depth of every subscriber channel
    pub subscriber_depth: usize,

    // --- Network ---
    /// Connectivity poll tick (milliseconds)
    pub status_poll_interval_ms: u64,
    /// Suppress notifications while the link is scanning/associating/handshaking
    pub skip_transitional_states: bool,
    /// Run the IP-renewal hook after an SSID change lands on a connected link
    pub renew_ip_on_ssid_change: bool,

    // --- Dispense ---
    /// Motor on-time for a settled invoice (milliseconds)
    pub dispense_pulse_ms: u64,
    /// Used when no value has been persisted yet
    pub default_dispense_on_touch: bool,
    /// Used when no value has been persisted yet
    pub default_buzz_on_dispense: bool,

    // --- Nodes ---
    /// Boot-time start attempts per enabled node (1 = no retry)
    pub node_start_attempts: u32,
    /// Delay before the single retry (milliseconds)
    pub node_start_backoff_ms: u64,

    // --- Lifecycle ---
    /// Upper bound on joining all background tasks at stop (milliseconds)
    pub shutdown_timeout_ms: u64,

    // --- Surfaces ---
    pub api_listen: String,
    pub pos_listen: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            subscriber_depth: 16,

            status_poll_interval_ms: 1000, // 1 Hz
            skip_transitional_states: true,
            renew_ip_on_ssid_change: true,

            dispense_pulse_ms: 1500,
            default_dispense_on_touch: true,
            default_buzz_on_dispense: false,

            node_start_attempts: 2,
            node_start_backoff_ms: 500,

            shutdown_timeout_ms: 5000,

            api_listen: "0.0.0.0:9000".into(),
            pos_listen: "127.0.0.1:9001".into(),
        }
    }
}

impl SupervisorConfig {
    /// Range-check every field.  Invalid values are rejected, not clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriber_depth == 0 || self.subscriber_depth > 1024 {
            return Err(ConfigError::ValidationFailed(
                "subscriber_depth must be 1-1024",
            ));
        }
        if !(100..=60_000).contains(&self.status_poll_interval_ms) {
            return Err(ConfigError::ValidationFailed(
                "status_poll_interval_ms must be 100-60000",
            ));
        }
        if !(1..=60_000).contains(&self.dispense_pulse_ms) {
            return Err(ConfigError::ValidationFailed(
                "dispense_pulse_ms must be 1-60000",
            ));
        }
        if !(1..=2).contains(&self.node_start_attempts) {
            return Err(ConfigError::ValidationFailed(
                "node_start_attempts must be 1 or 2",
            ));
        }
        if self.node_start_backoff_ms > 60_000 {
            return Err(ConfigError::ValidationFailed(
                "node_start_backoff_ms must be <= 60000",
            ));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "shutdown_timeout_ms must be > 0",
            ));
        }
        if self.api_listen.is_empty() || self.pos_listen.is_empty() {
            return Err(ConfigError::ValidationFailed("listen addresses must be set"));
        }
        Ok(())
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Self = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn dispense_pulse(&self) -> Duration {
        Duration::from_millis(self.dispense_pulse_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn node_start_backoff(&self) -> Duration {
        Duration::from_millis(self.node_start_backoff_ms)
    }
}
