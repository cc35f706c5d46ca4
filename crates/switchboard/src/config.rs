//! Engine configuration.
//!
//! Every field has a default, so a partial JSON document is a valid config:
//!
//! ```json
//! { "tick_interval_ms": 50, "capabilities": { "signals": true } }
//! ```

use crate::error::RuntimeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the host process allows the engine to do. Passed in explicitly
/// rather than detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Install SIGINT/SIGTERM handlers while running.
    pub signals: bool,
    /// Worker count for pools created without an explicit size.
    pub default_workers: usize,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            signals: false,
            default_workers: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest the run loop sleeps when nothing wakes it.
    pub tick_interval_ms: u64,
    /// Ticks run after stop to drain queued events.
    pub shutdown_ticks: usize,
    pub capabilities: Capabilities,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            shutdown_ticks: 3,
            capabilities: Capabilities::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
        serde_json::from_str(json).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
