//! Runtime configuration for controllers and schedulers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime configuration shared by controllers created from one builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Scheduler polling quantum in milliseconds.
    #[serde(default = "default_poll_quantum_ms")]
    pub poll_quantum_ms: u64,

    /// How long a cascaded stop waits for each controller, in milliseconds.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Maximum number of posted callables run per loop turn.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

fn default_poll_quantum_ms() -> u64 {
    50
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_max_batch() -> usize {
    64
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_quantum_ms: default_poll_quantum_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            max_batch: default_max_batch(),
        }
    }
}

impl RuntimeConfig {
    /// Get the polling quantum as Duration.
    pub fn poll_quantum(&self) -> Duration {
        Duration::from_millis(self.poll_quantum_ms)
    }

    /// Get the stop timeout as Duration.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
