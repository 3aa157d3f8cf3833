//! Configuration schema definitions.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use threadctl_core::RuntimeConfig;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub demo: DemoConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it.
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for rolling log files.
    #[serde(default)]
    pub dir: Option<String>,

    /// Log file name prefix. File logging is off when unset.
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: None,
            file: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl LoggingConfig {
    /// Directory log files are written to.
    ///
    /// Falls back to `<data dir>/threadctl/logs`, then `./logs`.
    pub fn log_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).as_ref()),
            None => dirs::data_local_dir()
                .map(|d| d.join("threadctl").join("logs"))
                .unwrap_or_else(|| PathBuf::from("logs")),
        }
    }
}

/// Demo workload driven by the `threadctl` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    /// How long to run; 0 runs until interrupted.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    /// Period of the device polling job.
    #[serde(default = "default_poll_period_ms")]
    pub poll_period_ms: u64,

    /// Period of the status report job.
    #[serde(default = "default_report_period_ms")]
    pub report_period_ms: u64,

    /// Number of steps in one scan batch.
    #[serde(default = "default_scan_steps")]
    pub scan_steps: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_duration_secs(),
            poll_period_ms: default_poll_period_ms(),
            report_period_ms: default_report_period_ms(),
            scan_steps: default_scan_steps(),
        }
    }
}

fn default_duration_secs() -> u64 {
    10
}

fn default_poll_period_ms() -> u64 {
    100
}

fn default_report_period_ms() -> u64 {
    1000
}

fn default_scan_steps() -> u64 {
    20
}

impl DemoConfig {
    /// Run time limit, if any.
    pub fn duration(&self) -> Option<Duration> {
        (self.duration_secs > 0).then(|| Duration::from_secs(self.duration_secs))
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    pub fn report_period(&self) -> Duration {
        Duration::from_millis(self.report_period_ms)
    }
}
