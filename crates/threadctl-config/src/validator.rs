//! Configuration validation.

use crate::error::ConfigError;
use crate::schema::Config;

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// First error as a [`ConfigError`], if any.
    pub fn into_error(self) -> Option<ConfigError> {
        self.errors.into_iter().next().map(|e| ConfigError::InvalidValue {
            field: e.path,
            message: e.message,
        })
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult::default();
        Self::validate_runtime(config, &mut result);
        Self::validate_logging(config, &mut result);
        Self::validate_demo(config, &mut result);
        result
    }

    fn validate_runtime(config: &Config, result: &mut ValidationResult) {
        let runtime = &config.runtime;
        if runtime.poll_quantum_ms == 0 {
            result.add_error(ValidationError::new(
                "runtime.poll_quantum_ms",
                "poll_quantum_ms must be greater than 0",
            ));
        } else if runtime.poll_quantum_ms > 1000 {
            result.add_warning(ValidationWarning::new(
                "runtime.poll_quantum_ms",
                "poll_quantum_ms is above 1s, schedulers will react slowly to new jobs",
            ));
        }

        if runtime.stop_timeout_ms == 0 {
            result.add_error(ValidationError::new(
                "runtime.stop_timeout_ms",
                "stop_timeout_ms must be greater than 0",
            ));
        }

        if runtime.max_batch == 0 {
            result.add_error(ValidationError::new(
                "runtime.max_batch",
                "max_batch must be greater than 0",
            ));
        }
    }

    fn validate_logging(config: &Config, result: &mut ValidationResult) {
        let logging = &config.logging;
        if logging.level.trim().is_empty() {
            result.add_error(ValidationError::new(
                "logging.level",
                "level cannot be empty",
            ));
        } else if !logging.level.contains('=') && !LEVELS.contains(&logging.level.as_str()) {
            result.add_warning(ValidationWarning::new(
                "logging.level",
                format!(
                    "Unknown log level '{}', valid values: {:?}",
                    logging.level, LEVELS
                ),
            ));
        }

        if let Some(file) = &logging.file {
            if file.is_empty() || file.contains('/') {
                result.add_error(ValidationError::new(
                    "logging.file",
                    "file must be a plain file name prefix",
                ));
            }
        }
        if logging.dir.is_some() && logging.file.is_none() {
            result.add_warning(ValidationWarning::new(
                "logging.dir",
                "dir is set but file logging is off (logging.file unset)",
            ));
        }
    }

    fn validate_demo(config: &Config, result: &mut ValidationResult) {
        let demo = &config.demo;
        if demo.poll_period_ms == 0 {
            result.add_error(ValidationError::new(
                "demo.poll_period_ms",
                "poll_period_ms must be greater than 0",
            ));
        }
        if demo.report_period_ms == 0 {
            result.add_error(ValidationError::new(
                "demo.report_period_ms",
                "report_period_ms must be greater than 0",
            ));
        } else if demo.report_period_ms < demo.poll_period_ms {
            result.add_warning(ValidationWarning::new(
                "demo.report_period_ms",
                "report_period_ms is shorter than poll_period_ms, reports will repeat readings",
            ));
        }
        if demo.scan_steps == 0 {
            result.add_error(ValidationError::new(
                "demo.scan_steps",
                "scan_steps must be greater than 0",
            ));
        }
        if demo.duration_secs == 0 {
            result.add_warning(ValidationWarning::new(
                "demo.duration_secs",
                "duration_secs is 0, the demo runs until interrupted",
            ));
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
