//! # threadctl Config
//!
//! TOML configuration for threadctl: runtime tuning, logging and the demo
//! workload.

mod error;
mod loader;
mod schema;
mod validator;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
pub use validator::{ConfigValidator, ValidationError, ValidationResult, ValidationWarning};
