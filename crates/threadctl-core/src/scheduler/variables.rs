//! Key/value store for state published by a scheduler.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::error::ControlResult;
use crate::notifier::MultiNotifier;

/// Cross-thread variable store.
///
/// One lock guards the values; it is never held while a predicate runs.
#[derive(Debug, Default)]
pub struct VariableStore {
    values: Mutex<HashMap<String, Value>>,
    changed: MultiNotifier,
}

impl VariableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable and wake everyone waiting on the store.
    pub fn set_variable(&self, name: &str, value: Value) {
        trace!(variable = name, "Variable set");
        self.values.lock().insert(name.to_string(), value);
        self.changed.notify();
    }

    /// Current value of a variable.
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.values.lock().get(name).cloned()
    }

    /// Remove a variable; returns its last value.
    pub fn remove_variable(&self, name: &str) -> Option<Value> {
        let removed = self.values.lock().remove(name);
        if removed.is_some() {
            self.changed.notify();
        }
        removed
    }

    /// Snapshot of every variable.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values.lock().clone()
    }

    /// Wait until the variable exists and satisfies `predicate`.
    pub fn wait_for_variable(
        &self,
        name: &str,
        predicate: impl Fn(&Value) -> bool,
        timeout: Option<Duration>,
    ) -> ControlResult<Value> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let seen = self.changed.count();
            if let Some(value) = self.get_variable(name) {
                if predicate(&value) {
                    return Ok(value);
                }
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            self.changed.wait(seen + 1, remaining)?;
        }
    }
}
