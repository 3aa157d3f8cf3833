//! Named command handlers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::{CallOptions, Controller};
use crate::error::{ControlResult, ControllerError};

/// Handler invoked on the owning controller's thread for a named command.
pub trait CommandHandler: Send + Sync + 'static {
    fn call(&self, args: Value) -> anyhow::Result<Value>;
}

impl<F> CommandHandler for F
where
    F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn call(&self, args: Value) -> anyhow::Result<Value> {
        self(args)
    }
}

impl Controller {
    /// Register a named command; replaces an existing one.
    pub fn add_command(&self, name: impl Into<String>, handler: impl CommandHandler) {
        let name = name.into();
        debug!(controller = %self.id(), command = %name, "Command registered");
        self.inner.commands.insert(name, Arc::new(handler));
    }

    /// Remove a named command; returns whether it existed.
    pub fn remove_command(&self, name: &str) -> bool {
        self.inner.commands.remove(name).is_some()
    }

    /// Check whether a command is registered.
    pub fn has_command(&self, name: &str) -> bool {
        self.inner.commands.contains_key(name)
    }

    fn resolve(&self, name: &str) -> ControlResult<Arc<dyn CommandHandler>> {
        self.inner
            .commands
            .get(name)
            .map(|h| h.value().clone())
            .ok_or_else(|| ControllerError::UnknownCommand {
                controller: self.id().to_string(),
                command: name.to_string(),
            })
    }

    /// Run a command on the controller's thread without waiting.
    ///
    /// A failure inside the handler is logged.
    pub fn command(&self, name: &str, args: Value) -> ControlResult<()> {
        let handler = self.resolve(name)?;
        let (controller, command) = (self.id().to_string(), name.to_string());
        let run = move || {
            if let Err(err) = handler.call(args) {
                warn!(controller = %controller, command = %command, error = %err, "Command failed");
            }
        };
        self.call_in_thread_callback(run, None, self.inner.command_tag.as_deref(), 0);
        Ok(())
    }

    /// Run a command on the controller's thread and wait for its result.
    pub fn query(&self, name: &str, args: Value, timeout: Option<Duration>) -> ControlResult<Value> {
        let handler = self.resolve(name)?;
        let options = CallOptions {
            timeout,
            tag: self.inner.command_tag.clone(),
            ..CallOptions::default()
        };
        self.call_in_thread_sync(move || handler.call(args), options)
    }
}
