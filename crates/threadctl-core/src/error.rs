//! Error types for the controller framework.

use thiserror::Error;

use crate::controller::ControllerState;

/// Errors that can occur in controllers, the registry and the signal bus.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Controller name is unknown or the controller has already stopped.
    #[error("Controller not found: {0}")]
    NoController(String),

    /// A controller with this name is already created or running.
    #[error("Controller already exists: {0}")]
    DuplicateController(String),

    /// A wait or a call exceeded its deadline.
    #[error("Operation timed out")]
    TimedOut,

    /// Pop on an empty message queue.
    #[error("No message with tag {0:?}")]
    NoMessage(String),

    /// Stop was requested for the controller owning the current thread.
    ///
    /// Only ever returned on the controller's own thread; it unwinds the
    /// controller's `run` body up to the lifecycle driver.
    #[error("Controller stop requested")]
    StopSignal,

    /// A one-shot notifier was notified twice.
    #[error("Notifier has already been notified")]
    AlreadyNotified,

    /// An exec point was notified twice.
    #[error("Exec point {point:?} of controller {controller} has already been notified")]
    ExecPointNotified { controller: String, point: String },

    /// Operation is not allowed in the current lifecycle state.
    #[error("Controller {controller} is {state:?}: {message}")]
    InvalidState {
        controller: String,
        state: ControllerState,
        message: String,
    },

    /// No command handler with this name.
    #[error("Unknown command {command:?} for controller {controller}")]
    UnknownCommand { controller: String, command: String },

    /// Subscription options are inconsistent.
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// Job name collision inside a scheduler.
    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    /// Job name is unknown to the scheduler.
    #[error("Job not found: {0}")]
    NoJob(String),

    /// Error raised by the target function of a remote call.
    #[error(transparent)]
    Remote(anyhow::Error),
}

impl ControllerError {
    /// Check whether this is the internal stop signal.
    pub fn is_stop(&self) -> bool {
        matches!(self, ControllerError::StopSignal)
    }

    /// Wrap an error produced by a remote call target.
    ///
    /// Framework errors raised inside the target (e.g. a nested call that
    /// timed out) are passed through unchanged.
    pub(crate) fn from_remote(err: anyhow::Error) -> Self {
        match err.downcast::<ControllerError>() {
            Ok(err) => err,
            Err(err) => ControllerError::Remote(err),
        }
    }

    /// Downcast a remote error to its original type.
    pub fn remote_as<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            ControllerError::Remote(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Result type for controller operations.
pub type ControlResult<T> = Result<T, ControllerError>;
