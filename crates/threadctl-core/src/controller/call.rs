//! Cross-thread calls.
//!
//! A call is packaged with a one-shot [`Notifier`] and delivered either
//! through the target's interrupt channel (posted to its hosting loop) or,
//! when a tag is given, as an ordinary prioritized message. The packaged
//! call resolves its notifier exactly once: with the target's result, or
//! with `NoController` if it is dropped unrun because the target stopped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tracing::trace;

use super::lifecycle::panic_message;
use super::Controller;
use crate::error::{ControlResult, ControllerError};
use crate::message::{Payload, QueuedCall};
use crate::notifier::Notifier;

/// Options for [`Controller::call_in_thread_sync`].
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// How long the caller waits for the result.
    pub timeout: Option<Duration>,

    /// Run directly when already on the target thread.
    pub same_thread_shortcut: bool,

    /// Queue under this message tag instead of the interrupt channel.
    pub tag: Option<String>,

    /// Message priority when `tag` is set.
    pub priority: i32,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            same_thread_shortcut: true,
            tag: None,
            priority: 0,
        }
    }
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Queue the call under `tag` instead of interrupting the target.
    ///
    /// The call runs only when the target drains that tag with
    /// [`ControllerContext::check_commands`](super::ControllerContext::check_commands).
    /// `Loop` controllers and `Run` bodies that never drain it leave the call
    /// pending until the target stops, so pair a tag with a timeout unless
    /// the target is known to drain it.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Always marshal, even from the target's own thread.
    pub fn without_shortcut(mut self) -> Self {
        self.same_thread_shortcut = false;
        self
    }
}

/// Pending result of an asynchronous call.
pub struct CallResult<R> {
    notifier: Notifier<ControlResult<R>>,
    target: String,
}

impl<R: Send + 'static> CallResult<R> {
    fn ready(target: &str, result: ControlResult<R>) -> Self {
        let notifier = Notifier::new();
        // A fresh notifier cannot have been notified.
        let _ = notifier.notify(result);
        Self {
            notifier,
            target: target.to_string(),
        }
    }

    /// Name of the controller executing the call.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Check whether the call has completed.
    pub fn is_done(&self) -> bool {
        self.notifier.is_notified()
    }

    /// Wait for the result; errors raised by the target are passed through.
    ///
    /// A timeout leaves the call running on the target side.
    pub fn wait(self, timeout: Option<Duration>) -> ControlResult<R> {
        self.notifier.wait(timeout)?
    }

    /// Wait for the result, substituting `default` if the target failed.
    ///
    /// Failures of the wait itself (timeout, stop) are still returned.
    pub fn value_or(self, default: R, timeout: Option<Duration>) -> ControlResult<R> {
        let target = self.target.clone();
        match self.notifier.wait(timeout)? {
            Ok(value) => Ok(value),
            Err(err) => {
                trace!(controller = %target, error = %err, "Remote call failed; using default");
                Ok(default)
            }
        }
    }
}

/// Resolves the notifier when dropped without a result.
struct Completer<R: Send + 'static> {
    notifier: Option<Notifier<ControlResult<R>>>,
    target: String,
}

impl<R: Send + 'static> Completer<R> {
    fn complete(mut self, result: ControlResult<R>) {
        if let Some(notifier) = self.notifier.take() {
            let _ = notifier.notify(result);
        }
    }
}

impl<R: Send + 'static> Drop for Completer<R> {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.take() {
            trace!(controller = %self.target, "Pending call dropped unrun");
            let _ = notifier.notify(Err(ControllerError::NoController(self.target.clone())));
        }
    }
}

fn run_target<R>(f: impl FnOnce() -> anyhow::Result<R>) -> ControlResult<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ControllerError::from_remote(err)),
        Err(panic) => Err(ControllerError::Remote(anyhow::anyhow!(
            "remote call panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

/// A stop of the target while running the call is seen by the caller as
/// the target being gone.
fn caller_view<R>(target: &str, result: ControlResult<R>) -> ControlResult<R> {
    match result {
        Err(ControllerError::StopSignal) => Err(ControllerError::NoController(target.to_string())),
        other => other,
    }
}

impl Controller {
    fn place_call(&self, call: QueuedCall, tag: Option<&str>, priority: i32) {
        match tag {
            None => {
                if !self.inner.host.post(Box::new(move || call.run())) {
                    trace!(controller = %self.id(), "Interrupt rejected by closed loop");
                }
            }
            Some(tag) => self.push_payload(tag, Payload::Call(call), priority),
        }
    }

    /// Invoke `f` on this controller's thread without waiting.
    ///
    /// Without a tag the call goes through the interrupt channel, served
    /// ahead of queued messages; with a tag it is queued as a message and
    /// run when the controller drains that tag.
    pub fn call_in_thread_async<R, F>(&self, f: F, tag: Option<&str>, priority: i32) -> CallResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    {
        let notifier = Notifier::new();
        let completer = Completer {
            notifier: Some(notifier.clone()),
            target: self.id().to_string(),
        };
        let target = self.id().to_string();
        let call = QueuedCall::new(move || {
            let result = caller_view(&target, run_target(f));
            completer.complete(result);
        });
        self.place_call(call, tag, priority);
        CallResult {
            notifier,
            target: self.id().to_string(),
        }
    }

    /// Invoke `f` on this controller's thread and wait for its result.
    ///
    /// With the same-thread shortcut (the default) a call made from the
    /// controller's own thread runs inline instead of deadlocking. Errors
    /// from `f` reach the caller unchanged.
    pub fn call_in_thread_sync<R, F>(&self, f: F, options: CallOptions) -> ControlResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    {
        if options.same_thread_shortcut && self.is_current_thread() {
            return run_target(f);
        }
        self.call_in_thread_async(f, options.tag.as_deref(), options.priority)
            .wait(options.timeout)
    }

    /// Like [`Controller::call_in_thread_sync`], but a failure of `f` is
    /// replaced by `default`.
    pub fn call_in_thread_sync_or<R, F>(&self, f: F, default: R, options: CallOptions) -> ControlResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    {
        let pending = if options.same_thread_shortcut && self.is_current_thread() {
            CallResult::ready(self.id(), run_target(f))
        } else {
            self.call_in_thread_async(f, options.tag.as_deref(), options.priority)
        };
        pending.value_or(default, options.timeout)
    }

    /// Fire-and-forget call; `callback` receives the result on this
    /// controller's thread.
    pub fn call_in_thread_callback<R, F>(
        &self,
        f: F,
        callback: Option<Box<dyn FnOnce(R) + Send + 'static>>,
        tag: Option<&str>,
        priority: i32,
    ) where
        R: 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        // Not caught: a failing callback takes down the target controller
        // like any other uncaught error on its thread.
        let call = QueuedCall::new(move || {
            let value = f();
            if let Some(callback) = callback {
                callback(value);
            }
        });
        self.place_call(call, tag, priority);
    }
}
