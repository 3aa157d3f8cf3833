//! Thread-side controller API.

use std::marker::PhantomData;
use std::time::Duration;

use serde_json::Value;

use super::Controller;
use crate::config::RuntimeConfig;
use crate::error::{ControlResult, ControllerError};
use crate::host::TimerHandle;
use crate::message::Message;
use crate::thread_context::{self, check_stop, suspend_until};

/// Outcome of a cooperative checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// Keep going.
    Continue,
    /// A stop was requested; the caller should return.
    StopRequested,
}

/// Owner-only view of a controller, handed to [`super::ControllerHandler`]
/// hooks on the controller's own thread.
///
/// Not `Send`: it cannot leave the thread it was created on.
pub struct ControllerContext {
    controller: Controller,
    _not_send: PhantomData<*const ()>,
}

impl ControllerContext {
    pub(crate) fn new(controller: Controller) -> Self {
        Self {
            controller,
            _not_send: PhantomData,
        }
    }

    /// Handle to the owning controller.
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Controller name.
    pub fn id(&self) -> &str {
        self.controller.id()
    }

    /// Runtime configuration.
    pub fn runtime(&self) -> &RuntimeConfig {
        self.controller.runtime()
    }

    /// Check whether a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.controller.is_stop_requested()
    }

    /// Pop the first queued message with this tag.
    pub fn pop_message(&self, tag: &str) -> ControlResult<Message> {
        self.controller
            .inner
            .messages
            .lock()
            .pop(tag)
            .ok_or_else(|| ControllerError::NoMessage(tag.to_string()))
    }

    /// Wait until a message with this tag arrives and pop it.
    pub fn wait_for_message(&self, tag: &str, timeout: Option<Duration>) -> ControlResult<Message> {
        suspend_until(timeout, || self.controller.inner.messages.lock().pop(tag))
    }

    /// Wait for a synchronization token sent with [`Controller::send_sync`].
    pub fn wait_for_sync(&self, tag: &str, uid: u64, timeout: Option<Duration>) -> ControlResult<()> {
        suspend_until(timeout, || {
            self.controller
                .inner
                .messages
                .lock()
                .take_sync(tag, uid)
                .then_some(())
        })
    }

    /// Process pending interrupts without blocking, then honour a stop
    /// request.
    pub fn check_messages(&self) -> ControlResult<()> {
        let host = &self.controller.inner.host;
        while host.run_once(false, None) > 0 {}
        check_stop()
    }

    /// Tri-state checkpoint: processes pending interrupts and reports
    /// whether to continue. Errors only on a failure, never on stop.
    pub fn poll(&self) -> ControlResult<LoopStatus> {
        match self.check_messages() {
            Ok(()) => Ok(LoopStatus::Continue),
            Err(ControllerError::StopSignal) => Ok(LoopStatus::StopRequested),
            Err(err) => Err(err),
        }
    }

    /// Run every call queued under `tag`; returns how many ran.
    pub fn check_commands(&self, tag: &str) -> ControlResult<usize> {
        let mut executed = 0;
        loop {
            check_stop()?;
            let message = self.controller.inner.messages.lock().pop(tag);
            let Some(message) = message else {
                return Ok(executed);
            };
            if message.execute() {
                executed += 1;
            }
        }
    }

    /// Sleep while serving interrupts; unwinds on a stop request.
    pub fn sleep(&self, duration: Duration) -> ControlResult<()> {
        thread_context::sleep(duration)
    }

    /// Serve the event loop until a stop is requested.
    ///
    /// Always ends with `Err(StopSignal)`.
    pub fn run_until_stopped(&self) -> ControlResult<()> {
        let host = &self.controller.inner.host;
        loop {
            check_stop()?;
            host.run_once(true, None);
        }
    }

    /// Mark an application-defined exec point as reached.
    pub fn notify_exec_point(&self, point: &str) -> ControlResult<()> {
        self.controller.notify_point(point)
    }

    /// Stop the controller from its own thread: always `Err(StopSignal)`
    /// while running.
    pub fn stop(&self) -> ControlResult<()> {
        self.controller.stop()
    }

    /// Run `task` on this thread after `delay`.
    pub fn set_timer(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.controller.inner.host.set_timer(delay, Box::new(task))
    }
}
