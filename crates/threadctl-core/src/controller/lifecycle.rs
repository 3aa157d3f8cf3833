//! Controller lifecycle: start, exec points, two-phase stop, teardown.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{Controller, ControllerContext, ControllerHandler, ControllerKind, ControllerState};
use crate::error::{ControlResult, ControllerError};
use crate::thread_context::bind;

/// Exec point fired once the controller thread is live.
pub const POINT_START: &str = "start";
/// Exec point fired after the `on_start` hook.
pub const POINT_RUN: &str = "run";
/// Exec point fired after teardown.
pub const POINT_STOP: &str = "stop";

impl Controller {
    fn take_handler(&self) -> ControlResult<Box<dyn ControllerHandler>> {
        let state = self.state();
        let handler = self.inner.handler.lock().take();
        match handler {
            Some(handler) if state == ControllerState::Created => Ok(handler),
            _ => Err(self.invalid_state("controller was already started")),
        }
    }

    pub(crate) fn invalid_state(&self, message: &str) -> ControllerError {
        ControllerError::InvalidState {
            controller: self.id().to_string(),
            state: self.state(),
            message: message.to_string(),
        }
    }

    /// Spawn the controller's thread and wait until it is live.
    ///
    /// Main controllers cannot be spawned; run them with [`Controller::exec`].
    pub fn start(&self) -> ControlResult<()> {
        if self.kind() == ControllerKind::Main {
            return Err(self.invalid_state("main controller runs on the calling thread"));
        }
        let handler = self.take_handler()?;
        self.set_state(ControllerState::Starting);

        let controller = self.clone();
        let spawned = std::thread::Builder::new()
            .name(self.id().to_string())
            .spawn(move || controller.drive(handler));
        match spawned {
            Ok(handle) => *self.inner.thread.lock() = Some(handle),
            Err(err) => {
                error!(controller = %self.id(), error = %err, "Failed to spawn controller thread");
                self.teardown();
                return Err(ControllerError::Remote(err.into()));
            }
        }

        self.sync_exec_point(POINT_START, None)
    }

    /// Run the controller on the calling thread until it stops.
    pub fn exec(&self) -> ControlResult<()> {
        let handler = self.take_handler()?;
        self.set_state(ControllerState::Starting);
        self.drive(handler);
        Ok(())
    }

    /// Lifecycle driver: runs on the controller's own thread.
    fn drive(&self, mut handler: Box<dyn ControllerHandler>) {
        let _bound = bind(self.clone());

        if let Err(err) = self.inner.registry.promote_to_running(self) {
            error!(controller = %self.id(), error = %err, "Controller could not be promoted to running");
            self.teardown();
            return;
        }
        self.set_state(ControllerState::Running);
        info!(controller = %self.id(), kind = ?self.kind(), "Controller started");
        let _ = self.notify_point(POINT_START);

        let ctx = ControllerContext::new(self.clone());
        let outcome = catch_unwind(AssertUnwindSafe(|| -> ControlResult<()> {
            handler.on_start(&ctx)?;
            self.notify_point(POINT_RUN)?;
            match self.kind() {
                ControllerKind::Run => handler.run(&ctx),
                ControllerKind::Loop | ControllerKind::Main => ctx.run_until_stopped(),
            }
        }));

        self.set_state(ControllerState::Finishing);
        if self.kind() == ControllerKind::Main {
            // Dependents release their resources before the root exits.
            let timeout = self.runtime().stop_timeout();
            self.inner
                .registry
                .stop_all_except(Some(self.id()), true, Some(timeout));
        }

        if catch_unwind(AssertUnwindSafe(|| handler.on_finish(&ctx))).is_err() {
            error!(controller = %self.id(), "Controller on_finish panicked");
        }
        drop(ctx);
        drop(handler);
        self.teardown();

        let failure = match outcome {
            Ok(Ok(())) | Ok(Err(ControllerError::StopSignal)) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };
        match failure {
            None => info!(controller = %self.id(), "Controller finished"),
            Some(reason) => {
                error!(controller = %self.id(), error = %reason, "Controller failed; shutting down");
                self.escalate();
            }
        }
    }

    /// Orderly shutdown of the whole controller set after a failure.
    fn escalate(&self) {
        let registry = self.inner.registry.clone();
        match registry.main() {
            Some(main) if !main.same(self) => {
                if let Err(err) = main.request_stop() {
                    warn!(error = %err, "Failed to stop main controller");
                }
            }
            Some(_) => {}
            None => registry.stop_all(false, None),
        }
    }

    /// Release everything the controller owns and mark it stopped.
    fn teardown(&self) {
        let subscriptions = {
            let mut ids = self.inner.subscriptions.lock();
            self.set_state(ControllerState::Stopped);
            std::mem::take(&mut *ids)
        };
        for id in subscriptions {
            self.inner.bus.unsubscribe(id);
        }

        let dropped = self.inner.messages.lock().drain();
        if !dropped.is_empty() {
            debug!(controller = %self.id(), count = dropped.len(), "Dropping queued messages");
        }
        drop(dropped);
        self.inner.host.close();
        self.inner.registry.unregister(self);

        let notifiers: Vec<_> = {
            let mut notes = self.inner.exec_notes.lock();
            notes.finalized = true;
            notes.points.entry(POINT_STOP.to_string()).or_default();
            notes
                .points
                .iter_mut()
                .filter(|(_, note)| !note.notified)
                .map(|(point, note)| {
                    if point == POINT_STOP {
                        note.notified = true;
                    } else {
                        note.aborted = true;
                    }
                    note.notifier.clone()
                })
                .collect()
        };
        for notifier in notifiers {
            notifier.notify();
        }
    }

    pub(crate) fn notify_point(&self, point: &str) -> ControlResult<()> {
        let notifier = {
            let mut notes = self.inner.exec_notes.lock();
            let note = notes.points.entry(point.to_string()).or_default();
            if note.notified {
                return Err(ControllerError::ExecPointNotified {
                    controller: self.id().to_string(),
                    point: point.to_string(),
                });
            }
            note.notified = true;
            note.notifier.clone()
        };
        debug!(controller = %self.id(), point, "Exec point reached");
        notifier.notify();
        Ok(())
    }

    /// Check whether an exec point was reached.
    pub fn exec_point_reached(&self, point: &str) -> bool {
        self.inner
            .exec_notes
            .lock()
            .points
            .get(point)
            .is_some_and(|note| note.notified && !note.aborted)
    }

    /// Wait until the controller reaches an exec point.
    ///
    /// Returns immediately if the point was already reached. Fails with
    /// `NoController` if the controller stopped without reaching it.
    pub fn sync_exec_point(&self, point: &str, timeout: Option<Duration>) -> ControlResult<()> {
        let notifier = {
            let mut notes = self.inner.exec_notes.lock();
            if notes.finalized && !notes.points.get(point).is_some_and(|n| n.notified) {
                return Err(ControllerError::NoController(self.id().to_string()));
            }
            let note = notes.points.entry(point.to_string()).or_default();
            if note.notified {
                return Ok(());
            }
            note.notifier.clone()
        };

        notifier.wait(1, timeout)?;
        let aborted = self
            .inner
            .exec_notes
            .lock()
            .points
            .get(point)
            .is_some_and(|note| note.aborted);
        if aborted {
            return Err(ControllerError::NoController(self.id().to_string()));
        }
        Ok(())
    }

    /// Mark a stop request without unwinding the caller.
    ///
    /// A controller that was never started is discarded right away.
    pub(crate) fn request_stop(&self) -> ControlResult<()> {
        match self.state() {
            ControllerState::Stopped => Ok(()),
            ControllerState::Created => {
                let handler = self.inner.handler.lock().take();
                if handler.is_some() {
                    debug!(controller = %self.id(), "Discarding controller that never started");
                    drop(handler);
                    self.teardown();
                } else {
                    // Lost a race with `start`: the thread will see the flag.
                    self.inner.stop_requested.store(true, Ordering::SeqCst);
                    self.inner.host.wake();
                }
                Ok(())
            }
            _ => {
                if !self.inner.stop_requested.swap(true, Ordering::SeqCst) {
                    debug!(controller = %self.id(), "Stop requested");
                }
                self.inner.host.wake();
                Ok(())
            }
        }
    }

    /// Request the controller to stop.
    ///
    /// From another thread this marks the request and returns; the owning
    /// thread unwinds at its next checkpoint. On the controller's own thread
    /// it returns `Err(StopSignal)`, to be propagated with `?`.
    pub fn stop(&self) -> ControlResult<()> {
        self.request_stop()?;
        if self.is_current_thread() && self.state() == ControllerState::Running {
            return Err(ControllerError::StopSignal);
        }
        Ok(())
    }

    /// Request a stop and, with `sync`, wait until the controller stopped.
    pub fn stop_and_wait(&self, sync: bool, timeout: Option<Duration>) -> ControlResult<()> {
        self.stop()?;
        if sync {
            self.wait_stopped(timeout)?;
        }
        Ok(())
    }

    /// Wait until the controller has stopped.
    ///
    /// Returns immediately when called on the controller's own thread.
    pub fn wait_stopped(&self, timeout: Option<Duration>) -> ControlResult<()> {
        if self.is_current_thread() {
            return Ok(());
        }
        self.sync_exec_point(POINT_STOP, timeout)
    }

    /// Join the controller's thread, if it was spawned by `start`.
    pub fn join(&self) -> ControlResult<()> {
        if self.is_current_thread() {
            return Err(self.invalid_state("controller cannot join its own thread"));
        }
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|p| ControllerError::Remote(anyhow::anyhow!(panic_message(p.as_ref()))))?;
        }
        Ok(())
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
