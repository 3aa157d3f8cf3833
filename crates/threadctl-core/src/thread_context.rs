//! Per-thread controller binding and the shared suspension primitive.
//!
//! Every thread has a hosting loop: controller threads bind their own
//! controller's loop, any other thread lazily gets a private [`ThreadLoop`].
//! All blocking waits in the framework go through [`suspend_until`], which
//! keeps running that loop so interrupts posted to the waiting thread are
//! still served and stop requests are still observed.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::controller::Controller;
use crate::error::{ControlResult, ControllerError};
use crate::host::{HostLoop, ThreadLoop};

thread_local! {
    static CURRENT: RefCell<Option<Controller>> = const { RefCell::new(None) };
    static LOCAL_LOOP: Arc<ThreadLoop> = Arc::new(ThreadLoop::default());
}

/// Controller owning the current thread, if any.
pub fn current_controller() -> Option<Controller> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Check whether the current thread belongs to the controller with this id.
pub fn is_current(id: &str) -> bool {
    CURRENT.with(|c| c.borrow().as_ref().is_some_and(|ctl| ctl.id() == id))
}

/// Hosting loop of the current thread.
pub fn current_loop() -> Arc<dyn HostLoop> {
    match current_controller() {
        Some(ctl) => ctl.host(),
        None => LOCAL_LOOP.with(|l| l.clone() as Arc<dyn HostLoop>),
    }
}

/// Binding of a controller to the current thread; unbinds on drop.
pub(crate) struct BindGuard {
    previous: Option<Controller>,
}

impl Drop for BindGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

pub(crate) fn bind(controller: Controller) -> BindGuard {
    let previous = CURRENT.with(|c| c.borrow_mut().replace(controller));
    BindGuard { previous }
}

/// Return `StopSignal` if the controller owning this thread must unwind.
pub(crate) fn check_stop() -> ControlResult<()> {
    match current_controller() {
        Some(ctl) if ctl.should_unwind() => Err(ControllerError::StopSignal),
        _ => Ok(()),
    }
}

/// Block in the current thread's loop until `poll` yields a value.
///
/// `poll` is re-evaluated every time the loop processes work or is woken.
/// Fails with `TimedOut` once `timeout` elapses, or with `StopSignal` if
/// the controller owning this thread was asked to stop.
pub(crate) fn suspend_until<T>(
    timeout: Option<Duration>,
    mut poll: impl FnMut() -> Option<T>,
) -> ControlResult<T> {
    let host = current_loop();
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        if let Some(value) = poll() {
            return Ok(value);
        }
        check_stop()?;

        let remaining = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Err(ControllerError::TimedOut);
                }
                Some(d - now)
            }
            None => None,
        };
        host.run_once(true, remaining);
    }
}

/// Sleep in the current thread's loop, serving interrupts meanwhile.
pub(crate) fn sleep(duration: Duration) -> ControlResult<()> {
    match suspend_until(Some(duration), || None::<()>) {
        Err(ControllerError::TimedOut) => Ok(()),
        other => other,
    }
}
