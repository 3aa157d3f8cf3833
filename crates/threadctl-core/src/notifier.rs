//! Cross-thread synchronization primitives.
//!
//! - [`Notifier`]: one-shot, value-carrying wait/notify handle.
//! - [`MultiNotifier`]: reusable barrier; each `notify()` bumps a counter
//!   and releases every parked waiter with the new count.
//!
//! Waiting never blocks the thread outright: the waiter keeps running its
//! own hosting loop (see [`crate::thread_context`]), so a controller thread
//! stays responsive to interrupts and stop requests while it waits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{ControlResult, ControllerError};
use crate::host::HostLoop;
use crate::thread_context::{current_loop, suspend_until};

struct Slot<T> {
    value: Option<T>,
    notified: bool,
    waiter: Option<Arc<dyn HostLoop>>,
}

/// One-shot cross-thread notifier carrying a value.
///
/// A notification delivered before the wait is kept, so the wait returns
/// without parking.
pub struct Notifier<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for Notifier<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Send> std::fmt::Debug for Notifier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("notified", &self.is_notified())
            .finish()
    }
}

impl<T: Send> Notifier<T> {
    /// Create a pending notifier.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                value: None,
                notified: false,
                waiter: None,
            })),
        }
    }

    /// Check whether `notify` was called.
    pub fn is_notified(&self) -> bool {
        self.slot.lock().notified
    }

    /// Deliver the value and wake the waiter.
    ///
    /// Fails with `AlreadyNotified` on a second delivery.
    pub fn notify(&self, value: T) -> ControlResult<()> {
        let waiter = {
            let mut slot = self.slot.lock();
            if slot.notified {
                return Err(ControllerError::AlreadyNotified);
            }
            slot.notified = true;
            slot.value = Some(value);
            slot.waiter.take()
        };
        if let Some(waiter) = waiter {
            waiter.wake();
        }
        Ok(())
    }

    /// Wait for the value.
    ///
    /// The value is handed out once; a second `wait` after a successful one
    /// times out.
    pub fn wait(&self, timeout: Option<Duration>) -> ControlResult<T> {
        self.slot.lock().waiter = Some(current_loop());
        let result = suspend_until(timeout, || self.slot.lock().value.take());
        if result.is_err() {
            self.slot.lock().waiter = None;
        }
        result
    }

    /// Take the value if it was already delivered.
    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().value.take()
    }

    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<T: Send> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct Barrier {
    count: u64,
    waiters: Vec<Notifier<u64>>,
}

/// Barrier notifier for an unbounded number of waiters.
///
/// `wait(state)` returns as soon as the notification count reaches `state`;
/// the counter increment and the swap of the waiter list happen under one
/// lock, so no waiter parked before or racing with `notify()` misses it.
pub struct MultiNotifier {
    barrier: Mutex<Barrier>,
}

impl MultiNotifier {
    /// Create a barrier with a zero count.
    pub fn new() -> Self {
        Self {
            barrier: Mutex::new(Barrier {
                count: 0,
                waiters: Vec::new(),
            }),
        }
    }

    /// Current notification count.
    pub fn count(&self) -> u64 {
        self.barrier.lock().count
    }

    /// Number of parked waiters.
    pub fn waiting(&self) -> usize {
        self.barrier.lock().waiters.len()
    }

    /// Increment the count and release every parked waiter.
    ///
    /// Returns the new count.
    pub fn notify(&self) -> u64 {
        let (count, waiters) = {
            let mut barrier = self.barrier.lock();
            barrier.count += 1;
            (barrier.count, std::mem::take(&mut barrier.waiters))
        };
        for waiter in waiters {
            if waiter.notify(count).is_err() {
                warn!(count, "MultiNotifier: waiter was already notified");
            }
        }
        count
    }

    /// Wait until the count reaches `state` and return the count.
    pub fn wait(&self, state: u64, timeout: Option<Duration>) -> ControlResult<u64> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let waiter = {
                let mut barrier = self.barrier.lock();
                if barrier.count >= state {
                    return Ok(barrier.count);
                }
                let waiter = Notifier::new();
                barrier.waiters.push(waiter.clone());
                waiter
            };

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match waiter.wait(remaining) {
                Ok(count) if count >= state => return Ok(count),
                Ok(_) => continue,
                Err(err) => {
                    self.barrier.lock().waiters.retain(|w| !w.same(&waiter));
                    return Err(err);
                }
            }
        }
    }

    /// Wait for the next notification after the current one.
    pub fn wait_next(&self, timeout: Option<Duration>) -> ControlResult<u64> {
        let target = self.count() + 1;
        self.wait(target, timeout)
    }
}

impl Default for MultiNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MultiNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let barrier = self.barrier.lock();
        f.debug_struct("MultiNotifier")
            .field("count", &barrier.count)
            .field("waiting", &barrier.waiters.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "notifier_tests.rs"]
mod tests;
