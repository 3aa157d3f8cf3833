//! Hosting loop for controller threads.
//!
//! [`HostLoop`] is the event loop a controller thread runs: posted
//! callables from other threads plus timers. [`ThreadLoop`] implements it
//! with a mutex and a condition variable.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

/// A callable posted to a hosting loop.
pub type Posted = Box<dyn FnOnce() + Send + 'static>;

/// Event loop primitive a controller thread runs on.
pub trait HostLoop: Send + Sync {
    /// Process pending posted callables and due timers.
    ///
    /// With `block` set, waits until something is processed, the loop is
    /// woken, or `timeout` elapses (`None` waits indefinitely). Returns the
    /// number of callables run.
    fn run_once(&self, block: bool, timeout: Option<Duration>) -> usize;

    /// Schedule a callable to run on the loop's thread as soon as possible.
    ///
    /// Returns `false` (and drops the callable) if the loop is closed.
    fn post(&self, task: Posted) -> bool;

    /// Schedule a callable to run after `delay`.
    fn set_timer(&self, delay: Duration, task: Posted) -> TimerHandle;

    /// Interrupt a blocking `run_once` without posting work.
    fn wake(&self) {
        self.post(Box::new(|| {}));
    }

    /// Drop all pending work and reject further posts.
    fn close(&self) {}
}

/// Cancellation handle returned by [`HostLoop::set_timer`].
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Cancel the timer. Has no effect if it already fired.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if the timer was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct TimerEntry {
    due: Instant,
    seq: u64,
    task: Posted,
    handle: TimerHandle,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Earliest due first (reverse for the max-heap), then by arming order
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct LoopState {
    posted: VecDeque<Posted>,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    woken: bool,
    closed: bool,
}

impl LoopState {
    /// Move due timers into the posted queue.
    fn promote_timers(&mut self, now: Instant) {
        while let Some(entry) = self.timers.peek() {
            if entry.due > now {
                break;
            }
            if let Some(entry) = self.timers.pop() {
                if !entry.handle.is_cancelled() {
                    self.posted.push_back(entry.task);
                }
            }
        }
    }

    fn next_timer(&self) -> Option<Instant> {
        self.timers.peek().map(|e| e.due)
    }
}

/// Condition-variable based [`HostLoop`].
pub struct ThreadLoop {
    state: Mutex<LoopState>,
    cond: Condvar,
    max_batch: usize,
}

impl ThreadLoop {
    /// Create a new loop.
    pub fn new(max_batch: usize) -> Self {
        Self {
            state: Mutex::new(LoopState::default()),
            cond: Condvar::new(),
            max_batch: max_batch.max(1),
        }
    }

    /// Number of posted callables waiting to run.
    pub fn pending(&self) -> usize {
        self.state.lock().posted.len()
    }

    /// Check if the loop was closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for ThreadLoop {
    fn default() -> Self {
        Self::new(64)
    }
}

impl HostLoop for ThreadLoop {
    fn run_once(&self, block: bool, timeout: Option<Duration>) -> usize {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        loop {
            state.promote_timers(Instant::now());

            if !state.posted.is_empty() {
                // Pop one at a time so that a nested loop started by one of
                // the callables picks up the rest.
                let budget = state.posted.len().min(self.max_batch);
                let mut done = 0;
                while done < budget {
                    let Some(task) = state.posted.pop_front() else {
                        break;
                    };
                    drop(state);
                    task();
                    done += 1;
                    state = self.state.lock();
                }
                state.woken = false;
                trace!(done, "ThreadLoop: processed posted callables");
                return done;
            }

            if state.woken {
                state.woken = false;
                return 0;
            }

            if !block || state.closed {
                return 0;
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return 0;
            }

            let wait_until = match (deadline, state.next_timer()) {
                (Some(d), Some(t)) => Some(d.min(t)),
                (Some(d), None) => Some(d),
                (None, t) => t,
            };

            match wait_until {
                Some(until) => {
                    self.cond.wait_until(&mut state, until);
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    fn post(&self, task: Posted) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            drop(task);
            return false;
        }
        state.posted.push_back(task);
        drop(state);
        self.cond.notify_all();
        true
    }

    fn set_timer(&self, delay: Duration, task: Posted) -> TimerHandle {
        let handle = TimerHandle::default();
        let mut state = self.state.lock();
        if state.closed {
            handle.cancel();
            drop(state);
            drop(task);
            return handle;
        }
        state.timer_seq += 1;
        let seq = state.timer_seq;
        state.timers.push(TimerEntry {
            due: Instant::now() + delay,
            seq,
            task,
            handle: handle.clone(),
        });
        drop(state);
        self.cond.notify_all();
        handle
    }

    fn wake(&self) {
        self.state.lock().woken = true;
        self.cond.notify_all();
    }

    fn close(&self) {
        let (posted, timers) = {
            let mut state = self.state.lock();
            state.closed = true;
            (
                std::mem::take(&mut state.posted),
                std::mem::take(&mut state.timers),
            )
        };
        if !posted.is_empty() || !timers.is_empty() {
            debug!(
                posted = posted.len(),
                timers = timers.len(),
                "ThreadLoop: dropping pending work on close"
            );
        }
        // Dropped outside the lock: dropping a pending call resolves its
        // waiter, which may post to other loops.
        drop(posted);
        drop(timers);
        self.cond.notify_all();
    }
}

#[cfg(test)]
#[path = "host_tests.rs"]
mod tests;
