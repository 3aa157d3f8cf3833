//! Repeating controller running periodic jobs.
//!
//! A scheduler is a [`ControllerKind::Run`] controller whose `run` body
//! interleaves named periodic jobs with remote calls queued under
//! [`EXECUTE_TAG`]. Jobs run only on the scheduler's thread, one at a time,
//! so a job is never re-entered. Jobs can be managed from any thread
//! through the [`SchedulerHandle`].

mod batch;
mod job;
mod variables;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::controller::{
    Controller, ControllerBuilder, ControllerContext, ControllerHandler, ControllerKind,
};
use crate::error::{ControlResult, ControllerError};
use crate::message::EXECUTE_TAG;
use crate::thread_context::suspend_until;

pub use batch::{BatchJob, BatchStep};
pub use variables::VariableStore;

use batch::{BatchDef, BatchRun};
use job::{JobTable, Task};

type SetupFn = Box<dyn FnMut(&ControllerContext) -> ControlResult<()> + Send>;
type FinalizeFn = Box<dyn FnMut(&ControllerContext) + Send>;

#[derive(Default)]
struct Shared {
    jobs: JobTable,
    batches: DashMap<String, Arc<BatchDef>>,
    variables: Arc<VariableStore>,
}

/// Scheduler loop, installed as a controller handler by [`Scheduler::build`].
#[derive(Default)]
pub struct Scheduler {
    shared: Arc<Shared>,
    setup: Option<SetupFn>,
    finalize: Option<FinalizeFn>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook run on the scheduler thread before the first job.
    pub fn on_setup(
        mut self,
        setup: impl FnMut(&ControllerContext) -> ControlResult<()> + Send + 'static,
    ) -> Self {
        self.setup = Some(Box::new(setup));
        self
    }

    /// Hook run on the scheduler thread after the last job.
    pub fn on_finalize(mut self, finalize: impl FnMut(&ControllerContext) + Send + 'static) -> Self {
        self.finalize = Some(Box::new(finalize));
        self
    }

    /// Create the scheduler controller.
    ///
    /// The builder's kind is forced to `Run`; named commands are queued
    /// under [`EXECUTE_TAG`] so they interleave with jobs.
    pub fn build(self, builder: ControllerBuilder) -> ControlResult<SchedulerHandle> {
        let shared = self.shared.clone();
        let controller = builder
            .kind(ControllerKind::Run)
            .command_tag(EXECUTE_TAG)
            .build(self)?;
        Ok(SchedulerHandle { controller, shared })
    }

    fn run_job(&self, ctx: &ControllerContext, uid: u64) -> ControlResult<()> {
        let jobs = &self.shared.jobs;
        let Some((name, task)) = jobs.take_for_run(uid, Instant::now()) else {
            return Ok(());
        };
        trace!(controller = %ctx.id(), job = %name, "Running job");

        match task {
            Task::Periodic(mut f) => {
                f(ctx)?;
                jobs.put_back(uid, Task::Periodic(f), None);
            }
            Task::Batch(mut run) => {
                let step = match run.job.step(ctx) {
                    Ok(step) => step,
                    Err(err) => {
                        // Usually a stop unwinding the step; `on_finish` runs the cleanup.
                        debug!(controller = %ctx.id(), job = %name, error = %err, "Batch step failed");
                        jobs.abandon(uid, run.into_cleanup());
                        return Err(err);
                    }
                };
                let period = match step {
                    BatchStep::Continue => None,
                    BatchStep::ContinueWithPeriod(period) => Some(period),
                    BatchStep::Finished => {
                        debug!(controller = %ctx.id(), job = %name, "Batch job finished");
                        jobs.retire(uid);
                        if let Some(cleanup) = run.into_cleanup() {
                            cleanup.run(ctx);
                        }
                        return Ok(());
                    }
                };
                // Stopped while the step ran: clean up here.
                if let Some(Task::Batch(run)) = jobs.put_back(uid, Task::Batch(run), period) {
                    if let Some(cleanup) = run.into_cleanup() {
                        cleanup.run(ctx);
                    }
                }
            }
        }
        Ok(())
    }

    fn run_cleanups(&self, ctx: &ControllerContext) {
        for cleanup in self.shared.jobs.take_cleanups() {
            cleanup.run(ctx);
        }
    }

    /// Wait up to `wait`, returning early when jobs change or commands
    /// arrive.
    fn idle(&self, ctx: &ControllerContext, wait: Duration) -> ControlResult<()> {
        let controller = ctx.controller();
        let result = suspend_until(Some(wait), || {
            (self.shared.jobs.take_dirty() || controller.pending_messages(EXECUTE_TAG) > 0)
                .then_some(())
        });
        match result {
            Ok(()) | Err(ControllerError::TimedOut) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl ControllerHandler for Scheduler {
    fn on_start(&mut self, ctx: &ControllerContext) -> ControlResult<()> {
        match self.setup.as_mut() {
            Some(setup) => setup(ctx),
            None => Ok(()),
        }
    }

    fn run(&mut self, ctx: &ControllerContext) -> ControlResult<()> {
        let quantum = ctx.runtime().poll_quantum();
        info!(controller = %ctx.id(), jobs = self.shared.jobs.len(), "Scheduler running");
        loop {
            ctx.check_messages()?;
            self.run_cleanups(ctx);

            let now = Instant::now();
            match self.shared.jobs.next_due() {
                Some((uid, due)) if due <= now => self.run_job(ctx, uid)?,
                next => {
                    let wait = next.map_or(quantum, |(_, due)| {
                        due.saturating_duration_since(now).min(quantum)
                    });
                    self.idle(ctx, wait)?;
                }
            }

            ctx.check_commands(EXECUTE_TAG)?;
        }
    }

    fn on_finish(&mut self, ctx: &ControllerContext) {
        if let Some(finalize) = self.finalize.as_mut() {
            finalize(ctx);
        }
        // Dropping the jobs also breaks cycles through handles they captured.
        for cleanup in self.shared.jobs.clear() {
            cleanup.run(ctx);
        }
        self.shared.batches.clear();
    }
}

/// Handle to a scheduler controller, usable from any thread.
#[derive(Clone)]
pub struct SchedulerHandle {
    controller: Controller,
    shared: Arc<Shared>,
}

impl std::ops::Deref for SchedulerHandle {
    type Target = Controller;

    fn deref(&self) -> &Controller {
        &self.controller
    }
}

impl SchedulerHandle {
    /// The scheduler's controller.
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Variables published by this scheduler.
    pub fn variables(&self) -> &Arc<VariableStore> {
        &self.shared.variables
    }

    fn changed(&self) {
        self.controller.host().wake();
    }

    /// Add a periodic job.
    ///
    /// With `initial_call` the first run is due immediately, otherwise one
    /// period from now.
    pub fn add_job(
        &self,
        name: &str,
        period: Duration,
        job: impl FnMut(&ControllerContext) -> ControlResult<()> + Send + 'static,
        initial_call: bool,
    ) -> ControlResult<()> {
        self.shared
            .jobs
            .insert(name, period, Task::Periodic(Box::new(job)), initial_call)?;
        self.changed();
        Ok(())
    }

    /// Remove a job. A running batch job is stopped and cleaned up.
    pub fn remove_job(&self, name: &str) -> ControlResult<()> {
        self.shared.jobs.remove(name, false)?;
        self.changed();
        Ok(())
    }

    /// Change a job's period, counted from its last run.
    pub fn change_job_period(&self, name: &str, period: Duration) -> ControlResult<()> {
        self.shared.jobs.set_period(name, period)?;
        self.changed();
        Ok(())
    }

    /// Check whether a job (periodic or running batch) exists.
    pub fn has_job(&self, name: &str) -> bool {
        self.shared.jobs.contains(name)
    }

    /// Register a batch job under `name`.
    ///
    /// `factory` builds a fresh job from the start arguments; `cleanup`
    /// runs on the scheduler thread with the same arguments once the job
    /// finishes or is stopped.
    pub fn add_batch_job<J>(
        &self,
        name: &str,
        factory: impl Fn(&Value) -> J + Send + Sync + 'static,
        cleanup: Option<Box<dyn Fn(&ControllerContext, &Value) + Send + Sync>>,
    ) -> ControlResult<()>
    where
        J: BatchJob,
    {
        if self.shared.batches.contains_key(name) {
            return Err(ControllerError::DuplicateJob(name.to_string()));
        }
        let def = BatchDef {
            factory: Box::new(move |args: &Value| Box::new(factory(args)) as Box<dyn BatchJob>),
            cleanup: cleanup.map(Arc::from),
        };
        self.shared.batches.insert(name.to_string(), Arc::new(def));
        debug!(controller = %self.controller.id(), job = name, "Batch job registered");
        Ok(())
    }

    /// Start a registered batch job; one step runs per `period`.
    pub fn start_batch_job(&self, name: &str, period: Duration, args: Value) -> ControlResult<()> {
        let def = self
            .shared
            .batches
            .get(name)
            .map(|d| d.value().clone())
            .ok_or_else(|| ControllerError::NoJob(name.to_string()))?;
        let run = BatchRun::start(&def, args);
        self.shared
            .jobs
            .insert(name, period, Task::Batch(run), true)?;
        info!(controller = %self.controller.id(), job = name, "Batch job started");
        self.changed();
        Ok(())
    }

    /// Stop a running batch job; its cleanup runs on the scheduler thread.
    pub fn stop_batch_job(&self, name: &str) -> ControlResult<()> {
        self.shared.jobs.remove(name, true)?;
        info!(controller = %self.controller.id(), job = name, "Batch job stopped");
        self.changed();
        Ok(())
    }

    /// Check whether a batch job is running.
    pub fn is_batch_job_running(&self, name: &str) -> bool {
        self.shared.jobs.contains_batch(name)
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
