//! Batch jobs: resumable multi-step jobs advanced one step per tick.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::controller::ControllerContext;
use crate::error::ControlResult;

/// Outcome of one batch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStep {
    /// Run the next step after the current period.
    Continue,
    /// Run the next step after this period from now on.
    ContinueWithPeriod(Duration),
    /// Done: the job is removed and its cleanup runs.
    Finished,
}

/// A resumable job; each call advances it by one step.
pub trait BatchJob: Send + 'static {
    fn step(&mut self, ctx: &ControllerContext) -> ControlResult<BatchStep>;
}

impl<F> BatchJob for F
where
    F: FnMut(&ControllerContext) -> ControlResult<BatchStep> + Send + 'static,
{
    fn step(&mut self, ctx: &ControllerContext) -> ControlResult<BatchStep> {
        self(ctx)
    }
}

pub(crate) type BatchFactory = dyn Fn(&Value) -> Box<dyn BatchJob> + Send + Sync;
pub(crate) type BatchCleanup = dyn Fn(&ControllerContext, &Value) + Send + Sync;

/// Registered batch job: how to start it and how to clean up after it.
pub(crate) struct BatchDef {
    pub(crate) factory: Box<BatchFactory>,
    pub(crate) cleanup: Option<Arc<BatchCleanup>>,
}

/// A started batch job.
pub(crate) struct BatchRun {
    pub(crate) job: Box<dyn BatchJob>,
    pub(crate) args: Value,
    pub(crate) cleanup: Option<Arc<BatchCleanup>>,
}

impl BatchRun {
    pub(crate) fn start(def: &BatchDef, args: Value) -> Self {
        Self {
            job: (def.factory)(&args),
            args,
            cleanup: def.cleanup.clone(),
        }
    }

    /// Detach the cleanup so it can run later on the scheduler thread.
    pub(crate) fn into_cleanup(self) -> Option<PendingCleanup> {
        self.cleanup.map(|cleanup| PendingCleanup {
            cleanup,
            args: self.args,
        })
    }
}

/// Cleanup waiting to run on the scheduler thread.
pub(crate) struct PendingCleanup {
    cleanup: Arc<BatchCleanup>,
    args: Value,
}

impl PendingCleanup {
    #[cfg(test)]
    pub(crate) fn new(cleanup: Arc<BatchCleanup>, args: Value) -> Self {
        Self { cleanup, args }
    }

    pub(crate) fn run(self, ctx: &ControllerContext) {
        (self.cleanup)(ctx, &self.args)
    }
}
