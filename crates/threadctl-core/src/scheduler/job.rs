//! Job table shared between a scheduler and its handles.
//!
//! Entries are kept in "least recently run first" order: running a job
//! moves it to the end, so among jobs due at the same instant the one that
//! waited longest goes first. A job's task is taken out of the table while
//! it runs, so the lock is never held across user code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::batch::{BatchRun, PendingCleanup};
use crate::controller::ControllerContext;
use crate::error::{ControlResult, ControllerError};

pub(crate) type JobFn = Box<dyn FnMut(&ControllerContext) -> ControlResult<()> + Send>;

pub(crate) enum Task {
    Periodic(JobFn),
    Batch(BatchRun),
}

impl Task {
    fn is_batch(&self) -> bool {
        matches!(self, Task::Batch(_))
    }
}

struct Entry {
    name: String,
    uid: u64,
    batch: bool,
    period: Duration,
    next_due: Instant,
    last_run: Option<Instant>,
    task: Option<Task>,
}

#[derive(Default)]
struct Table {
    entries: Vec<Entry>,
    next_uid: u64,
    cleanups: Vec<PendingCleanup>,
}

#[derive(Default)]
pub(crate) struct JobTable {
    table: Mutex<Table>,
    dirty: AtomicBool,
}

impl JobTable {
    pub(crate) fn insert(
        &self,
        name: &str,
        period: Duration,
        task: Task,
        initial_call: bool,
    ) -> ControlResult<()> {
        let now = Instant::now();
        let mut table = self.table.lock();
        if table.entries.iter().any(|e| e.name == name) {
            return Err(ControllerError::DuplicateJob(name.to_string()));
        }
        table.next_uid += 1;
        let uid = table.next_uid;
        table.entries.push(Entry {
            name: name.to_string(),
            uid,
            batch: task.is_batch(),
            period,
            next_due: if initial_call { now } else { now + period },
            last_run: None,
            task: Some(task),
        });
        drop(table);
        debug!(job = name, ?period, initial_call, "Job added");
        self.mark_dirty();
        Ok(())
    }

    /// Remove a job; a removed batch job's cleanup is queued.
    ///
    /// With `batch_only`, fails with `NoJob` unless the job is a running
    /// batch job.
    pub(crate) fn remove(&self, name: &str, batch_only: bool) -> ControlResult<()> {
        let mut table = self.table.lock();
        let index = table
            .entries
            .iter()
            .position(|e| e.name == name && (!batch_only || e.batch))
            .ok_or_else(|| ControllerError::NoJob(name.to_string()))?;
        let entry = table.entries.remove(index);
        // A task that is running comes back through `put_back`.
        if let Some(Task::Batch(run)) = entry.task {
            table.cleanups.extend(run.into_cleanup());
        }
        drop(table);
        debug!(job = name, "Job removed");
        self.mark_dirty();
        Ok(())
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.table.lock().entries.iter().any(|e| e.name == name)
    }

    pub(crate) fn contains_batch(&self, name: &str) -> bool {
        self.table
            .lock()
            .entries
            .iter()
            .any(|e| e.name == name && e.batch)
    }

    pub(crate) fn set_period(&self, name: &str, period: Duration) -> ControlResult<()> {
        let now = Instant::now();
        let mut table = self.table.lock();
        let entry = table
            .entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| ControllerError::NoJob(name.to_string()))?;
        entry.period = period;
        entry.next_due = entry.last_run.unwrap_or(now) + period;
        drop(table);
        self.mark_dirty();
        Ok(())
    }

    /// Earliest due job that is not running, oldest first on ties.
    pub(crate) fn next_due(&self) -> Option<(u64, Instant)> {
        let table = self.table.lock();
        let mut best: Option<(u64, Instant)> = None;
        for entry in table.entries.iter().filter(|e| e.task.is_some()) {
            if best.is_none_or(|(_, due)| entry.next_due < due) {
                best = Some((entry.uid, entry.next_due));
            }
        }
        best
    }

    /// Take a job's task to run it and re-arm its next due time.
    pub(crate) fn take_for_run(&self, uid: u64, now: Instant) -> Option<(String, Task)> {
        let mut table = self.table.lock();
        let index = table
            .entries
            .iter()
            .position(|e| e.uid == uid && e.task.is_some())?;
        let mut entry = table.entries.remove(index);
        let task = entry.task.take()?;
        entry.next_due = (entry.next_due + entry.period).max(now);
        entry.last_run = Some(now);
        let name = entry.name.clone();
        table.entries.push(entry);
        Some((name, task))
    }

    /// Return a task after its run; hands it back if the job was removed
    /// in the meantime.
    pub(crate) fn put_back(&self, uid: u64, task: Task, period: Option<Duration>) -> Option<Task> {
        let mut table = self.table.lock();
        let Some(entry) = table.entries.iter_mut().find(|e| e.uid == uid) else {
            return Some(task);
        };
        if let Some(period) = period {
            entry.period = period;
            entry.next_due = entry.last_run.unwrap_or_else(Instant::now) + period;
        }
        entry.task = Some(task);
        None
    }

    /// Drop a job's entry after its task finished for good.
    pub(crate) fn retire(&self, uid: u64) {
        self.table.lock().entries.retain(|e| e.uid != uid);
    }

    /// Drop a job whose task failed mid-run, queueing its cleanup.
    pub(crate) fn abandon(&self, uid: u64, cleanup: Option<PendingCleanup>) {
        let mut table = self.table.lock();
        table.entries.retain(|e| e.uid != uid);
        table.cleanups.extend(cleanup);
    }

    pub(crate) fn take_cleanups(&self) -> Vec<PendingCleanup> {
        std::mem::take(&mut self.table.lock().cleanups)
    }

    /// Remove every job, returning cleanups of the batch jobs among them.
    pub(crate) fn clear(&self) -> Vec<PendingCleanup> {
        let mut table = self.table.lock();
        let entries = std::mem::take(&mut table.entries);
        let mut cleanups = std::mem::take(&mut table.cleanups);
        drop(table);
        for entry in entries {
            if let Some(Task::Batch(run)) = entry.task {
                cleanups.extend(run.into_cleanup());
            }
        }
        cleanups
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Task {
        Task::Periodic(Box::new(|_| Ok(())))
    }

    #[test]
    fn test_duplicate_job_name() {
        let jobs = JobTable::default();
        jobs.insert("poll", Duration::from_millis(10), noop(), false)
            .unwrap();
        let err = jobs
            .insert("poll", Duration::from_millis(20), noop(), false)
            .unwrap_err();
        assert!(matches!(err, ControllerError::DuplicateJob(name) if name == "poll"));
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn test_initial_call_is_due_now() {
        let jobs = JobTable::default();
        jobs.insert("later", Duration::from_secs(10), noop(), false)
            .unwrap();
        jobs.insert("now", Duration::from_secs(10), noop(), true)
            .unwrap();

        let (uid, due) = jobs.next_due().unwrap();
        assert!(due <= Instant::now());
        let (name, _task) = jobs.take_for_run(uid, Instant::now()).unwrap();
        assert_eq!(name, "now");
    }

    #[test]
    fn test_ties_go_to_least_recently_run() {
        let jobs = JobTable::default();
        jobs.insert("a", Duration::ZERO, noop(), true).unwrap();
        jobs.insert("b", Duration::ZERO, noop(), true).unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            let now = Instant::now();
            let (uid, _) = jobs.next_due().unwrap();
            let (name, task) = jobs.take_for_run(uid, now).unwrap();
            order.push(name);
            assert!(jobs.put_back(uid, task, None).is_none());
        }
        assert_eq!(order, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_running_job_is_not_due() {
        let jobs = JobTable::default();
        jobs.insert("only", Duration::ZERO, noop(), true).unwrap();
        let (uid, _) = jobs.next_due().unwrap();
        let (_, task) = jobs.take_for_run(uid, Instant::now()).unwrap();

        assert!(jobs.next_due().is_none());
        assert!(jobs.take_for_run(uid, Instant::now()).is_none());
        jobs.put_back(uid, task, None);
        assert!(jobs.next_due().is_some());
    }

    #[test]
    fn test_removed_while_running_hands_task_back() {
        let jobs = JobTable::default();
        jobs.insert("gone", Duration::ZERO, noop(), true).unwrap();
        let (uid, _) = jobs.next_due().unwrap();
        let (_, task) = jobs.take_for_run(uid, Instant::now()).unwrap();

        jobs.remove("gone", false).unwrap();
        assert!(jobs.put_back(uid, task, None).is_some());
        assert!(!jobs.contains("gone"));
    }

    #[test]
    fn test_rearm_skips_missed_ticks() {
        let jobs = JobTable::default();
        jobs.insert("tick", Duration::from_millis(10), noop(), true)
            .unwrap();
        let (uid, _) = jobs.next_due().unwrap();
        let late = Instant::now() + Duration::from_millis(100);
        let (_, task) = jobs.take_for_run(uid, late).unwrap();
        jobs.put_back(uid, task, None);

        let (_, due) = jobs.next_due().unwrap();
        assert_eq!(due, late);
    }

    #[test]
    fn test_set_period_and_missing_job() {
        let jobs = JobTable::default();
        jobs.insert("p", Duration::from_secs(100), noop(), false)
            .unwrap();
        jobs.set_period("p", Duration::ZERO).unwrap();
        let (_, due) = jobs.next_due().unwrap();
        assert!(due <= Instant::now());

        assert!(matches!(
            jobs.set_period("q", Duration::ZERO),
            Err(ControllerError::NoJob(_))
        ));
        assert!(matches!(jobs.remove("q", false), Err(ControllerError::NoJob(_))));
        assert!(matches!(jobs.remove("p", true), Err(ControllerError::NoJob(_))));
    }

    #[test]
    fn test_abandon_queues_cleanup() {
        let jobs = JobTable::default();
        jobs.insert("step", Duration::ZERO, noop(), true).unwrap();
        let (uid, _) = jobs.next_due().unwrap();
        let _task = jobs.take_for_run(uid, Instant::now()).unwrap();

        let cleanup: std::sync::Arc<super::super::batch::BatchCleanup> =
            std::sync::Arc::new(|_: &ControllerContext, _: &serde_json::Value| {});
        jobs.abandon(
            uid,
            Some(PendingCleanup::new(cleanup, serde_json::json!({"axis": "x"}))),
        );
        assert!(!jobs.contains("step"));
        assert_eq!(jobs.take_cleanups().len(), 1);
    }

    #[test]
    fn test_dirty_flag() {
        let jobs = JobTable::default();
        assert!(!jobs.take_dirty());
        jobs.insert("x", Duration::ZERO, noop(), false).unwrap();
        assert!(jobs.take_dirty());
        assert!(!jobs.take_dirty());
    }
}
