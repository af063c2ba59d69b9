//! Context type for safe access to job system capabilities from within jobs.

use crate::counter::Counter;
use crate::error::JobSystemError;
use crate::fiber::{AwaitCounter, FiberYielder};
use crate::job::{FiberJob, JobId, JobPriority};
use crate::job_system::JobSystemHandle;

/// Context handed to every job closure.
///
/// It is the only way for a fiber to suspend itself. It borrows the fiber's
/// yielder, so it cannot leave the closure it was given to.
pub struct FiberContext<'a> {
    yielder: &'a FiberYielder,
    job_id: JobId,
    priority: JobPriority,
    system: JobSystemHandle,
}

impl<'a> FiberContext<'a> {
    pub(crate) fn new(
        yielder: &'a FiberYielder,
        job_id: JobId,
        priority: JobPriority,
        system: JobSystemHandle,
    ) -> Self {
        FiberContext {
            yielder,
            job_id,
            priority,
            system,
        }
    }

    /// Id of the job running this closure.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Priority the job was submitted with.
    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    /// Handle for submitting more work or waiting from outside fibers.
    pub fn handle(&self) -> &JobSystemHandle {
        &self.system
    }

    /// Suspends until `counter >= target`, resuming on this job's priority.
    pub fn await_counter(&self, counter: &Counter, target: u64) {
        self.wait(AwaitCounter::with_priority(
            counter.clone(),
            target,
            self.priority,
        ));
    }

    /// Suspends until `counter >= target`, resuming on the `priority` bucket.
    pub fn await_counter_at(&self, counter: &Counter, target: u64, priority: JobPriority) {
        self.wait(AwaitCounter::with_priority(counter.clone(), target, priority));
    }

    /// Suspends on a prepared wait.
    ///
    /// Control always returns to the scheduler, even if the condition already
    /// holds; the scheduler then resumes the fiber on its next pass.
    pub fn wait(&self, awaiting: AwaitCounter) {
        self.yielder.suspend(awaiting);
    }

    /// Yields execution to allow other work to run.
    ///
    /// The fiber goes to the back of its bucket's resumable list.
    pub fn yield_now(&self) {
        self.wait(AwaitCounter::with_priority(Counter::new(0), 0, self.priority));
    }

    /// Submits child jobs.
    pub fn run_jobs<I>(&self, jobs: I) -> Result<(), JobSystemError>
    where
        I: IntoIterator<Item = FiberJob>,
    {
        self.system.run_jobs(jobs)
    }

    /// Spawns a child job on this job's priority. The returned counter reaches 1
    /// when the child finishes.
    pub fn spawn<F>(&self, work: F) -> Result<Counter, JobSystemError>
    where
        F: FnOnce(&FiberContext<'_>) + Send + 'static,
    {
        self.system.run(self.priority, work)
    }
}
