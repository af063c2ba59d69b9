//! Job definitions and execution logic.
//!
//! Jobs are units of work submitted to the job system. Each one carries a
//! closure, the priority bucket it runs on and the counter it signals once
//! its fiber has run to completion.

use crate::context::FiberContext;
use crate::counter::Counter;
use crate::fiber::FiberTask;
use crate::job_system::JobSystemHandle;
use crate::metrics::metric;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// The priority bucket a job or resumed fiber is executed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobPriority {
    High = 0,
    #[default]
    Medium = 1,
    Low = 2,
    Io = 3,
}

impl JobPriority {
    pub const COUNT: usize = 4;

    pub const ALL: [JobPriority; Self::COUNT] = [
        JobPriority::High,
        JobPriority::Medium,
        JobPriority::Low,
        JobPriority::Io,
    ];

    /// Index of this priority's bucket.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            JobPriority::High => "HIGH",
            JobPriority::Medium => "MEDIUM",
            JobPriority::Low => "LOW",
            JobPriority::Io => "IO",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide unique, monotonically increasing job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(0);

impl JobId {
    pub(crate) fn next() -> Self {
        JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) type JobWork = Box<dyn FnOnce(&FiberContext<'_>) + Send + 'static>;

/// A unit of work to be executed by the job system.
///
/// The closure owns whatever arguments it needs. It runs on a fiber and may
/// suspend through its [`FiberContext`]; the job's counter is incremented
/// exactly once, when the closure has returned.
pub struct FiberJob {
    id: JobId,
    priority: JobPriority,
    counter: Counter,
    work: JobWork,
    /// Failed attempts to allocate a fiber stack for this job.
    start_failures: u32,
}

impl FiberJob {
    /// Creates a new job on the [`JobPriority::Medium`] bucket.
    pub fn new<F>(counter: Counter, work: F) -> Self
    where
        F: FnOnce(&FiberContext<'_>) + Send + 'static,
    {
        Self::with_priority(counter, JobPriority::default(), work)
    }

    /// Creates a new job on a specific priority bucket.
    pub fn with_priority<F>(counter: Counter, priority: JobPriority, work: F) -> Self
    where
        F: FnOnce(&FiberContext<'_>) + Send + 'static,
    {
        FiberJob {
            id: JobId::next(),
            priority,
            counter,
            work: Box::new(work),
            start_failures: 0,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    /// The counter incremented when this job's fiber completes.
    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    /// Runs the job on a fresh fiber up to its first suspension or to completion.
    ///
    /// A completed fiber signals the job counter right away; a suspended one
    /// is parked on the bucket of the priority it asked to resume on. If no
    /// fiber stack can be allocated the body has not run, and the job is
    /// handed back untouched with the allocation error.
    pub(crate) fn execute(
        mut self,
        system: &JobSystemHandle,
    ) -> Result<(), (FiberJob, io::Error)> {
        let stack = match system.scheduler().stacks().acquire() {
            Ok(stack) => stack,
            Err(err) => {
                if self.start_failures == 0 {
                    log::warn!("job {} waiting for a fiber stack: {err}", self.id);
                } else {
                    log::debug!("job {} still has no fiber stack: {err}", self.id);
                }
                self.start_failures += 1;
                return Err((self, err));
            }
        };

        let FiberJob {
            id,
            priority,
            counter,
            work,
            ..
        } = self;

        log::trace!("starting job {id} on {priority}");
        metric!(system.scheduler(), jobs_started);
        let mut task = FiberTask::new(id, priority, counter, stack, system.clone(), work);
        let status = task.resume();
        system.scheduler().settle(task, status);
        Ok(())
    }
}

impl fmt::Debug for FiberJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberJob")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}
