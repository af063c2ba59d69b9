//! High-level job system interface.
//!
//! The JobSystem is the primary entry point for scheduling and managing
//! fiber jobs. It owns the worker threads; a clonable [`JobSystemHandle`]
//! carries the submission and wait API into job bodies and other threads.

use crate::bucket::{BucketState, PriorityBucket};
use crate::config::{JobSystemConfig, WorkerRoster};
use crate::context::FiberContext;
use crate::counter::{Counter, CounterWatcher};
use crate::error::JobSystemError;
use crate::fiber::{FiberTask, TaskStatus, in_fiber, panic_message};
use crate::fiber_pool::StackPool;
use crate::job::{FiberJob, JobPriority};
use crate::metrics::metric;
#[cfg(feature = "metrics")]
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::worker::WorkerPool;
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// State shared by every worker and handle of one job system.
pub(crate) struct Scheduler {
    buckets: [Arc<PriorityBucket>; JobPriority::COUNT],
    running: AtomicBool,
    /// Jobs queued, fibers ready to resume, and dispatches in progress,
    /// across all buckets.
    runnable: AtomicUsize,
    /// Bumped whenever work becomes runnable. Lets a draining worker tell
    /// that nothing new started while it was looking.
    epoch: AtomicU64,
    stacks: StackPool,
    config: JobSystemConfig,
    #[cfg(feature = "metrics")]
    metrics: Metrics,
}

impl Scheduler {
    fn new(config: JobSystemConfig) -> Self {
        Scheduler {
            buckets: JobPriority::ALL.map(|priority| Arc::new(PriorityBucket::new(priority))),
            running: AtomicBool::new(true),
            runnable: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            stacks: StackPool::new(config.stack_size, config.stack_pool_capacity),
            config,
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        }
    }

    pub(crate) fn bucket(&self, priority: JobPriority) -> &Arc<PriorityBucket> {
        &self.buckets[priority.index()]
    }

    pub(crate) fn stacks(&self) -> &StackPool {
        &self.stacks
    }

    pub(crate) fn config(&self) -> &JobSystemConfig {
        &self.config
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn has_runnable_work(&self) -> bool {
        self.runnable.load(Ordering::SeqCst) > 0
    }

    fn add_runnable(&self, count: usize) {
        if count > 0 {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.runnable.fetch_add(count, Ordering::SeqCst);
        }
    }

    /// Returns true once no bucket can make progress: nothing is queued or
    /// running, and no parked fiber in any bucket has a satisfied counter.
    ///
    /// Fibers found ready are promoted and their bucket woken. Must be called
    /// without any bucket lock held.
    pub(crate) fn drained(&self) -> bool {
        let epoch = self.epoch.load(Ordering::SeqCst);
        if self.has_runnable_work() {
            return false;
        }
        for bucket in &self.buckets {
            let promoted = self.promote_ready(bucket, &mut bucket.lock());
            if promoted > 0 {
                bucket.wake_all();
                return false;
            }
        }
        !self.has_runnable_work() && self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Marks the end of one job start or fiber resume by a worker.
    pub(crate) fn dispatch_finished(&self) {
        self.runnable.fetch_sub(1, Ordering::SeqCst);
    }

    /// Promotes the ready waiters of `bucket`. `state` must be its locked state.
    pub(crate) fn promote_ready(
        &self,
        bucket: &Arc<PriorityBucket>,
        state: &mut BucketState,
    ) -> usize {
        let promoted = bucket.promote_ready(state);
        metric!(self, tasks_promoted, promoted);
        self.add_runnable(promoted);
        promoted
    }

    /// Stops accepting work and wakes every sleeping worker so it can drain
    /// the remaining work and exit.
    pub(crate) fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for bucket in &self.buckets {
            bucket.wake_all();
        }
    }

    fn submit(&self, job: FiberJob) -> Result<(), JobSystemError> {
        // Counted before the running check so a draining worker cannot exit
        // between an accepted submission and its push.
        self.add_runnable(1);
        if !self.is_running() {
            self.runnable.fetch_sub(1, Ordering::SeqCst);
            return Err(JobSystemError::ShutDown);
        }
        metric!(self, jobs_submitted);
        self.bucket(job.priority()).push_job(job);
        Ok(())
    }

    /// Decides what happens to a task after a worker has driven it.
    ///
    /// Suspended tasks are parked on the bucket they asked to resume on.
    /// Finished tasks signal their completion counter exactly once; only
    /// tasks that returned normally give their stack back to the pool.
    pub(crate) fn settle(&self, task: FiberTask, status: TaskStatus) {
        match status {
            TaskStatus::Suspended => {
                metric!(self, tasks_suspended);
                let bucket = self.bucket(task.priority());
                log::debug!("job {} parked on {}", task.id(), bucket.priority());
                let promoted = bucket.park(task);
                metric!(self, tasks_promoted, promoted);
                self.add_runnable(promoted);
            }
            TaskStatus::Complete => {
                let (completion, stack) = task.into_parts();
                if let Some(stack) = stack {
                    self.stacks.recycle(stack);
                }
                metric!(self, jobs_completed);
                completion.increment();
            }
            TaskStatus::Panicked(payload) => {
                log::error!("job {} panicked: {}", task.id(), panic_message(&*payload));
                metric!(self, tasks_panicked);
                let (completion, _) = task.into_parts();
                completion.increment();
            }
        }
    }

    /// Empties every bucket after the workers are gone.
    ///
    /// Tasks still parked here can never resume. They are unwound outside the
    /// bucket locks, since their destructors may touch counters.
    fn abandon_all(&self) {
        let mut jobs = Vec::new();
        let mut tasks = Vec::new();
        for bucket in &self.buckets {
            let abandoned = bucket.abandon();
            jobs.extend(abandoned.jobs);
            tasks.extend(abandoned.tasks);
        }

        if !tasks.is_empty() {
            log::warn!("dropping {} suspended fiber(s) at shutdown", tasks.len());
        }
        if !jobs.is_empty() {
            log::warn!("dropping {} job(s) that never started", jobs.len());
        }
        drop(tasks);
        drop(jobs);
        log::debug!("{} fiber stack(s) released", self.stacks.len());
    }
}

/// Blocks a plain thread until a counter changes.
#[derive(Default)]
struct ThreadWaiter {
    lock: Mutex<()>,
    signal: Condvar,
}

impl CounterWatcher for ThreadWaiter {
    fn counter_changed(&self) {
        let _guard = self.lock.lock();
        self.signal.notify_all();
    }
}

/// Spins, then sleeps, until `counter >= target` or `deadline` passes.
fn block_on(counter: &Counter, target: u64, deadline: Option<Instant>) -> bool {
    let backoff = Backoff::new();
    while !backoff.is_completed() {
        if counter.greater_equal(target) {
            return true;
        }
        backoff.snooze();
    }

    let waiter = Arc::new(ThreadWaiter::default());
    let watcher: Arc<dyn CounterWatcher> = waiter.clone();
    counter.watch(watcher.clone());

    let mut guard = waiter.lock.lock();
    let satisfied = loop {
        if counter.greater_equal(target) {
            break true;
        }
        match deadline {
            None => waiter.signal.wait(&mut guard),
            Some(deadline) => {
                if waiter.signal.wait_until(&mut guard, deadline).timed_out() {
                    break counter.greater_equal(target);
                }
            }
        }
    };
    drop(guard);

    counter.unwatch(&watcher);
    satisfied
}

/// A boxed job body, as accepted by [`JobSystemHandle::run_multiple`].
pub type BoxedWork = Box<dyn FnOnce(&FiberContext<'_>) + Send + 'static>;

/// Clonable access to a running job system.
///
/// Every job body can reach one through [`FiberContext::handle`].
#[derive(Clone)]
pub struct JobSystemHandle {
    scheduler: Arc<Scheduler>,
}

impl JobSystemHandle {
    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// A handle with no workers behind it. Tests drive fibers by hand.
    #[cfg(test)]
    pub(crate) fn detached(config: JobSystemConfig) -> Self {
        JobSystemHandle {
            scheduler: Arc::new(Scheduler::new(config)),
        }
    }

    /// Returns false once shutdown has been requested.
    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn config(&self) -> &JobSystemConfig {
        self.scheduler.config()
    }

    /// Queues jobs on the buckets of their priorities.
    ///
    /// Jobs already queued when the system starts stopping still run; the
    /// first job refused returns [`JobSystemError::ShutDown`] and the rest of
    /// the iterator is dropped.
    pub fn run_jobs<I>(&self, jobs: I) -> Result<(), JobSystemError>
    where
        I: IntoIterator<Item = FiberJob>,
    {
        for job in jobs {
            self.scheduler.submit(job)?;
        }
        Ok(())
    }

    /// Submits a single job and returns a counter that reaches 1 when it is done.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fiberjobs::{JobPriority, JobSystem};
    ///
    /// let job_system = JobSystem::new().unwrap();
    /// let counter = job_system
    ///     .run(JobPriority::High, |_ctx| println!("Hello from a fiber!"))
    ///     .unwrap();
    /// job_system.wait_for_counter(&counter, 1);
    /// ```
    pub fn run<F>(&self, priority: JobPriority, work: F) -> Result<Counter, JobSystemError>
    where
        F: FnOnce(&FiberContext<'_>) + Send + 'static,
    {
        let counter = Counter::new(0);
        self.scheduler
            .submit(FiberJob::with_priority(counter.clone(), priority, work))?;
        Ok(counter)
    }

    /// Submits several jobs sharing one counter, which reaches the number of
    /// jobs once all of them are done.
    pub fn run_multiple<I>(
        &self,
        priority: JobPriority,
        works: I,
    ) -> Result<Counter, JobSystemError>
    where
        I: IntoIterator<Item = BoxedWork>,
    {
        let counter = Counter::new(0);
        self.run_jobs(
            works
                .into_iter()
                .map(|work| FiberJob::with_priority(counter.clone(), priority, work)),
        )?;
        Ok(counter)
    }

    /// Blocks the calling thread until `counter >= target`.
    ///
    /// Returns at once if the target is already met. This parks an OS thread;
    /// job bodies should use [`FiberContext::await_counter`] instead.
    pub fn wait_for_counter(&self, counter: &Counter, target: u64) {
        if counter.greater_equal(target) {
            return;
        }
        if in_fiber() {
            log::warn!("wait_for_counter called from a fiber; blocking its worker thread");
        }
        block_on(counter, target, None);
    }

    /// Like [`wait_for_counter`](Self::wait_for_counter) but gives up after
    /// `timeout`. Returns whether the target was reached.
    pub fn wait_for_counter_timeout(
        &self,
        counter: &Counter,
        target: u64,
        timeout: Duration,
    ) -> bool {
        if counter.greater_equal(target) {
            return true;
        }
        if in_fiber() {
            log::warn!("wait_for_counter_timeout called from a fiber; blocking its worker thread");
        }
        block_on(counter, target, Some(Instant::now() + timeout))
    }
}

impl fmt::Debug for JobSystemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSystemHandle")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// The main job system managing worker threads and fiber execution.
///
/// Dropping it shuts it down the same way [`shutdown`](Self::shutdown) does,
/// minus the error report.
pub struct JobSystem {
    handle: JobSystemHandle,
    workers: Option<WorkerPool>,
}

impl JobSystem {
    /// Starts a job system sized to the machine.
    pub fn new() -> Result<Self, JobSystemError> {
        Self::start(JobSystemConfig::default())
    }

    /// Starts the classic 16-thread roster: 5 HIGH, 5 MEDIUM, 4 LOW, 2 IO.
    pub fn legacy() -> Result<Self, JobSystemError> {
        Self::with_roster(WorkerRoster::legacy())
    }

    pub fn with_roster(roster: WorkerRoster) -> Result<Self, JobSystemError> {
        Self::start(JobSystemConfig::with_roster(roster))
    }

    /// Validates `config` and spawns one worker thread per roster slot.
    ///
    /// # Example
    ///
    /// ```
    /// use fiberjobs::{JobSystem, JobSystemConfig, WorkerRoster};
    ///
    /// let config = JobSystemConfig::with_roster(WorkerRoster::single());
    /// let job_system = JobSystem::start(config).unwrap();
    /// assert_eq!(job_system.num_workers(), 4);
    /// job_system.shutdown().unwrap();
    /// ```
    pub fn start(config: JobSystemConfig) -> Result<Self, JobSystemError> {
        config.validate()?;
        Self::launch(config)
    }

    fn launch(config: JobSystemConfig) -> Result<Self, JobSystemError> {
        let roster = config.roster;

        let handle = JobSystemHandle {
            scheduler: Arc::new(Scheduler::new(config)),
        };
        let workers = WorkerPool::spawn(&handle)?;
        log::info!(
            "job system started: {} HIGH, {} MEDIUM, {} LOW, {} IO workers",
            roster.high,
            roster.medium,
            roster.low,
            roster.io
        );

        Ok(JobSystem {
            handle,
            workers: Some(workers),
        })
    }

    /// Returns a clonable handle for submitting work from other threads.
    pub fn handle(&self) -> &JobSystemHandle {
        &self.handle
    }

    pub fn config(&self) -> &JobSystemConfig {
        self.handle.config()
    }

    /// Queues jobs on the buckets of their priorities.
    pub fn run_jobs<I>(&self, jobs: I) -> Result<(), JobSystemError>
    where
        I: IntoIterator<Item = FiberJob>,
    {
        self.handle.run_jobs(jobs)
    }

    /// Submits a single job. See [`JobSystemHandle::run`].
    pub fn run<F>(&self, priority: JobPriority, work: F) -> Result<Counter, JobSystemError>
    where
        F: FnOnce(&FiberContext<'_>) + Send + 'static,
    {
        self.handle.run(priority, work)
    }

    /// Submits several jobs sharing one counter. See [`JobSystemHandle::run_multiple`].
    pub fn run_multiple<I>(
        &self,
        priority: JobPriority,
        works: I,
    ) -> Result<Counter, JobSystemError>
    where
        I: IntoIterator<Item = BoxedWork>,
    {
        self.handle.run_multiple(priority, works)
    }

    /// Blocks the calling thread until `counter >= target`.
    pub fn wait_for_counter(&self, counter: &Counter, target: u64) {
        self.handle.wait_for_counter(counter, target);
    }

    pub fn wait_for_counter_timeout(
        &self,
        counter: &Counter,
        target: u64,
        timeout: Duration,
    ) -> bool {
        self.handle.wait_for_counter_timeout(counter, target, timeout)
    }

    /// Returns the number of worker threads in the system.
    pub fn num_workers(&self) -> usize {
        self.workers.as_ref().map_or(0, WorkerPool::size)
    }

    /// Returns the number of worker threads servicing `priority`.
    pub fn workers_for(&self, priority: JobPriority) -> usize {
        self.workers
            .as_ref()
            .map_or(0, |workers| workers.workers_for(priority))
    }

    /// Returns a snapshot of the scheduler's activity counters.
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.handle.scheduler().metrics().snapshot()
    }

    /// Shuts down the job system.
    ///
    /// Workers keep draining until no bucket has queued jobs, ready fibers or
    /// a dispatch in flight, so a fiber parked on one bucket can still be
    /// released by work draining on another. Fibers still parked after that
    /// are dropped. Jobs that never got a fiber stack are dropped unsignalled.
    /// Returns an error if any worker thread panicked.
    pub fn shutdown(mut self) -> Result<(), JobSystemError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), JobSystemError> {
        let Some(workers) = self.workers.take() else {
            return Ok(());
        };
        log::info!("shutting down job system ({} workers)", workers.size());

        let scheduler = self.handle.scheduler();
        scheduler.request_stop();
        let joined = workers.shutdown();
        scheduler.abandon_all();

        joined.map_err(JobSystemError::WorkerPanicked)
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("job system shutdown failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn small_system() -> JobSystem {
        JobSystem::with_roster(WorkerRoster::single()).expect("Failed to start job system")
    }

    #[test]
    fn test_job_system_creation() {
        let job_system = small_system();
        assert_eq!(job_system.num_workers(), 4);
        for priority in JobPriority::ALL {
            assert_eq!(job_system.workers_for(priority), 1);
        }
        job_system.shutdown().expect("Shutdown failed");
    }

    #[test]
    fn test_job_system_legacy_roster() {
        let job_system = JobSystem::legacy().expect("Failed to start job system");
        assert_eq!(job_system.num_workers(), 16);
        assert_eq!(job_system.workers_for(JobPriority::High), 5);
        assert_eq!(job_system.workers_for(JobPriority::Medium), 5);
        assert_eq!(job_system.workers_for(JobPriority::Low), 4);
        assert_eq!(job_system.workers_for(JobPriority::Io), 2);
        job_system.shutdown().expect("Shutdown failed");
    }

    #[test]
    fn test_job_system_rejects_invalid_config() {
        let mut config = JobSystemConfig::with_roster(WorkerRoster::single());
        config.roster.low = 0;
        assert!(matches!(
            JobSystem::start(config),
            Err(JobSystemError::Config(_))
        ));
    }

    #[test]
    fn test_job_system_run() {
        let job_system = small_system();
        let executed = Arc::new(AtomicUsize::new(0));
        let executed_clone = executed.clone();

        let counter = job_system
            .run(JobPriority::Medium, move |_| {
                executed_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        job_system.wait_for_counter(&counter, 1);
        assert_eq!(executed.load(Ordering::SeqCst), 1);
        job_system.shutdown().expect("Shutdown failed");
    }

    #[test]
    fn test_job_system_multiple_jobs() {
        let job_system = small_system();
        let executed = Arc::new(AtomicUsize::new(0));

        let num_jobs = 10;
        let mut jobs: Vec<BoxedWork> = Vec::new();
        for _ in 0..num_jobs {
            let executed_clone = executed.clone();
            jobs.push(Box::new(move |_| {
                executed_clone.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let counter = job_system.run_multiple(JobPriority::Low, jobs).unwrap();
        job_system.wait_for_counter(&counter, num_jobs as u64);

        assert_eq!(executed.load(Ordering::SeqCst), num_jobs);
        job_system.shutdown().expect("Shutdown failed");
    }

    #[test]
    fn test_wait_for_counter_timeout() {
        let job_system = small_system();
        let never = Counter::new(0);
        assert!(!job_system.wait_for_counter_timeout(&never, 1, Duration::from_millis(20)));

        let later = Counter::new(0);
        let later_clone = later.clone();
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            later_clone.set_value(3);
        });
        assert!(job_system.wait_for_counter_timeout(&later, 3, Duration::from_secs(5)));
        setter.join().unwrap();
        assert_eq!(later.watcher_count(), 0);
        job_system.shutdown().expect("Shutdown failed");
    }

    #[test]
    fn test_submit_after_shutdown_is_refused() {
        let job_system = small_system();
        let handle = job_system.handle().clone();
        job_system.shutdown().expect("Shutdown failed");

        assert!(!handle.is_running());
        assert!(matches!(
            handle.run(JobPriority::High, |_| {}),
            Err(JobSystemError::ShutDown)
        ));
    }

    #[test]
    fn test_unstartable_job_is_never_signalled() {
        let mut config = JobSystemConfig::with_roster(WorkerRoster::single());
        config.stack_size = 1 << 50;
        config.idle_timeout_ms = 5;
        let job_system = JobSystem::launch(config).expect("Failed to start job system");

        let executed = Arc::new(AtomicUsize::new(0));
        let executed_clone = executed.clone();
        let counter = job_system
            .run(JobPriority::High, move |_| {
                executed_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(!job_system.wait_for_counter_timeout(&counter, 1, Duration::from_millis(50)));
        job_system.shutdown().expect("Shutdown failed");
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_drop_without_shutdown() {
        let executed = Arc::new(AtomicUsize::new(0));
        {
            let job_system = small_system();
            let executed_clone = executed.clone();
            let counter = job_system
                .run(JobPriority::Io, move |_| {
                    executed_clone.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            job_system.wait_for_counter(&counter, 1);
        }
        assert_eq!(executed.load(Ordering::SeqCst), 1);
    }
}
