//! Worker thread implementation.
//!
//! Every worker is bound to one priority bucket for its whole life. It
//! promotes fibers whose counters are satisfied, resumes them, and starts
//! pending jobs, sleeping on the bucket when there is nothing to do. On
//! shutdown it stays until the whole scheduler has drained.

use crate::config::PinningStrategy;
use crate::error::JobSystemError;
use crate::job::JobPriority;
use crate::job_system::JobSystemHandle;
use crate::metrics::metric;
use parking_lot::MutexGuard;
use std::thread::{self, JoinHandle};

/// A worker thread that executes jobs from one priority bucket.
pub(crate) struct Worker {
    id: usize,
    priority: JobPriority,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Creates and starts a new worker thread servicing `priority`.
    ///
    /// The thread is named `fiber-<PRIORITY>-<id>` and optionally pinned to
    /// `core`.
    pub(crate) fn spawn(
        id: usize,
        priority: JobPriority,
        system: JobSystemHandle,
        core: Option<core_affinity::CoreId>,
    ) -> Result<Self, JobSystemError> {
        let handle = thread::Builder::new()
            .name(format!("fiber-{priority}-{id}"))
            .spawn(move || {
                if let Some(core) = core {
                    if !core_affinity::set_for_current(core) {
                        log::warn!("worker {id} could not be pinned to core {}", core.id);
                    }
                }
                Worker::run_loop(id, priority, &system);
            })
            .map_err(|source| JobSystemError::Spawn { priority, source })?;

        Ok(Worker {
            id,
            priority,
            handle: Some(handle),
        })
    }

    /// Main execution loop for the worker thread.
    ///
    /// Each pass promotes ready waiters, then resumes at most one fiber and
    /// starts at most one job, with the bucket unlocked while user code runs.
    /// A job that cannot get a fiber stack goes back to the front of the
    /// queue and is retried after an idle wait.
    ///
    /// After shutdown is requested the loop keeps going until no bucket has
    /// anything left to run, since work draining elsewhere may still release
    /// a fiber parked here.
    fn run_loop(id: usize, priority: JobPriority, system: &JobSystemHandle) {
        let scheduler = system.scheduler();
        let bucket = scheduler.bucket(priority);
        let idle_timeout = scheduler.config().idle_timeout();
        log::debug!("worker {id} started on {}", bucket.priority());

        let mut state = bucket.lock();
        loop {
            scheduler.promote_ready(bucket, &mut state);

            let mut dispatched = false;

            if let Some(mut task) = state.resumable.pop_front() {
                dispatched = true;
                MutexGuard::unlocked(&mut state, || {
                    log::trace!("worker {id} resuming job {}", task.id());
                    metric!(scheduler, tasks_resumed);
                    let status = task.resume();
                    scheduler.settle(task, status);
                    scheduler.dispatch_finished();
                });
            }

            if let Some(job) = state.pending.pop_front() {
                dispatched = true;
                let unstarted = MutexGuard::unlocked(&mut state, || match job.execute(system) {
                    Ok(()) => {
                        scheduler.dispatch_finished();
                        None
                    }
                    Err(returned) => Some(returned),
                });

                if let Some((job, err)) = unstarted {
                    if scheduler.is_running() {
                        state.pending.push_front(job);
                        bucket.wait(&mut state, idle_timeout);
                    } else {
                        MutexGuard::unlocked(&mut state, || {
                            log::error!(
                                "job {} dropped at shutdown without a fiber stack: {err}",
                                job.id()
                            );
                            drop(job);
                            scheduler.dispatch_finished();
                        });
                    }
                }
            }

            if !dispatched {
                let stopping = !scheduler.is_running();
                if stopping && MutexGuard::unlocked(&mut state, || scheduler.drained()) {
                    break;
                }
                if state.resumable.is_empty() && state.pending.is_empty() {
                    bucket.wait(&mut state, idle_timeout);
                }
            }
        }

        log::debug!("worker {id} on {priority} exiting");
    }

    /// Returns the worker's ID.
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Returns the priority bucket this worker services.
    pub(crate) fn priority(&self) -> JobPriority {
        self.priority
    }

    /// Waits for the worker thread to finish.
    pub(crate) fn join(mut self) -> thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

/// The full roster of worker threads.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawns one worker per roster slot.
    ///
    /// If any thread fails to start, the workers already running are stopped
    /// and joined before the error is returned.
    pub(crate) fn spawn(system: &JobSystemHandle) -> Result<Self, JobSystemError> {
        let config = system.scheduler().config();
        let core_ids = match config.pinning {
            PinningStrategy::None => Vec::new(),
            _ => core_affinity::get_core_ids().unwrap_or_default(),
        };

        let mut workers = Vec::with_capacity(config.roster.total());
        for (id, priority) in config.roster.assignments().enumerate() {
            let core = config
                .pinning
                .core_for(id, core_ids.len())
                .and_then(|index| core_ids.get(index).copied());

            match Worker::spawn(id, priority, system.clone(), core) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    system.scheduler().request_stop();
                    let _ = WorkerPool { workers }.shutdown();
                    return Err(err);
                }
            }
        }

        Ok(WorkerPool { workers })
    }

    /// Returns the number of worker threads in the pool.
    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }

    /// Returns the number of workers servicing `priority`.
    pub(crate) fn workers_for(&self, priority: JobPriority) -> usize {
        self.workers
            .iter()
            .filter(|worker| worker.priority() == priority)
            .count()
    }

    /// Waits for all threads to finish. Stop must already have been requested.
    ///
    /// Returns Ok if all workers shut down successfully, or Err with the
    /// number of workers that panicked.
    pub(crate) fn shutdown(self) -> Result<(), usize> {
        let mut failed_count = 0;
        for worker in self.workers {
            let worker_id = worker.id();
            if worker.join().is_err() {
                failed_count += 1;
                log::error!("worker {worker_id} panicked during execution");
            }
        }

        if failed_count > 0 {
            Err(failed_count)
        } else {
            Ok(())
        }
    }
}
