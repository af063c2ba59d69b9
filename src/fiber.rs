//! Fiber management and execution context.
//!
//! A [`FiberTask`] runs a job's closure on its own stack so the closure can
//! suspend in the middle of its work while waiting for a [`Counter`], and be
//! resumed later on whichever worker services the requested priority.

use crate::context::FiberContext;
use crate::counter::Counter;
use crate::job::{JobId, JobPriority, JobWork};
use crate::job_system::JobSystemHandle;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

pub(crate) type FiberYielder = Yielder<(), AwaitCounter>;

type FiberCoroutine = Coroutine<(), AwaitCounter, (), DefaultStack>;

thread_local! {
    static IN_FIBER: Cell<bool> = const { Cell::new(false) };
}

/// Returns true while the current thread is executing a fiber body.
pub fn in_fiber() -> bool {
    IN_FIBER.get()
}

/// A suspension request: resume once `counter >= target`, on the `priority` bucket.
///
/// This is the only thing a fiber ever yields to the scheduler.
#[derive(Debug, Clone)]
pub struct AwaitCounter {
    counter: Counter,
    target: u64,
    priority: JobPriority,
}

impl AwaitCounter {
    pub fn with_priority(counter: Counter, target: u64, priority: JobPriority) -> Self {
        AwaitCounter {
            counter,
            target,
            priority,
        }
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    /// Snapshot check of the wait condition. Advisory only: suspension never
    /// consults it, the scheduler re-checks under the bucket lock.
    pub fn is_ready(&self) -> bool {
        self.counter.greater_equal(self.target)
    }
}

/// Outcome of driving a fiber.
pub(crate) enum TaskStatus {
    /// The fiber is waiting on [`FiberTask::awaiting`].
    Suspended,
    /// The closure returned.
    Complete,
    /// The closure panicked. The fiber is finished.
    Panicked(Box<dyn Any + Send>),
}

impl fmt::Debug for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Suspended => f.write_str("Suspended"),
            TaskStatus::Complete => f.write_str("Complete"),
            TaskStatus::Panicked(payload) => {
                f.debug_tuple("Panicked").field(&panic_message(&**payload)).finish()
            }
        }
    }
}

/// A job's closure running on its own stack.
///
/// A task is driven by exactly one owner at a time: the job that started it,
/// the bucket it is parked in, or the worker that resumes it. It is not
/// `Clone`; finishing it consumes it.
pub(crate) struct FiberTask {
    id: JobId,
    coroutine: FiberCoroutine,
    /// Set while suspended.
    awaiting: Option<AwaitCounter>,
    /// Bucket this task runs on next.
    priority: JobPriority,
    /// Signalled once the closure has returned.
    completion: Counter,
}

// SAFETY: the closure and everything it captures is `Send + 'static`, and the
// only scheduler state on the fiber stack is `FiberContext`, whose handle is
// `Send`. The yielder lives on the fiber stack and moves with it. Bodies must
// not keep `!Send` values or thread-local borrows alive across an await.
unsafe impl Send for FiberTask {}

impl FiberTask {
    /// Prepares a fiber for `work` on `stack`. Nothing runs until the first
    /// [`resume`](Self::resume).
    pub(crate) fn new(
        id: JobId,
        priority: JobPriority,
        completion: Counter,
        stack: DefaultStack,
        system: JobSystemHandle,
        work: JobWork,
    ) -> Self {
        let coroutine = Coroutine::with_stack(stack, move |yielder: &FiberYielder, ()| {
            let ctx = FiberContext::new(yielder, id, priority, system);
            work(&ctx);
        });

        FiberTask {
            id,
            coroutine,
            awaiting: None,
            priority,
            completion,
        }
    }

    /// Runs the fiber until it suspends or finishes.
    ///
    /// Panics in the closure are caught and reported as
    /// [`TaskStatus::Panicked`]. Resuming a finished task is a no-op that
    /// reports [`TaskStatus::Complete`].
    pub(crate) fn resume(&mut self) -> TaskStatus {
        if self.coroutine.done() {
            return TaskStatus::Complete;
        }
        self.awaiting = None;

        let was_in_fiber = IN_FIBER.replace(true);
        let result = catch_unwind(AssertUnwindSafe(|| self.coroutine.resume(())));
        IN_FIBER.set(was_in_fiber);

        match result {
            Ok(CoroutineResult::Yield(awaiting)) => {
                self.priority = awaiting.priority;
                self.awaiting = Some(awaiting);
                TaskStatus::Suspended
            }
            Ok(CoroutineResult::Return(())) => TaskStatus::Complete,
            Err(payload) => TaskStatus::Panicked(payload),
        }
    }

    /// Reports whether the closure has finished (returned or panicked).
    pub(crate) fn is_done(&self) -> bool {
        self.coroutine.done()
    }

    /// The pending wait, if suspended.
    pub(crate) fn awaiting(&self) -> Option<&AwaitCounter> {
        self.awaiting.as_ref()
    }

    /// Priority bucket this task resumes on.
    pub(crate) fn priority(&self) -> JobPriority {
        self.priority
    }

    /// Id of the job this task belongs to.
    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    /// Tears the task down, returning its completion counter and, if the
    /// fiber finished, its stack for reuse. A suspended fiber is unwound.
    pub(crate) fn into_parts(self) -> (Counter, Option<DefaultStack>) {
        let FiberTask {
            coroutine,
            completion,
            ..
        } = self;
        let stack = coroutine.done().then(|| coroutine.into_stack());
        (completion, stack)
    }
}

impl fmt::Debug for FiberTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberTask")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("done", &self.is_done())
            .field("awaiting", &self.awaiting)
            .finish()
    }
}

/// Best-effort extraction of a panic message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobSystemConfig, WorkerRoster};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn detached_handle() -> JobSystemHandle {
        JobSystemHandle::detached(JobSystemConfig::with_roster(WorkerRoster::single()))
    }

    fn task_for<F>(system: &JobSystemHandle, completion: Counter, work: F) -> FiberTask
    where
        F: FnOnce(&FiberContext<'_>) + Send + 'static,
    {
        let stack = system.scheduler().stacks().acquire().unwrap();
        FiberTask::new(
            JobId::next(),
            JobPriority::High,
            completion,
            stack,
            system.clone(),
            Box::new(work),
        )
    }

    #[test]
    fn test_task_runs_to_completion() {
        let system = detached_handle();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        let mut task = task_for(&system, Counter::default(), move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!task.is_done());

        assert!(matches!(task.resume(), TaskStatus::Complete));
        assert!(task.is_done());
        assert!(task.awaiting().is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Resuming a finished task does not run the closure again.
        assert!(matches!(task.resume(), TaskStatus::Complete));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_task_suspends_and_resumes_where_it_left_off() {
        let system = detached_handle();
        let gate = Counter::new(0);
        let progress = Arc::new(AtomicUsize::new(0));

        let gate_clone = gate.clone();
        let progress_clone = progress.clone();
        let mut task = task_for(&system, Counter::default(), move |ctx| {
            progress_clone.store(1, Ordering::SeqCst);
            ctx.await_counter_at(&gate_clone, 2, JobPriority::Io);
            progress_clone.store(2, Ordering::SeqCst);
        });

        assert!(matches!(task.resume(), TaskStatus::Suspended));
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert!(!task.is_done());

        let awaiting = task.awaiting().expect("suspended task has a pending wait");
        assert!(awaiting.counter().same_as(&gate));
        assert_eq!(awaiting.target(), 2);
        assert_eq!(task.priority(), JobPriority::Io);
        assert!(!awaiting.is_ready());

        // Suspension never checks readiness, and resumption carries no payload.
        assert!(matches!(task.resume(), TaskStatus::Complete));
        assert_eq!(progress.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_task_resumes_on_other_thread() {
        let system = detached_handle();
        let gate = Counter::new(0);
        let gate_clone = gate.clone();

        let mut task = task_for(&system, Counter::default(), move |ctx| {
            ctx.await_counter(&gate_clone, 1);
        });
        assert!(matches!(task.resume(), TaskStatus::Suspended));

        let status = thread::spawn(move || {
            let status = task.resume();
            (status, task.is_done())
        })
        .join()
        .unwrap();
        assert!(matches!(status, (TaskStatus::Complete, true)));
    }

    #[test]
    fn test_task_panic_is_caught() {
        let system = detached_handle();
        let mut task = task_for(&system, Counter::default(), |_| {
            panic!("Intentional panic for testing");
        });

        match task.resume() {
            TaskStatus::Panicked(payload) => {
                assert_eq!(panic_message(&*payload), "Intentional panic for testing");
            }
            other => panic!("expected panic, got {other:?}"),
        }
        assert!(task.is_done());
        assert!(!in_fiber());
    }

    #[test]
    fn test_in_fiber_flag() {
        let system = detached_handle();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        let mut task = task_for(&system, Counter::default(), move |_| {
            if in_fiber() {
                seen_clone.store(1, Ordering::SeqCst);
            }
        });
        assert!(!in_fiber());
        task.resume();
        assert!(!in_fiber());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsatisfied_wait_stays_parked() {
        let system = detached_handle();
        let never = Counter::new(0);
        let never_clone = never.clone();

        let mut task = task_for(&system, Counter::default(), move |ctx| {
            ctx.await_counter(&never_clone, 1);
        });
        assert!(matches!(task.resume(), TaskStatus::Suspended));

        let bucket = system.scheduler().bucket(JobPriority::High);
        bucket.park(task);
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(10));
            let mut state = bucket.lock();
            assert_eq!(bucket.promote_ready(&mut state), 0);
            assert!(state.resumable.is_empty());
        }
        assert_eq!(bucket.parked_count(), 1);
    }

    #[test]
    fn test_into_parts_recycles_finished_stack() {
        let system = detached_handle();
        let completion = Counter::new(0);
        let mut task = task_for(&system, completion.clone(), |_| {});
        task.resume();

        let (counter, stack) = task.into_parts();
        assert!(counter.same_as(&completion));
        assert!(stack.is_some());
    }
}
