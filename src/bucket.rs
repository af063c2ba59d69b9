//! Per-priority work buckets.
//!
//! Each [`JobPriority`] owns one bucket holding the jobs not yet started, the
//! fibers parked on counters, and the fibers ready to resume. One mutex guards
//! all three so a fiber is never in two places at once.

use crate::counter::{Counter, CounterKey, CounterWatcher};
use crate::fiber::FiberTask;
use crate::job::{FiberJob, JobPriority};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Fibers parked on one counter, in arrival order.
struct WaiterList {
    counter: Counter,
    tasks: Vec<FiberTask>,
}

impl WaiterList {
    /// Moves every task whose target has been reached to `resumable`,
    /// keeping arrival order. Returns how many moved.
    fn promote_into(&mut self, resumable: &mut VecDeque<FiberTask>) -> usize {
        let value = self.counter.value();
        let before = resumable.len();
        let mut i = 0;
        while i < self.tasks.len() {
            let ready = self.tasks[i]
                .awaiting()
                .is_none_or(|awaiting| value >= awaiting.target());
            if ready {
                resumable.push_back(self.tasks.remove(i));
            } else {
                i += 1;
            }
        }
        resumable.len() - before
    }
}

#[derive(Default)]
pub(crate) struct BucketState {
    pub(crate) pending: VecDeque<FiberJob>,
    waiters: HashMap<CounterKey, WaiterList>,
    pub(crate) resumable: VecDeque<FiberTask>,
}

impl BucketState {
    fn parked(&self) -> usize {
        self.waiters.values().map(|list| list.tasks.len()).sum()
    }
}

/// Everything a bucket held when it was torn down.
#[derive(Default)]
pub(crate) struct Abandoned {
    pub(crate) jobs: Vec<FiberJob>,
    pub(crate) tasks: Vec<FiberTask>,
}

pub(crate) struct PriorityBucket {
    priority: JobPriority,
    state: Mutex<BucketState>,
    wakeup: Condvar,
}

impl PriorityBucket {
    pub(crate) fn new(priority: JobPriority) -> Self {
        PriorityBucket {
            priority,
            state: Mutex::new(BucketState::default()),
            wakeup: Condvar::new(),
        }
    }

    pub(crate) fn priority(&self) -> JobPriority {
        self.priority
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock()
    }

    /// Sleeps until woken or `timeout` elapses. `state` must come from [`lock`](Self::lock).
    pub(crate) fn wait(&self, state: &mut MutexGuard<'_, BucketState>, timeout: Duration) {
        self.wakeup.wait_for(state, timeout);
    }

    /// Appends a job to the pending queue and wakes one worker.
    pub(crate) fn push_job(&self, job: FiberJob) {
        self.state.lock().pending.push_back(job);
        self.wakeup.notify_one();
    }

    /// Parks a suspended task on the counter it awaits.
    ///
    /// The wait condition is re-checked under the lock after the task is
    /// queued, so an update that landed between suspension and parking is
    /// never missed. Returns the number of tasks promoted by that check.
    pub(crate) fn park(self: &Arc<Self>, task: FiberTask) -> usize {
        let Some(counter) = task.awaiting().map(|awaiting| awaiting.counter().clone()) else {
            // Nothing to wait for.
            self.state.lock().resumable.push_back(task);
            self.wakeup.notify_one();
            return 1;
        };
        let key = counter.key();

        let mut state = self.state.lock();
        let BucketState {
            waiters, resumable, ..
        } = &mut *state;

        let list = waiters.entry(key).or_insert_with(|| {
            counter.watch(self.as_watcher());
            WaiterList {
                counter,
                tasks: Vec::new(),
            }
        });
        list.tasks.push(task);

        let promoted = list.promote_into(resumable);
        if list.tasks.is_empty() {
            if let Some(list) = waiters.remove(&key) {
                list.counter.unwatch(&self.as_watcher());
            }
        }
        if promoted > 0 {
            self.wakeup.notify_one();
        }
        promoted
    }

    /// Moves every parked task whose counter has reached its target onto the
    /// resumable list. Returns how many moved.
    pub(crate) fn promote_ready(self: &Arc<Self>, state: &mut BucketState) -> usize {
        if state.waiters.is_empty() {
            return 0;
        }
        let watcher = self.as_watcher();
        let BucketState {
            waiters, resumable, ..
        } = state;

        let mut promoted = 0;
        waiters.retain(|_, list| {
            promoted += list.promote_into(resumable);
            if list.tasks.is_empty() {
                list.counter.unwatch(&watcher);
                false
            } else {
                true
            }
        });
        promoted
    }

    /// Wakes every worker sleeping on this bucket.
    pub(crate) fn wake_all(&self) {
        let _state = self.state.lock();
        self.wakeup.notify_all();
    }

    /// Number of tasks parked on counters.
    pub(crate) fn parked_count(&self) -> usize {
        self.state.lock().parked()
    }

    /// Empties the bucket. The caller drops the contents outside the lock.
    pub(crate) fn abandon(self: &Arc<Self>) -> Abandoned {
        let watcher = self.as_watcher();
        let mut state = self.state.lock();

        let mut abandoned = Abandoned {
            jobs: state.pending.drain(..).collect(),
            tasks: state.resumable.drain(..).collect(),
        };
        for (_, list) in state.waiters.drain() {
            list.counter.unwatch(&watcher);
            abandoned.tasks.extend(list.tasks);
        }
        abandoned
    }

    fn as_watcher(self: &Arc<Self>) -> Arc<dyn CounterWatcher> {
        self.clone()
    }
}

impl CounterWatcher for PriorityBucket {
    fn counter_changed(&self) {
        // Taking the lock orders this wakeup after any in-progress check.
        let _state = self.state.lock();
        self.wakeup.notify_all();
    }
}
