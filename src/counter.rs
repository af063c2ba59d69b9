//! Counter-based synchronization primitives.
//!
//! A [`Counter`] is the only synchronization point between jobs: jobs signal
//! it when they finish and suspended fibers wait for it to reach a target.

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Something that wants to hear about every change to a counter's value.
///
/// Priority buckets register themselves while they hold fibers parked on a
/// counter, and blocking waiters register for the duration of a wait.
pub(crate) trait CounterWatcher: Send + Sync {
    fn counter_changed(&self);
}

/// Identity of a counter's shared state, used to key waiter lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterKey(usize);

struct InnerCounter {
    value: CachePadded<AtomicU64>,
    watcher_count: AtomicUsize,
    watchers: Mutex<Vec<Arc<dyn CounterWatcher>>>,
}

/// A thread-safe counter for tracking job completion.
///
/// Cloning a counter clones the handle; all clones observe the same value.
/// Comparisons are a single atomic load, so two comparisons in a row are not
/// atomic as a pair.
#[derive(Clone)]
pub struct Counter {
    inner: Arc<InnerCounter>,
}

impl Counter {
    /// Creates a new counter with the specified initial value.
    pub fn new(initial: u64) -> Self {
        Counter {
            inner: Arc::new(InnerCounter {
                value: CachePadded::new(AtomicU64::new(initial)),
                watcher_count: AtomicUsize::new(0),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Increments the counter by one.
    pub fn increment(&self) {
        self.inner.value.fetch_add(1, Ordering::SeqCst);
        self.notify();
    }

    /// Decrements the counter by one. Wraps below zero.
    pub fn decrement(&self) {
        self.inner.value.fetch_sub(1, Ordering::SeqCst);
        self.notify();
    }

    pub fn set_value(&self, value: u64) {
        self.inner.value.store(value, Ordering::SeqCst);
        self.notify();
    }

    /// Returns the current value of the counter.
    pub fn value(&self) -> u64 {
        self.inner.value.load(Ordering::SeqCst)
    }

    pub fn greater_equal(&self, target: u64) -> bool {
        self.value() >= target
    }

    pub fn greater_than(&self, target: u64) -> bool {
        self.value() > target
    }

    pub fn less_equal(&self, target: u64) -> bool {
        self.value() <= target
    }

    pub fn less_than(&self, target: u64) -> bool {
        self.value() < target
    }

    pub fn equals(&self, target: u64) -> bool {
        self.value() == target
    }

    /// Three-way comparison of the current value against `target`.
    pub fn compare(&self, target: u64) -> CmpOrdering {
        self.value().cmp(&target)
    }

    /// Identity of this counter's shared state.
    pub fn key(&self) -> CounterKey {
        CounterKey(Arc::as_ptr(&self.inner) as *const () as usize)
    }

    /// Returns true if both handles refer to the same counter.
    pub fn same_as(&self, other: &Counter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers `watcher` to be told about every subsequent change.
    ///
    /// Registering the same watcher twice is a no-op. The registration is
    /// sequentially consistent with value updates: after `watch` returns,
    /// either a concurrent update notifies the watcher or a fresh
    /// [`value`](Self::value) read observes it.
    pub(crate) fn watch(&self, watcher: Arc<dyn CounterWatcher>) {
        let mut watchers = self.inner.watchers.lock();
        if watchers.iter().any(|w| same_watcher(w, &watcher)) {
            return;
        }
        watchers.push(watcher);
        self.inner.watcher_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn unwatch(&self, watcher: &Arc<dyn CounterWatcher>) {
        let mut watchers = self.inner.watchers.lock();
        if let Some(pos) = watchers.iter().position(|w| same_watcher(w, watcher)) {
            watchers.swap_remove(pos);
            self.inner.watcher_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.inner.watcher_count.load(Ordering::SeqCst)
    }

    fn notify(&self) {
        if self.inner.watcher_count.load(Ordering::SeqCst) == 0 {
            return;
        }
        // Watchers take their own locks; never call them under ours.
        let watchers = self.inner.watchers.lock().clone();
        for watcher in watchers {
            watcher.counter_changed();
        }
    }
}

fn same_watcher(a: &Arc<dyn CounterWatcher>, b: &Arc<dyn CounterWatcher>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Default for Counter {
    fn default() -> Self {
        Counter::new(0)
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("value", &self.value())
            .field("key", &self.key())
            .finish()
    }
}
