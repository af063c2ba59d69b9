//! Optional performance metrics for the job system (feature `metrics`).

#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Bumps a metrics counter when the `metrics` feature is enabled.
macro_rules! metric {
    ($scheduler:expr, $field:ident) => {{
        #[cfg(feature = "metrics")]
        $scheduler
            .metrics()
            .$field
            .fetch_add(1, ::std::sync::atomic::Ordering::Relaxed);
    }};
    ($scheduler:expr, $field:ident, $amount:expr) => {{
        let _amount = $amount;
        #[cfg(feature = "metrics")]
        $scheduler
            .metrics()
            .$field
            .fetch_add(_amount as u64, ::std::sync::atomic::Ordering::Relaxed);
    }};
}
pub(crate) use metric;

/// Scheduler activity counters.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Jobs accepted by `run_jobs`.
    pub jobs_submitted: AtomicU64,
    /// Jobs whose fiber was started by a worker.
    pub jobs_started: AtomicU64,
    /// Jobs whose completion counter has been signalled.
    pub jobs_completed: AtomicU64,
    /// Times a fiber suspended on a counter.
    pub tasks_suspended: AtomicU64,
    /// Times a parked fiber was moved to the resumable list.
    pub tasks_promoted: AtomicU64,
    /// Times a worker resumed a promoted fiber.
    pub tasks_resumed: AtomicU64,
    /// Fibers whose closure panicked.
    pub tasks_panicked: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Metrics {
    /// Creates a new metrics instance.
    pub fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            jobs_started: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            tasks_suspended: AtomicU64::new(0),
            tasks_promoted: AtomicU64::new(0),
            tasks_resumed: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            tasks_suspended: self.tasks_suspended.load(Ordering::Relaxed),
            tasks_promoted: self.tasks_promoted.load(Ordering::Relaxed),
            tasks_resumed: self.tasks_resumed.load(Ordering::Relaxed),
            tasks_panicked: self.tasks_panicked.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(feature = "metrics")]
impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub tasks_suspended: u64,
    pub tasks_promoted: u64,
    pub tasks_resumed: u64,
    pub tasks_panicked: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    /// Calculates jobs per second throughput.
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Approximates how many jobs are queued or in flight.
    pub fn jobs_in_flight(&self) -> i64 {
        self.jobs_submitted as i64 - self.jobs_completed as i64
    }

    /// Approximates how many fibers are parked on counters (suspends - promotions).
    pub fn parked_tasks(&self) -> i64 {
        self.tasks_suspended as i64 - self.tasks_promoted as i64
    }
}
