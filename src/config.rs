//! Job system configuration.
//!
//! The worker roster decides how many OS threads service each priority
//! bucket. It can be derived from the machine's parallelism, loaded from JSON,
//! or set to the classic fixed split of 16 threads.

use crate::error::ConfigError;
use crate::job::JobPriority;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest fiber stack accepted by [`JobSystemConfig::validate`].
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Largest fiber stack accepted by [`JobSystemConfig::validate`].
pub const MAX_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to physical cores only (even-numbered logical processors), avoiding SMT contention.
    AvoidSmt,
}

impl PinningStrategy {
    /// Returns the core index a worker should be pinned to, if any.
    pub(crate) fn core_for(self, worker_index: usize, num_cores: usize) -> Option<usize> {
        if num_cores == 0 {
            return None;
        }
        match self {
            PinningStrategy::None => None,
            PinningStrategy::Linear => Some(worker_index % num_cores),
            PinningStrategy::AvoidSmt => {
                let physical = num_cores.div_ceil(2);
                Some((worker_index % physical) * 2)
            }
        }
    }
}

/// Number of worker threads assigned to each priority bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRoster {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub io: usize,
}

impl WorkerRoster {
    /// The fixed 16-thread split: 5 HIGH, 5 MEDIUM, 4 LOW, 2 IO.
    pub const fn legacy() -> Self {
        WorkerRoster {
            high: 5,
            medium: 5,
            low: 4,
            io: 2,
        }
    }

    /// One worker per priority. Handy for deterministic ordering tests.
    pub const fn single() -> Self {
        WorkerRoster {
            high: 1,
            medium: 1,
            low: 1,
            io: 1,
        }
    }

    /// Scales the legacy shape to `threads` workers.
    ///
    /// Every bucket gets at least one worker, so fewer than four threads is
    /// rounded up to four. For 16 threads this reproduces [`WorkerRoster::legacy`].
    pub fn for_parallelism(threads: usize) -> Self {
        let threads = threads.max(JobPriority::COUNT);
        let io = (threads / 8).max(1);
        let remaining = threads - io;
        let low = (remaining * 4 / 14).max(1);
        let high = (remaining - low).div_ceil(2);
        let medium = remaining - low - high;

        WorkerRoster {
            high,
            medium,
            low,
            io,
        }
    }

    /// Derives the roster from the number of logical CPUs.
    pub fn detect() -> Self {
        Self::for_parallelism(num_cpus::get())
    }

    /// Number of workers servicing `priority`.
    pub fn count(&self, priority: JobPriority) -> usize {
        match priority {
            JobPriority::High => self.high,
            JobPriority::Medium => self.medium,
            JobPriority::Low => self.low,
            JobPriority::Io => self.io,
        }
    }

    pub fn total(&self) -> usize {
        self.high + self.medium + self.low + self.io
    }

    /// Yields one priority per worker thread, in spawn order.
    pub fn assignments(&self) -> impl Iterator<Item = JobPriority> + '_ {
        JobPriority::ALL
            .into_iter()
            .flat_map(move |priority| std::iter::repeat_n(priority, self.count(priority)))
    }
}

impl Default for WorkerRoster {
    fn default() -> Self {
        Self::detect()
    }
}

/// Configuration for the job system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSystemConfig {
    /// Threads per priority bucket.
    pub roster: WorkerRoster,
    /// Stack size for each fiber in bytes. Default: 256KB.
    pub stack_size: usize,
    /// Maximum number of finished fiber stacks kept for reuse. Default: 64.
    pub stack_pool_capacity: usize,
    /// CPU pinning for worker threads.
    pub pinning: PinningStrategy,
    /// Upper bound on how long an idle worker sleeps before re-scanning its
    /// bucket's waiters. Default: 5ms.
    pub idle_timeout_ms: u64,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            roster: WorkerRoster::default(),
            stack_size: 256 * 1024,
            stack_pool_capacity: 64,
            pinning: PinningStrategy::None,
            idle_timeout_ms: 5,
        }
    }
}

impl JobSystemConfig {
    /// Default configuration with an explicit roster.
    pub fn with_roster(roster: WorkerRoster) -> Self {
        Self {
            roster,
            ..Self::default()
        }
    }

    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// ```
    /// use fiberjobs::JobSystemConfig;
    ///
    /// let config = JobSystemConfig::from_json(
    ///     r#"{ "roster": { "high": 2, "medium": 2, "low": 1, "io": 1 }, "stack_size": 65536 }"#,
    /// ).unwrap();
    /// assert_eq!(config.roster.total(), 6);
    /// ```
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every priority has a worker and the stack size is within
    /// [`MIN_STACK_SIZE`]..=[`MAX_STACK_SIZE`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(priority) = JobPriority::ALL
            .into_iter()
            .find(|&p| self.roster.count(p) == 0)
        {
            return Err(ConfigError::NoWorkers(priority));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::StackTooSmall {
                size: self.stack_size,
                min: MIN_STACK_SIZE,
            });
        }
        if self.stack_size > MAX_STACK_SIZE {
            return Err(ConfigError::StackTooLarge {
                size: self.stack_size,
                max: MAX_STACK_SIZE,
            });
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.max(1))
    }
}
