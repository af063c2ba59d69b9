//! # fiberjobs - Fiber Job Scheduler
//!
//! A cooperative fiber scheduler layered on a priority-bucketed thread pool.
//! Job bodies run on stackful fibers that can suspend themselves until a
//! [`Counter`] reaches a target value, freeing their worker thread for other
//! work in the meantime.
//!
//! ## Architecture
//!
//! - **Counters**: atomic 64-bit values jobs signal when they finish and
//!   fibers wait on
//! - **Fibers**: each job's closure runs on its own stack and yields an
//!   [`AwaitCounter`] whenever it needs to wait
//! - **Priority buckets**: one per [`JobPriority`], holding queued jobs,
//!   fibers parked on counters, and fibers ready to resume
//! - **Worker threads**: bound to one bucket each; the classic roster is
//!   5 HIGH, 5 MEDIUM, 4 LOW and 2 IO threads
//!
//! ## Example
//!
//! ```no_run
//! use fiberjobs::{Counter, FiberJob, JobPriority, JobSystem};
//!
//! let job_system = JobSystem::new().unwrap();
//!
//! let stage = Counter::new(0);
//! let done = Counter::new(0);
//!
//! let producer_stage = stage.clone();
//! let waiting_stage = stage.clone();
//! job_system
//!     .run_jobs([
//!         FiberJob::with_priority(done.clone(), JobPriority::High, move |ctx| {
//!             // Suspends this fiber, not the worker thread.
//!             ctx.await_counter(&waiting_stage, 1);
//!             println!("stage reached");
//!         }),
//!         FiberJob::with_priority(done.clone(), JobPriority::Low, move |_| {
//!             producer_stage.increment();
//!         }),
//!     ])
//!     .unwrap();
//!
//! job_system.wait_for_counter(&done, 2);
//! job_system.shutdown().unwrap();
//! ```

mod bucket;
pub mod config;
pub mod context;
pub mod counter;
pub mod error;
pub mod fiber;
mod fiber_pool;
pub mod job;
pub mod job_system;
pub mod metrics;
mod worker;

pub use config::{JobSystemConfig, PinningStrategy, WorkerRoster};
pub use context::FiberContext;
pub use counter::Counter;
pub use error::{ConfigError, JobSystemError};
pub use fiber::{AwaitCounter, in_fiber};
pub use job::{FiberJob, JobId, JobPriority};
pub use job_system::{BoxedWork, JobSystem, JobSystemHandle};
#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsSnapshot};
