//! Error types for the job system.

use crate::job::JobPriority;
use std::io;
use thiserror::Error;

/// Errors raised while validating or loading a [`JobSystemConfig`](crate::JobSystemConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Jobs submitted to a bucket without workers would never run.
    #[error("no worker threads assigned to the {0} priority")]
    NoWorkers(JobPriority),

    #[error("fiber stack size {size} is below the minimum of {min} bytes")]
    StackTooSmall { size: usize, min: usize },

    #[error("fiber stack size {size} is above the maximum of {max} bytes")]
    StackTooLarge { size: usize, max: usize },

    #[error("failed to parse job system config")]
    Parse(#[from] serde_json::Error),
}

/// Errors surfaced by the job system lifecycle and submission API.
#[derive(Debug, Error)]
pub enum JobSystemError {
    #[error("invalid job system configuration")]
    Config(#[from] ConfigError),

    #[error("failed to spawn {priority} worker thread")]
    Spawn {
        priority: JobPriority,
        #[source]
        source: io::Error,
    },

    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),

    /// Submission after shutdown was requested.
    #[error("job system is shut down")]
    ShutDown,
}
