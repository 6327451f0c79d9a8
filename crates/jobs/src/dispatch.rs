//! The hand-off between acquisition and execution.

use std::time::Duration;

use thiserror::Error;

use crate::types::Job;

/// A job could not be handed over. The caller still holds the lease.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("execution queue is full")]
    QueueFull(Box<Job>),

    #[error("dispatcher is shutting down")]
    Closed(Box<Job>),

    #[error("dispatcher unavailable: {reason}")]
    Unavailable { job: Box<Job>, reason: String },
}

impl SubmitError {
    /// Take the rejected job back.
    pub fn into_job(self) -> Job {
        match self {
            SubmitError::QueueFull(job) | SubmitError::Closed(job) => *job,
            SubmitError::Unavailable { job, .. } => *job,
        }
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(self, SubmitError::QueueFull(_))
    }
}

/// What was left behind when a dispatcher stopped.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Every in-flight job finished before the deadline.
    pub completed_in_time: bool,
    /// Accepted but never started; their leases are still held.
    pub abandoned: Vec<Job>,
}

/// Accepts locked jobs for execution: a local pool or a message queue.
pub trait JobDispatcher: Send + Sync {
    fn submit(&self, job: Job) -> Result<(), SubmitError>;

    /// Jobs accepted but not yet started.
    fn queued(&self) -> usize;

    /// Stop accepting work and wait up to `timeout` for in-flight work.
    fn shutdown(&self, timeout: Duration) -> DrainReport;
}
