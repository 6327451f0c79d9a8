//! Error types shared across the scheduler components.

use thiserror::Error;

use jobforge_core::{DomainError, JobId, ScopeId};

use crate::store::StoreError;
use crate::types::JobCategory;

/// A timer definition, end date or configuration value could not be used.
///
/// Raised when a timer is scheduled or the scheduler is configured, never while
/// a job is executing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid repeat expression '{expression}': {reason}")]
    InvalidRepeat { expression: String, reason: String },

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("invalid date '{0}'")]
    InvalidDate(String),

    #[error("end date expression '{expression}' evaluated to unsupported type {found}")]
    UnsupportedEndDateType { expression: String, found: String },

    #[error("failed to evaluate expression '{expression}': {reason}")]
    Expression { expression: String, reason: String },

    #[error("unknown business calendar '{0}'")]
    UnknownCalendar(String),

    #[error("timer '{expression}' ends before its first fire time")]
    EndsBeforeFirstFire { expression: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub(crate) fn repeat(expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRepeat {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the scheduler facade.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {id} is {actual:?}, operation requires {expected}")]
    InvalidState {
        id: JobId,
        actual: JobCategory,
        expected: &'static str,
    },

    #[error("job {0} is currently locked by an executor")]
    JobLocked(JobId),

    #[error("scope {0} is locked by another owner")]
    ScopeLocked(ScopeId),

    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler is not running")]
    NotRunning,

    #[error("failed to spawn thread '{name}': {reason}")]
    Spawn { name: String, reason: String },
}

impl SchedulerError {
    pub(crate) fn spawn(name: impl Into<String>, err: std::io::Error) -> Self {
        Self::Spawn {
            name: name.into(),
            reason: err.to_string(),
        }
    }
}
