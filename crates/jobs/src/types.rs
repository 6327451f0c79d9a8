//! Job record model and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobforge_core::{JobId, ScopeId};

/// Retries assigned to a job when the creator does not choose a budget.
pub const DEFAULT_RETRIES: u32 = 3;

/// Category of a job record. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCategory {
    /// Waiting for its due time.
    Timer,
    /// Runnable now (or after a retry backoff).
    Executable,
    /// Parked by an operator; remembers what it was before.
    Suspended,
    /// Retries exhausted; waits for an operator.
    DeadLetter,
}

impl JobCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobCategory::Timer => "timer",
            JobCategory::Executable => "executable",
            JobCategory::Suspended => "suspended",
            JobCategory::DeadLetter => "dead_letter",
        }
    }

    /// Categories the acquisition loops may lock.
    pub fn is_acquirable(&self) -> bool {
        matches!(self, JobCategory::Timer | JobCategory::Executable)
    }
}

impl std::fmt::Display for JobCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timer" => Ok(JobCategory::Timer),
            "executable" => Ok(JobCategory::Executable),
            "suspended" => Ok(JobCategory::Suspended),
            "dead_letter" => Ok(JobCategory::DeadLetter),
            other => Err(format!("unknown job category '{other}'")),
        }
    }
}

/// A state-machine transition was requested from the wrong category.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} a job in category {from}")]
pub struct InvalidTransition {
    pub from: JobCategory,
    pub action: &'static str,
}

/// What a failed execution did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureTransition {
    /// Back to Executable with a smaller budget.
    Retry { retries_remaining: u32 },
    /// Budget exhausted.
    DeadLettered,
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub category: JobCategory,
    /// Key into the handler registry.
    pub handler_type: String,
    /// Opaque payload handed to the handler.
    pub handler_configuration: String,
    /// Not eligible for acquisition before this instant. `None` means immediately.
    pub due_time: Option<DateTime<Utc>>,
    pub retries_remaining: u32,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub tenant_id: Option<String>,
    /// Owning process scope (process instance / execution tree).
    pub scope_id: Option<ScopeId>,
    /// Exclusive jobs hold the scope lock while they run.
    pub exclusive: bool,
    /// Last failure message, kept for operators.
    pub exception_info: Option<String>,
    /// Repeat expression of a recurring timer (`R3/PT1H`).
    pub repeat: Option<String>,
    /// Fires left including this record's own fire; `u32::MAX` means unbounded.
    pub max_iterations: Option<u32>,
    /// A recurring timer never fires at or after this instant.
    pub end_date: Option<DateTime<Utc>>,
    /// Category to restore on resume.
    pub suspended_from: Option<JobCategory>,
    /// Optimistic-locking counter; bumped by the store on every write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create an immediately runnable job.
    pub fn executable(
        handler_type: impl Into<String>,
        handler_configuration: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::with_category(
            JobCategory::Executable,
            handler_type.into(),
            handler_configuration.into(),
            None,
            now,
        )
    }

    /// Create a job that waits until `due`.
    pub fn timer(
        handler_type: impl Into<String>,
        handler_configuration: impl Into<String>,
        due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::with_category(
            JobCategory::Timer,
            handler_type.into(),
            handler_configuration.into(),
            Some(due),
            now,
        )
    }

    fn with_category(
        category: JobCategory,
        handler_type: String,
        handler_configuration: String,
        due_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            category,
            handler_type,
            handler_configuration,
            due_time,
            retries_remaining: DEFAULT_RETRIES,
            lock_owner: None,
            lock_expiration_time: None,
            tenant_id: None,
            scope_id: None,
            exclusive: false,
            exception_info: None,
            repeat: None,
            max_iterations: None,
            end_date: None,
            suspended_from: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_remaining = retries;
        self
    }

    pub fn with_scope(mut self, scope_id: ScopeId) -> Self {
        self.scope_id = Some(scope_id);
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn with_due_time(mut self, due: DateTime<Utc>) -> Self {
        self.due_time = Some(due);
        self
    }

    /// Attach a recurrence to a timer.
    pub fn with_repeat(
        mut self,
        repeat: impl Into<String>,
        max_iterations: u32,
        end_date: Option<DateTime<Utc>>,
    ) -> Self {
        self.repeat = Some(repeat.into());
        self.max_iterations = Some(max_iterations);
        self.end_date = end_date;
        self
    }

    /// A live lease exists at `now`.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expiration_time) {
            (Some(_), Some(expires)) => now < expires,
            // An owner without an expiration never lapses on its own.
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn is_lockable_at(&self, now: DateTime<Utc>) -> bool {
        self.category.is_acquirable() && !self.is_locked_at(now)
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.due_time.is_none_or(|due| due <= now)
    }

    pub fn is_recurring(&self) -> bool {
        self.repeat.is_some()
    }

    pub fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }

    /// Timer → Executable once the due time is reached.
    ///
    /// The lease, if any, is kept: the acquirer hands the job straight on.
    pub fn promote_to_executable(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.category != JobCategory::Timer {
            return Err(InvalidTransition {
                from: self.category,
                action: "promote",
            });
        }
        self.category = JobCategory::Executable;
        self.updated_at = now;
        Ok(())
    }

    /// Apply a failed attempt to the retry ladder.
    pub fn record_failure(
        &mut self,
        message: impl Into<String>,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> FailureTransition {
        self.exception_info = Some(message.into());
        self.clear_lock();
        self.updated_at = now;

        if self.retries_remaining > 1 {
            self.retries_remaining -= 1;
            self.category = JobCategory::Executable;
            self.due_time = retry_at;
            FailureTransition::Retry {
                retries_remaining: self.retries_remaining,
            }
        } else {
            self.retries_remaining = 0;
            self.category = JobCategory::DeadLetter;
            FailureTransition::DeadLettered
        }
    }

    /// Timer|Executable → Suspended.
    pub fn suspend(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if !self.category.is_acquirable() {
            return Err(InvalidTransition {
                from: self.category,
                action: "suspend",
            });
        }
        self.suspended_from = Some(self.category);
        self.category = JobCategory::Suspended;
        self.clear_lock();
        self.updated_at = now;
        Ok(())
    }

    /// Suspended → whatever it was before.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.category != JobCategory::Suspended {
            return Err(InvalidTransition {
                from: self.category,
                action: "resume",
            });
        }
        self.category = self.suspended_from.take().unwrap_or(JobCategory::Executable);
        self.updated_at = now;
        Ok(())
    }

    /// DeadLetter → Executable, on operator request only.
    pub fn retry_from_dead_letter(
        &mut self,
        retries: u32,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if self.category != JobCategory::DeadLetter {
            return Err(InvalidTransition {
                from: self.category,
                action: "retry",
            });
        }
        self.category = JobCategory::Executable;
        self.retries_remaining = retries.max(1);
        self.due_time = None;
        self.clear_lock();
        self.updated_at = now;
        Ok(())
    }

    /// Fresh Timer record for the next cycle of a recurring timer.
    ///
    /// Identity, lease, failure info and version start over; scope, tenant,
    /// handler and recurrence settings carry forward.
    pub fn next_cycle(
        &self,
        due: DateTime<Utc>,
        max_iterations: u32,
        retries: u32,
        now: DateTime<Utc>,
    ) -> Job {
        Job {
            id: JobId::new(),
            category: JobCategory::Timer,
            handler_type: self.handler_type.clone(),
            handler_configuration: self.handler_configuration.clone(),
            due_time: Some(due),
            retries_remaining: retries,
            lock_owner: None,
            lock_expiration_time: None,
            tenant_id: self.tenant_id.clone(),
            scope_id: self.scope_id,
            exclusive: self.exclusive,
            exception_info: None,
            repeat: self.repeat.clone(),
            max_iterations: Some(max_iterations),
            end_date: self.end_date,
            suspended_from: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
