//! Runs one locked job and stores its outcome.
//!
//! Success deletes the job, or swaps a recurring timer for its next Timer
//! record in one store call. Failure goes to the exception-handler chain first, then down the
//! retry ladder. Every store write is a compare-and-set on the version read
//! at lock time; losing it means another owner took over and the result is
//! dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use jobforge_core::{ExpectedVersion, JobId, ScopeId, SharedClock};

use crate::config::RetryPolicy;
use crate::handler::{ExceptionHandlerChain, ExecutionError, HandlerRegistry, JobContext};
use crate::lock::{job_scope_holder, lease_span, SharedScopeLocks};
use crate::recurrence;
use crate::store::{SharedStore, StoreError};
use crate::types::{FailureTransition, Job, DEFAULT_RETRIES};

/// What happened to a job handed to the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Handler succeeded and the job was deleted.
    Completed { next_timer: Option<JobId> },
    /// Handler failed; the job is Executable again.
    Retrying {
        retries_remaining: u32,
        due_time: Option<DateTime<Utc>>,
    },
    /// Handler failed with no retries left.
    DeadLettered,
    /// An exception handler took responsibility for the failure.
    ClaimedByExceptionHandler,
    /// Exclusive job whose scope is locked by another owner; lease released.
    ScopeBusy,
    /// Another owner changed the job meanwhile; nothing was written.
    LostRace,
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_claimed: u64,
    pub scope_conflicts: u64,
    pub lost_races: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    claimed: AtomicU64,
    scope_conflicts: AtomicU64,
    lost_races: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            jobs_claimed: self.claimed.load(Ordering::Relaxed),
            scope_conflicts: self.scope_conflicts.load(Ordering::Relaxed),
            lost_races: self.lost_races.load(Ordering::Relaxed),
        }
    }
}

/// Executes locked jobs with the registered handlers.
pub struct JobRunner {
    store: SharedStore,
    clock: SharedClock,
    owner: String,
    handlers: HandlerRegistry,
    exception_handlers: ExceptionHandlerChain,
    scope_locks: Option<SharedScopeLocks>,
    scope_lease: TimeDelta,
    retry_policy: RetryPolicy,
    default_retries: u32,
    counters: Counters,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("owner", &self.owner)
            .field("handlers", &self.handlers)
            .field("stats", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        owner: impl Into<String>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            store,
            clock,
            owner: owner.into(),
            handlers,
            exception_handlers: ExceptionHandlerChain::new(),
            scope_locks: None,
            scope_lease: TimeDelta::hours(1),
            retry_policy: RetryPolicy::immediate(),
            default_retries: DEFAULT_RETRIES,
            counters: Counters::default(),
        }
    }

    pub fn with_exception_handlers(mut self, chain: ExceptionHandlerChain) -> Self {
        self.exception_handlers = chain;
        self
    }

    pub fn with_scope_locks(mut self, locks: SharedScopeLocks, lease: std::time::Duration) -> Self {
        self.scope_locks = Some(locks);
        self.scope_lease = lease_span(lease);
        self
    }

    /// Backoff between attempts and the retry budget given to new cycles.
    pub fn with_retry_policy(mut self, policy: RetryPolicy, default_retries: u32) -> Self {
        self.retry_policy = policy;
        self.default_retries = default_retries;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }

    /// Run a job this owner has locked. `job.version` must be the version
    /// returned by the lock.
    pub fn run(&self, job: Job) -> Result<RunOutcome, StoreError> {
        let scope = self.enter_scope(&job)?;
        let Some(scope) = scope else {
            return Ok(RunOutcome::ScopeBusy);
        };

        let outcome = self.run_locked(job);

        if let ScopeGuard::Held { scope_id, holder } = scope {
            if let Some(locks) = &self.scope_locks {
                if let Err(err) = locks.clear_scope_lock(scope_id, &holder) {
                    warn!(scope_id = %scope_id, error = %err, "failed to clear scope lock");
                }
            }
        }
        outcome
    }

    /// Like [`run`](Self::run), logging store failures instead of returning them.
    pub fn execute(&self, job: Job) {
        let job_id = job.id;
        if let Err(err) = self.run(job) {
            tracing::error!(
                job_id = %job_id,
                owner = %self.owner,
                error = %err,
                "failed to store job outcome; lease will expire"
            );
        }
    }

    /// `Ok(None)` when the scope is held by someone else.
    fn enter_scope(&self, job: &Job) -> Result<Option<ScopeGuard>, StoreError> {
        let (true, Some(scope_id), Some(locks)) = (job.exclusive, job.scope_id, &self.scope_locks)
        else {
            return Ok(Some(ScopeGuard::NotNeeded));
        };

        let now = self.clock.now();
        let holder = job_scope_holder(&self.owner, job.id);
        if locks.extend_scope_lock(scope_id, &holder, self.scope_lease, now)? {
            return Ok(Some(ScopeGuard::Held { scope_id, holder }));
        }

        Counters::bump(&self.counters.scope_conflicts);
        debug!(
            job_id = %job.id,
            scope_id = %scope_id,
            owner = %self.owner,
            "scope held by another job, releasing job"
        );
        self.store.release(job.id, &self.owner, job.version, now)?;
        Ok(None)
    }

    fn run_locked(&self, job: Job) -> Result<RunOutcome, StoreError> {
        Counters::bump(&self.counters.processed);

        let result = match self.handlers.get(&job.handler_type) {
            None => Err(ExecutionError::MissingHandler(job.handler_type.clone())),
            Some(handler) => {
                let ctx = JobContext::new(&job, &self.owner, self.clock.now());
                panic::catch_unwind(AssertUnwindSafe(|| handler.execute(&ctx)))
                    .unwrap_or_else(|payload| Err(ExecutionError::from_panic(payload.as_ref())))
            }
        };

        match result {
            Ok(()) => self.complete(job),
            Err(err) => self.fail(job, err),
        }
    }

    fn complete(&self, job: Job) -> Result<RunOutcome, StoreError> {
        let now = self.clock.now();
        let next = match recurrence::next_cycle(&job, now) {
            Ok(next) => next,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "invalid recurrence, not rescheduling");
                None
            }
        };

        let next_timer = match next {
            None => match self.store.delete(job.id, ExpectedVersion::Exact(job.version)) {
                Ok(true) => None,
                Ok(false) | Err(StoreError::StaleVersion { .. }) => return Ok(self.lost_race(&job)),
                Err(err) => return Err(err),
            },
            Some(cycle) => {
                let timer = job.next_cycle(cycle.due, cycle.max_iterations, self.default_retries, now);
                let timer = match self.store.replace_with_next_cycle(job.id, job.version, timer) {
                    Ok(Some(timer)) => timer,
                    Ok(None) | Err(StoreError::StaleVersion { .. }) => {
                        return Ok(self.lost_race(&job));
                    }
                    Err(err) => return Err(err),
                };
                debug!(
                    job_id = %job.id,
                    next_job_id = %timer.id,
                    due = %cycle.due,
                    iterations_left = cycle.max_iterations,
                    "scheduled next timer cycle"
                );
                Some(timer.id)
            }
        };
        Counters::bump(&self.counters.succeeded);

        debug!(job_id = %job.id, handler_type = %job.handler_type, "job completed");
        Ok(RunOutcome::Completed { next_timer })
    }

    fn fail(&self, mut job: Job, err: ExecutionError) -> Result<RunOutcome, StoreError> {
        Counters::bump(&self.counters.failed);
        warn!(
            job_id = %job.id,
            handler_type = %job.handler_type,
            retries_remaining = job.retries_remaining,
            error = %err,
            "job execution failed"
        );

        if self
            .exception_handlers
            .handle(&job, &err, self.store.as_ref())
        {
            Counters::bump(&self.counters.claimed);
            // Drop our lease unless the handler already rewrote the job.
            self.store
                .release(job.id, &self.owner, job.version, self.clock.now())?;
            return Ok(RunOutcome::ClaimedByExceptionHandler);
        }

        let now = self.clock.now();
        let attempt = self
            .default_retries
            .max(job.retries_remaining)
            .saturating_sub(job.retries_remaining)
            + 1;
        let delay = self.retry_policy.delay_for_attempt(attempt);
        let retry_at = (!delay.is_zero()).then(|| now + lease_span(delay));

        let expected = job.version;
        let transition = job.record_failure(err.to_string(), retry_at, now);
        match self.store.update(&job, expected) {
            Ok(_) => {}
            Err(StoreError::StaleVersion { .. }) | Err(StoreError::NotFound(_)) => {
                return Ok(self.lost_race(&job));
            }
            Err(err) => return Err(err),
        }

        Ok(match transition {
            FailureTransition::Retry { retries_remaining } => {
                Counters::bump(&self.counters.retried);
                RunOutcome::Retrying {
                    retries_remaining,
                    due_time: job.due_time,
                }
            }
            FailureTransition::DeadLettered => {
                Counters::bump(&self.counters.dead_lettered);
                info!(
                    job_id = %job.id,
                    handler_type = %job.handler_type,
                    error = %err,
                    "job moved to dead letter"
                );
                RunOutcome::DeadLettered
            }
        })
    }

    fn lost_race(&self, job: &Job) -> RunOutcome {
        Counters::bump(&self.counters.lost_races);
        debug!(
            job_id = %job.id,
            owner = %self.owner,
            version = job.version,
            "job changed under us, dropping outcome"
        );
        RunOutcome::LostRace
    }
}

enum ScopeGuard {
    NotNeeded,
    Held { scope_id: ScopeId, holder: String },
}

/// The runner as a pool task.
pub fn runner_task(runner: Arc<JobRunner>) -> crate::pool::JobTask {
    Arc::new(move |job: Job| runner.execute(job))
}
