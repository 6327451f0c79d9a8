//! The scheduler facade: wiring, lifecycle and administration.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use jobforge_core::{ExpectedVersion, JobId, ScopeId, SharedClock, SystemClock};

use crate::acquisition::{AcquisitionKind, AcquisitionLoop, AcquisitionSettings};
use crate::broker::{MessageQueueDispatcher, SharedBroker};
use crate::calendar::{resolve_end_date, BusinessCalendar, CalendarRegistry, EndDateSpec, VariableScope};
use crate::config::SchedulerConfig;
use crate::dispatch::JobDispatcher;
use crate::error::{ConfigError, SchedulerError};
use crate::executor::{runner_task, ExecutorStats, JobRunner};
use crate::handler::{
    ExceptionHandler, ExceptionHandlerChain, ExecutionError, HandlerRegistry, JobContext, JobHandler,
};
use crate::lock::{lease_span, InMemoryScopeLocks, LockManager, SharedScopeLocks};
use crate::pool::{ExecutionPool, PoolConfig};
use crate::reclaimer::{ExpiredLockReclaimer, ReclaimerSettings};
use crate::recurrence::{is_expired, TimerSpec};
use crate::store::{JobQuery, JobStats, SharedStore};
use crate::types::{InvalidTransition, Job, JobCategory};
use crate::worker::WorkerHandle;

/// How long message-queue consumers block on the broker per poll.
const CONSUMER_POLL: Duration = Duration::from_millis(100);

/// A job to run as soon as possible (or at `due_time`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub handler_type: String,
    pub configuration: String,
    pub retries: Option<u32>,
    pub scope_id: Option<ScopeId>,
    pub tenant_id: Option<String>,
    pub exclusive: bool,
    pub due_time: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(handler_type: impl Into<String>, configuration: impl Into<String>) -> Self {
        Self {
            handler_type: handler_type.into(),
            configuration: configuration.into(),
            retries: None,
            scope_id: None,
            tenant_id: None,
            exclusive: false,
            due_time: None,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
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
}

/// A timer: an absolute date, a duration or a cycle expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTimer {
    pub handler_type: String,
    pub configuration: String,
    pub definition: String,
    pub end_date: Option<EndDateSpec>,
    pub retries: Option<u32>,
    pub scope_id: Option<ScopeId>,
    pub tenant_id: Option<String>,
    pub exclusive: bool,
}

impl NewTimer {
    pub fn new(
        handler_type: impl Into<String>,
        configuration: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            handler_type: handler_type.into(),
            configuration: configuration.into(),
            definition: definition.into(),
            end_date: None,
            retries: None,
            scope_id: None,
            tenant_id: None,
            exclusive: false,
        }
    }

    pub fn with_end_date(mut self, end_date: EndDateSpec) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
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
}

/// Result of a graceful shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub completed_in_time: bool,
    /// Queued jobs that never started.
    pub abandoned: usize,
    /// Abandoned jobs whose lease was handed back.
    pub released: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub queued: usize,
    pub jobs: JobStats,
    pub executor: ExecutorStats,
}

struct Running {
    dispatcher: Arc<dyn JobDispatcher>,
    workers: Vec<WorkerHandle>,
}

/// Builder for [`JobScheduler`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    store: SharedStore,
    clock: SharedClock,
    scope_locks: Option<SharedScopeLocks>,
    handlers: HandlerRegistry,
    exception_handlers: ExceptionHandlerChain,
    calendars: CalendarRegistry,
    broker: Option<SharedBroker>,
}

impl SchedulerBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn scope_locks(mut self, scope_locks: SharedScopeLocks) -> Self {
        self.scope_locks = Some(scope_locks);
        self
    }

    pub fn handler<H>(mut self, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.register(handler);
        self
    }

    pub fn handler_fn<F>(mut self, handler_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(&JobContext<'_>) -> Result<(), ExecutionError> + Send + Sync + 'static,
    {
        self.handlers.register_fn(handler_type, f);
        self
    }

    /// Replace the whole handler registry.
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn exception_handler<H>(mut self, handler: H) -> Self
    where
        H: ExceptionHandler + 'static,
    {
        self.exception_handlers.push(handler);
        self
    }

    pub fn calendar<C>(mut self, calendar: C) -> Self
    where
        C: BusinessCalendar + 'static,
    {
        self.calendars.register(calendar);
        self
    }

    pub fn broker(mut self, broker: SharedBroker) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn build(self) -> Result<JobScheduler, SchedulerError> {
        self.config.validate()?;
        if self.config.message_queue_mode && self.broker.is_none() {
            return Err(ConfigError::invalid("message queue mode requires a broker").into());
        }

        let scope_locks = self
            .scope_locks
            .unwrap_or_else(|| InMemoryScopeLocks::arc() as SharedScopeLocks);
        let owner = self.config.lock_owner.clone();

        let runner = JobRunner::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            owner.clone(),
            self.handlers,
        )
        .with_exception_handlers(self.exception_handlers)
        .with_scope_locks(Arc::clone(&scope_locks), self.config.scope_lock_lease)
        .with_retry_policy(self.config.retry_policy.clone(), self.config.number_of_retries);

        Ok(JobScheduler {
            locks: LockManager::new(Arc::clone(&self.store), Arc::clone(&self.clock), owner),
            runner: Arc::new(runner),
            config: self.config,
            store: self.store,
            clock: self.clock,
            scope_locks,
            calendars: self.calendars,
            broker: self.broker,
            state: Mutex::new(None),
        })
    }
}

/// Owns the acquisition loops, the execution side and the reclaimer of one node.
pub struct JobScheduler {
    config: SchedulerConfig,
    store: SharedStore,
    clock: SharedClock,
    scope_locks: SharedScopeLocks,
    calendars: CalendarRegistry,
    broker: Option<SharedBroker>,
    runner: Arc<JobRunner>,
    locks: LockManager,
    state: Mutex<Option<Running>>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("owner", &self.config.lock_owner)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl JobScheduler {
    pub fn builder(config: SchedulerConfig, store: SharedStore) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            store,
            clock: Arc::new(SystemClock),
            scope_locks: None,
            handlers: HandlerRegistry::new(),
            exception_handlers: ExceptionHandlerChain::new(),
            calendars: CalendarRegistry::default(),
            broker: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn owner(&self) -> &str {
        &self.config.lock_owner
    }

    fn state(&self) -> MutexGuard<'_, Option<Running>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state().is_some()
    }

    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.state();
        if state.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let dispatcher = self.start_dispatcher()?;
        let mut workers = Vec::new();
        if let Err(err) = self.start_workers(&dispatcher, &mut workers) {
            workers.into_iter().for_each(WorkerHandle::shutdown);
            dispatcher.shutdown(Duration::ZERO);
            return Err(err);
        }

        info!(
            owner = %self.config.lock_owner,
            message_queue_mode = self.config.message_queue_mode,
            timer_acquisition = self.config.timer_acquisition_enabled,
            async_acquisition = self.config.async_acquisition_enabled,
            "job scheduler started"
        );
        *state = Some(Running { dispatcher, workers });
        Ok(())
    }

    fn start_dispatcher(&self) -> Result<Arc<dyn JobDispatcher>, SchedulerError> {
        let task = runner_task(Arc::clone(&self.runner));
        if self.config.message_queue_mode {
            let broker = self
                .broker
                .clone()
                .ok_or_else(|| ConfigError::invalid("message queue mode requires a broker"))?;
            let dispatcher = MessageQueueDispatcher::start(
                broker,
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                task,
                self.config.core_pool_size,
                CONSUMER_POLL,
            )?;
            Ok(Arc::new(dispatcher))
        } else {
            let pool = ExecutionPool::start(
                PoolConfig {
                    name: "jobforge-exec".to_string(),
                    core_size: self.config.core_pool_size,
                    max_size: self.config.max_pool_size,
                    keep_alive: self.config.keep_alive,
                    queue_capacity: self.config.queue_capacity,
                },
                task,
            )?;
            Ok(Arc::new(pool))
        }
    }

    fn start_workers(
        &self,
        dispatcher: &Arc<dyn JobDispatcher>,
        workers: &mut Vec<WorkerHandle>,
    ) -> Result<(), SchedulerError> {
        let config = &self.config;
        if config.timer_acquisition_enabled {
            workers.push(self.acquisition(AcquisitionKind::Timer, dispatcher).spawn()?);
        }
        if config.async_acquisition_enabled {
            workers.push(self.acquisition(AcquisitionKind::Async, dispatcher).spawn()?);
        }
        if config.reset_expired_enabled {
            let reclaimer = ExpiredLockReclaimer::new(
                ReclaimerSettings {
                    interval: config.reset_expired_interval,
                    page_size: config.reset_expired_page_size,
                    max_timeout: config.reset_expired_max_timeout,
                },
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
            );
            workers.push(reclaimer.spawn()?);
        }
        Ok(())
    }

    fn acquisition(&self, kind: AcquisitionKind, dispatcher: &Arc<dyn JobDispatcher>) -> AcquisitionLoop {
        let config = &self.config;
        let settings = match kind {
            AcquisitionKind::Timer => AcquisitionSettings {
                kind,
                max_per_acquisition: config.max_timer_jobs_per_acquisition,
                default_wait: config.default_timer_acquire_wait,
                lock_lease: config.timer_lock_lease,
                execution_lease: config.async_lock_lease,
                queue_full_wait: config.queue_full_wait,
            },
            AcquisitionKind::Async => AcquisitionSettings {
                kind,
                max_per_acquisition: config.max_async_jobs_per_acquisition,
                default_wait: config.default_async_acquire_wait,
                lock_lease: config.async_lock_lease,
                execution_lease: config.async_lock_lease,
                queue_full_wait: config.queue_full_wait,
            },
        };
        AcquisitionLoop::new(
            settings,
            Arc::clone(&self.store),
            self.locks.clone(),
            Arc::clone(dispatcher),
            Arc::clone(&self.clock),
        )
    }

    /// Stop acquisition, drain the execution side up to `shutdown_wait`, then
    /// hand back the leases of work that never started.
    pub fn shutdown(&self) -> Result<ShutdownReport, SchedulerError> {
        let running = self.state().take().ok_or(SchedulerError::NotRunning)?;

        running.workers.iter().for_each(WorkerHandle::signal);
        running.workers.into_iter().for_each(WorkerHandle::join);

        let drain = running.dispatcher.shutdown(self.config.shutdown_wait);
        let mut report = ShutdownReport {
            completed_in_time: drain.completed_in_time,
            abandoned: drain.abandoned.len(),
            released: 0,
        };
        for job in drain.abandoned {
            match self.locks.release(job.id, job.version) {
                Ok(true) => report.released += 1,
                Ok(false) => {}
                Err(err) => warn!(job_id = %job.id, error = %err, "failed to release abandoned job"),
            }
        }

        info!(
            owner = %self.config.lock_owner,
            completed_in_time = report.completed_in_time,
            abandoned = report.abandoned,
            released = report.released,
            "job scheduler stopped"
        );
        Ok(report)
    }

    /// Persist a job. While running with `dispatch_on_create`, a due job is
    /// locked and handed to this node's executor straight away.
    ///
    /// Returns the record as inserted.
    pub fn create_job(&self, new: NewJob) -> Result<Job, SchedulerError> {
        let now = self.clock.now();
        let mut job = Job::executable(new.handler_type, new.configuration, now)
            .with_retries(new.retries.unwrap_or(self.config.number_of_retries));
        job.scope_id = new.scope_id;
        job.tenant_id = new.tenant_id;
        job.exclusive = new.exclusive;
        job.due_time = new.due_time;

        let job = self.store.insert(job)?;
        debug!(job_id = %job.id, handler_type = %job.handler_type, "job created");
        if job.is_due_at(now) {
            self.dispatch_on_create(&job);
        }
        Ok(job)
    }

    /// Validate and persist a timer. Malformed definitions and end dates are
    /// reported here, never at fire time.
    pub fn schedule_timer(
        &self,
        timer: NewTimer,
        variables: &dyn VariableScope,
    ) -> Result<Job, SchedulerError> {
        let now = self.clock.now();
        let spec = TimerSpec::parse(&timer.definition)?;
        let due = spec.first_due_time(now)?;
        let explicit_end = timer
            .end_date
            .as_ref()
            .map(|end| resolve_end_date(end, variables, &self.calendars))
            .transpose()?;

        let mut job = Job::timer(timer.handler_type, timer.configuration, due, now)
            .with_retries(timer.retries.unwrap_or(self.config.number_of_retries));
        job.scope_id = timer.scope_id;
        job.tenant_id = timer.tenant_id;
        job.exclusive = timer.exclusive;

        let end = match &spec {
            TimerSpec::Cycle(recurrence) => {
                let end = match (explicit_end, recurrence.end()) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                job = job.with_repeat(recurrence.expression(), recurrence.max_iterations(), end);
                end
            }
            _ => explicit_end,
        };
        if is_expired(due, end) {
            return Err(ConfigError::EndsBeforeFirstFire {
                expression: timer.definition,
            }
            .into());
        }

        // Already due: no point waiting for the timer loop.
        if due <= now {
            job.category = JobCategory::Executable;
        }

        let job = self.store.insert(job)?;
        debug!(job_id = %job.id, due = %due, category = %job.category, "timer scheduled");
        if job.category == JobCategory::Executable {
            self.dispatch_on_create(&job);
        }
        Ok(job)
    }

    fn dispatch_on_create(&self, job: &Job) {
        if !self.config.dispatch_on_create {
            return;
        }
        let Some(dispatcher) = self.state().as_ref().map(|r| Arc::clone(&r.dispatcher)) else {
            return;
        };

        let mut locked = job.clone();
        match self.locks.lock_job(&mut locked, self.config.async_lock_lease) {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "direct dispatch lock failed");
                return;
            }
        }

        if let Err(rejected) = dispatcher.submit(locked) {
            debug!(job_id = %job.id, reason = %rejected, "direct dispatch rejected, leaving job to acquisition");
            let locked = rejected.into_job();
            if let Err(err) = self.locks.release(locked.id, locked.version) {
                warn!(job_id = %job.id, error = %err, "failed to release job after rejected dispatch");
            }
        }
    }

    pub fn get_job(&self, id: JobId) -> Result<Job, SchedulerError> {
        self.store.get(id)?.ok_or(SchedulerError::JobNotFound(id))
    }

    /// Look a job up by its textual id.
    pub fn find_job(&self, id: &str) -> Result<Job, SchedulerError> {
        self.get_job(id.parse()?)
    }

    pub fn list_jobs(&self, query: &JobQuery, limit: usize) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.store.find(query, limit)?)
    }

    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<Job>, SchedulerError> {
        self.list_jobs(&JobQuery::new().category(JobCategory::DeadLetter), limit)
    }

    /// Move a dead letter back to Executable with a fresh budget.
    pub fn retry_dead_letter(&self, id: JobId, retries: Option<u32>) -> Result<Job, SchedulerError> {
        let mut job = self.get_job(id)?;
        let expected = job.version;
        job.retry_from_dead_letter(
            retries.unwrap_or(self.config.number_of_retries),
            self.clock.now(),
        )
        .map_err(|err| invalid_state(id, err, "dead_letter"))?;
        job.version = self.store.update(&job, expected)?;
        info!(job_id = %id, retries = job.retries_remaining, "dead letter retried");
        self.dispatch_on_create(&job);
        Ok(job)
    }

    pub fn delete_dead_letter(&self, id: JobId) -> Result<(), SchedulerError> {
        let job = self.get_job(id)?;
        if job.category != JobCategory::DeadLetter {
            return Err(SchedulerError::InvalidState {
                id,
                actual: job.category,
                expected: "dead_letter",
            });
        }
        if !self.store.delete(id, ExpectedVersion::Exact(job.version))? {
            return Err(SchedulerError::JobNotFound(id));
        }
        info!(job_id = %id, "dead letter deleted");
        Ok(())
    }

    pub fn suspend_job(&self, id: JobId) -> Result<Job, SchedulerError> {
        let now = self.clock.now();
        let mut job = self.get_job(id)?;
        if job.is_locked_at(now) {
            return Err(SchedulerError::JobLocked(id));
        }
        let expected = job.version;
        job.suspend(now)
            .map_err(|err| invalid_state(id, err, "timer or executable"))?;
        job.version = self.store.update(&job, expected)?;
        info!(job_id = %id, "job suspended");
        Ok(job)
    }

    pub fn resume_job(&self, id: JobId) -> Result<Job, SchedulerError> {
        let mut job = self.get_job(id)?;
        let expected = job.version;
        job.resume(self.clock.now())
            .map_err(|err| invalid_state(id, err, "suspended"))?;
        job.version = self.store.update(&job, expected)?;
        info!(job_id = %id, category = %job.category, "job resumed");
        Ok(job)
    }

    /// Cascade delete of a scope's jobs, under the scope lock. Fails with
    /// `ScopeLocked` while any exclusive job of the scope runs, on this node
    /// or another.
    pub fn delete_scope_jobs(&self, scope_id: ScopeId) -> Result<usize, SchedulerError> {
        let now = self.clock.now();
        let holder = format!("{}/cascade/{}", self.config.lock_owner, Uuid::now_v7());
        let lease = lease_span(self.config.scope_lock_lease);
        if !self.scope_locks.extend_scope_lock(scope_id, &holder, lease, now)? {
            return Err(SchedulerError::ScopeLocked(scope_id));
        }

        let deleted = self.store.delete_by_scope(scope_id);
        if let Err(err) = self.scope_locks.clear_scope_lock(scope_id, &holder) {
            warn!(scope_id = %scope_id, error = %err, "failed to clear scope lock");
        }
        let deleted = deleted?;
        info!(scope_id = %scope_id, deleted, "scope jobs deleted");
        Ok(deleted)
    }

    pub fn stats(&self) -> Result<SchedulerStats, SchedulerError> {
        let (running, queued) = match self.state().as_ref() {
            Some(r) => (true, r.dispatcher.queued()),
            None => (false, 0),
        };
        Ok(SchedulerStats {
            running,
            queued,
            jobs: self.store.stats()?,
            executor: self.runner.stats(),
        })
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(err) = self.shutdown() {
                warn!(error = %err, "shutdown on drop failed");
            }
        }
    }
}

fn invalid_state(id: JobId, err: InvalidTransition, expected: &'static str) -> SchedulerError {
    SchedulerError::InvalidState {
        id,
        actual: err.from,
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::calendar::{ExpressionValue, NoVariables};
    use crate::lock::{job_scope_holder, ScopeLockManager};
    use crate::store::{InMemoryJobStore, JobStore};
    use chrono::{TimeDelta, TimeZone};
    use jobforge_core::ManualClock;
    use std::collections::HashMap;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn scheduler() -> (Arc<InMemoryJobStore>, JobScheduler) {
        let store = InMemoryJobStore::arc();
        let scheduler = JobScheduler::builder(
            SchedulerConfig::default().with_lock_owner("node-a"),
            store.clone(),
        )
        .clock(ManualClock::arc(t0()))
        .handler_fn("ok", |_| Ok(()))
        .build()
        .unwrap();
        (store, scheduler)
    }

    #[test]
    fn build_rejects_invalid_config_and_missing_broker() {
        let store = InMemoryJobStore::arc();
        let bad = SchedulerConfig::default().with_pool_size(4, 2);
        assert!(matches!(
            JobScheduler::builder(bad, store.clone()).build(),
            Err(SchedulerError::Config(ConfigError::Invalid(_)))
        ));

        let mq = SchedulerConfig::default().with_message_queue_mode(true);
        assert!(JobScheduler::builder(mq.clone(), store.clone()).build().is_err());
        assert!(JobScheduler::builder(mq, store)
            .broker(InMemoryBroker::arc(8))
            .build()
            .is_ok());
    }

    #[test]
    fn lifecycle_errors() {
        let (_store, scheduler) = scheduler();
        assert!(matches!(scheduler.shutdown(), Err(SchedulerError::NotRunning)));
        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyRunning)));
        assert!(scheduler.shutdown().unwrap().completed_in_time);
        assert!(!scheduler.is_running());
    }

    #[test]
    fn create_job_applies_defaults_when_stopped() {
        let (store, scheduler) = scheduler();
        let scope = ScopeId::new();
        let job = scheduler
            .create_job(NewJob::new("ok", "{}").with_scope(scope).exclusive())
            .unwrap();

        assert_eq!(job.category, JobCategory::Executable);
        assert_eq!(job.retries_remaining, 3);
        assert!(job.exclusive);
        let stored = store.get(job.id).unwrap().unwrap();
        assert!(stored.lock_owner.is_none());
    }

    #[test]
    fn cycle_timer_is_stored_with_its_budget() {
        let (_store, scheduler) = scheduler();
        let job = scheduler
            .schedule_timer(NewTimer::new("ok", "{}", "R3/PT1H"), &NoVariables)
            .unwrap();
        assert_eq!(job.category, JobCategory::Timer);
        assert_eq!(job.due_time, Some(t0() + TimeDelta::hours(1)));
        assert_eq!(job.repeat.as_deref(), Some("R3/PT1H"));
        assert_eq!(job.max_iterations, Some(3));
    }

    #[test]
    fn past_date_timer_is_created_executable() {
        let (_store, scheduler) = scheduler();
        let job = scheduler
            .schedule_timer(NewTimer::new("ok", "{}", "2024-01-01T00:00:00Z"), &NoVariables)
            .unwrap();
        assert_eq!(job.category, JobCategory::Executable);
    }

    #[test]
    fn malformed_timers_fail_at_scheduling_time() {
        let (store, scheduler) = scheduler();
        for definition in ["R0/PT1H", "RX/PT1H", "PT", "yesterday"] {
            let err = scheduler
                .schedule_timer(NewTimer::new("ok", "{}", definition), &NoVariables)
                .unwrap_err();
            assert!(matches!(err, SchedulerError::Config(_)), "{definition}: {err}");
        }

        let vars: HashMap<String, ExpressionValue> =
            [("end".to_string(), ExpressionValue::Bool(true))].into();
        let err = scheduler
            .schedule_timer(
                NewTimer::new("ok", "{}", "R/PT1H").with_end_date(EndDateSpec::literal("${end}")),
                &vars,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Config(ConfigError::UnsupportedEndDateType { .. })
        ));

        let err = scheduler
            .schedule_timer(
                NewTimer::new("ok", "{}", "R/PT1H")
                    .with_end_date(EndDateSpec::literal("2024-03-01T12:30:00Z")),
                &NoVariables,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Config(ConfigError::EndsBeforeFirstFire { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn explicit_and_embedded_end_dates_take_the_earlier() {
        let (_store, scheduler) = scheduler();
        let job = scheduler
            .schedule_timer(
                NewTimer::new("ok", "{}", "R/PT1H/2024-03-02T00:00:00Z")
                    .with_end_date(EndDateSpec::literal("2024-03-01T18:00:00Z")),
                &NoVariables,
            )
            .unwrap();
        assert_eq!(job.end_date, Some(Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap()));
    }

    #[test]
    fn suspend_resume_and_locked_guard() {
        let (store, scheduler) = scheduler();
        let job = scheduler
            .schedule_timer(NewTimer::new("ok", "{}", "PT5M"), &NoVariables)
            .unwrap();

        let suspended = scheduler.suspend_job(job.id).unwrap();
        assert_eq!(suspended.category, JobCategory::Suspended);
        assert!(matches!(
            scheduler.suspend_job(job.id),
            Err(SchedulerError::InvalidState { actual: JobCategory::Suspended, .. })
        ));
        let resumed = scheduler.resume_job(job.id).unwrap();
        assert_eq!(resumed.category, JobCategory::Timer);

        store
            .try_lock(job.id, "node-b", TimeDelta::minutes(5), t0())
            .unwrap();
        assert!(matches!(
            scheduler.suspend_job(job.id),
            Err(SchedulerError::JobLocked(_))
        ));
    }

    #[test]
    fn dead_letter_administration() {
        let (store, scheduler) = scheduler();
        let mut job = store.insert(Job::executable("ok", "", t0()).with_retries(1)).unwrap();
        let expected = job.version;
        job.record_failure("boom", None, t0());
        store.update(&job, expected).unwrap();

        assert_eq!(scheduler.list_dead_letters(10).unwrap().len(), 1);
        let retried = scheduler.retry_dead_letter(job.id, Some(5)).unwrap();
        assert_eq!(retried.category, JobCategory::Executable);
        assert_eq!(retried.retries_remaining, 5);
        assert!(matches!(
            scheduler.delete_dead_letter(job.id),
            Err(SchedulerError::InvalidState { .. })
        ));

        let mut other = store.insert(Job::executable("ok", "", t0()).with_retries(0)).unwrap();
        let expected = other.version;
        other.record_failure("boom", None, t0());
        store.update(&other, expected).unwrap();
        scheduler.delete_dead_letter(other.id).unwrap();
        assert!(matches!(
            scheduler.get_job(other.id),
            Err(SchedulerError::JobNotFound(_))
        ));
    }

    #[test]
    fn find_job_parses_ids() {
        let (_store, scheduler) = scheduler();
        let job = scheduler.create_job(NewJob::new("ok", "")).unwrap();
        assert_eq!(scheduler.find_job(&job.id.to_string()).unwrap().id, job.id);
        assert!(matches!(
            scheduler.find_job("not-a-uuid"),
            Err(SchedulerError::Domain(_))
        ));
    }

    #[test]
    fn scope_cascade_respects_scope_lock() {
        let store = InMemoryJobStore::arc();
        let scope_locks = InMemoryScopeLocks::arc();
        let scheduler = JobScheduler::builder(
            SchedulerConfig::default().with_lock_owner("node-a"),
            store.clone(),
        )
        .clock(ManualClock::arc(t0()))
        .scope_locks(scope_locks.clone())
        .build()
        .unwrap();

        let scope = ScopeId::new();
        scheduler.create_job(NewJob::new("ok", "").with_scope(scope)).unwrap();
        scheduler
            .schedule_timer(NewTimer::new("ok", "", "PT1H").with_scope(scope), &NoVariables)
            .unwrap();

        scope_locks
            .extend_scope_lock(scope, "node-b", TimeDelta::minutes(5), t0())
            .unwrap();
        assert!(matches!(
            scheduler.delete_scope_jobs(scope),
            Err(SchedulerError::ScopeLocked(_))
        ));
        scope_locks.clear_scope_lock(scope, "node-b").unwrap();

        // An exclusive job running on this very node blocks the cascade too.
        let running = job_scope_holder("node-a", JobId::new());
        scope_locks
            .extend_scope_lock(scope, &running, TimeDelta::minutes(5), t0())
            .unwrap();
        assert!(matches!(
            scheduler.delete_scope_jobs(scope),
            Err(SchedulerError::ScopeLocked(_))
        ));
        assert_eq!(store.len(), 2);
        scope_locks.clear_scope_lock(scope, &running).unwrap();

        assert_eq!(scheduler.delete_scope_jobs(scope).unwrap(), 2);
        assert!(store.is_empty());
        assert_eq!(scope_locks.scope_lock_owner(scope, t0()).unwrap(), None);
    }
}
