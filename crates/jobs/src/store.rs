//! Job storage abstraction and the in-memory implementation.
//!
//! Every mutation bumps `version`; writers state which version they read and
//! lose with [`StoreError::StaleVersion`] when someone else wrote first. This
//! compare-and-set is the only coordination between nodes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use jobforge_core::{DomainError, ExpectedVersion, JobId, ScopeId};

use crate::types::{Job, JobCategory};

/// Outcome of a lock attempt. Contention is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockResult {
    pub acquired: bool,
    pub current_version: u64,
}

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Persist a new job. The stored copy starts at version 1.
    fn insert(&self, job: Job) -> Result<Job, StoreError>;

    fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Up to `limit` unlocked jobs of `category` with `due_time <= now`,
    /// ordered by `(due_time, id)`. A missing due time sorts first.
    fn find_due(
        &self,
        category: JobCategory,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Take the lease if nobody holds a live one.
    fn try_lock(
        &self,
        id: JobId,
        owner: &str,
        lease: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<LockResult, StoreError>;

    /// Clear the lease if `owner` holds it at `expected_version`.
    fn release(
        &self,
        id: JobId,
        owner: &str,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Push the lease expiration out. Returns the new version when `owner`
    /// still holds the lease.
    fn extend_lock(
        &self,
        id: JobId,
        owner: &str,
        lease: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, StoreError>;

    /// Replace the job if the stored version is `expected_version`.
    fn update(&self, job: &Job, expected_version: u64) -> Result<u64, StoreError>;

    /// Remove the job. `Ok(false)` when it is already gone.
    fn delete(&self, id: JobId, expected: ExpectedVersion) -> Result<bool, StoreError>;

    /// Delete a finished timer cycle and insert its successor in one step.
    /// `Ok(None)` when the current job is already gone; nothing is written
    /// unless both halves succeed.
    fn replace_with_next_cycle(
        &self,
        id: JobId,
        expected_version: u64,
        next: Job,
    ) -> Result<Option<Job>, StoreError>;

    /// Jobs whose lease expired before `now`, oldest expiration first.
    fn find_expired_locks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Locked jobs that will never lapse on their own: an owner without an
    /// expiration, or a lock last taken or extended before `cutoff`.
    fn find_stuck_locks(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Force-clear the lease. `Ok(false)` when the version moved on.
    fn reset_lock(
        &self,
        id: JobId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Jobs matching `query`, ordered by `(due_time, id)`.
    fn find(&self, query: &JobQuery, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Cascade delete of every job owned by a scope.
    fn delete_by_scope(&self, scope_id: ScopeId) -> Result<usize, StoreError>;

    fn stats(&self) -> Result<JobStats, StoreError>;
}

/// Shared handle to a store.
pub type SharedStore = Arc<dyn JobStore>;

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("stale version for job {id}: expected {expected}, found {found}")]
    StaleVersion { id: JobId, expected: u64, found: u64 },
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Filter for administrative listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub category: Option<JobCategory>,
    pub scope_id: Option<ScopeId>,
    pub handler_type: Option<String>,
    pub tenant_id: Option<String>,
    /// Match only jobs with (`true`) or without (`false`) an owner.
    pub locked: Option<bool>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: JobCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn scope(mut self, scope_id: ScopeId) -> Self {
        self.scope_id = Some(scope_id);
        self
    }

    pub fn handler_type(mut self, handler_type: impl Into<String>) -> Self {
        self.handler_type = Some(handler_type.into());
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn locked(mut self, locked: bool) -> Self {
        self.locked = Some(locked);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.category.is_none_or(|c| job.category == c)
            && self.scope_id.is_none_or(|s| job.scope_id == Some(s))
            && self
                .handler_type
                .as_deref()
                .is_none_or(|h| job.handler_type == h)
            && self
                .tenant_id
                .as_deref()
                .is_none_or(|t| job.tenant_id.as_deref() == Some(t))
            && self.locked.is_none_or(|l| job.lock_owner.is_some() == l)
    }
}

/// Job counts by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub timer: usize,
    pub executable: usize,
    pub suspended: usize,
    pub dead_letter: usize,
    pub locked: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.timer + self.executable + self.suspended + self.dead_letter
    }

    pub fn record(&mut self, job: &Job) {
        match job.category {
            JobCategory::Timer => self.timer += 1,
            JobCategory::Executable => self.executable += 1,
            JobCategory::Suspended => self.suspended += 1,
            JobCategory::DeadLetter => self.dead_letter += 1,
        }
        if job.lock_owner.is_some() {
            self.locked += 1;
        }
    }
}

/// Acquisition order: due time (missing first), then id.
pub fn due_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    let key = |j: &Job| (j.due_time.unwrap_or(DateTime::<Utc>::MIN_UTC), j.id);
    key(a).cmp(&key(b))
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .read()
            .map_err(|_| StoreError::storage("job map lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .write()
            .map_err(|_| StoreError::storage("job map lock poisoned"))
    }

    fn select<F>(&self, limit: usize, filter: F) -> Result<Vec<Job>, StoreError>
    where
        F: Fn(&Job) -> bool,
    {
        let jobs = self.read()?;
        let mut out: Vec<Job> = jobs.values().filter(|j| filter(j)).cloned().collect();
        out.sort_by(due_order);
        out.truncate(limit);
        Ok(out)
    }
}

fn bump(job: &mut Job, now: DateTime<Utc>) -> u64 {
    job.version += 1;
    job.updated_at = now;
    job.version
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, mut job: Job) -> Result<Job, StoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        job.version = 1;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn find_due(
        &self,
        category: JobCategory,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.select(limit, |j| {
            j.category == category && j.is_due_at(now) && j.is_lockable_at(now)
        })
    }

    fn try_lock(
        &self,
        id: JobId,
        owner: &str,
        lease: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<LockResult, StoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if !job.is_lockable_at(now) {
            return Ok(LockResult {
                acquired: false,
                current_version: job.version,
            });
        }

        job.lock_owner = Some(owner.to_string());
        job.lock_expiration_time = Some(now + lease);
        let version = bump(job, now);
        Ok(LockResult {
            acquired: true,
            current_version: version,
        })
    }

    fn release(
        &self,
        id: JobId,
        owner: &str,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.version != expected_version || job.lock_owner.as_deref() != Some(owner) {
            return Ok(false);
        }
        job.clear_lock();
        bump(job, now);
        Ok(true)
    }

    fn extend_lock(
        &self,
        id: JobId,
        owner: &str,
        lease: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, StoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.lock_owner.as_deref() != Some(owner) {
            return Ok(None);
        }
        job.lock_expiration_time = Some(now + lease);
        Ok(Some(bump(job, now)))
    }

    fn update(&self, job: &Job, expected_version: u64) -> Result<u64, StoreError> {
        let mut jobs = self.write()?;
        let stored = jobs.get_mut(&job.id).ok_or(StoreError::NotFound(job.id))?;
        if stored.version != expected_version {
            return Err(StoreError::StaleVersion {
                id: job.id,
                expected: expected_version,
                found: stored.version,
            });
        }
        *stored = job.clone();
        stored.version = expected_version + 1;
        Ok(stored.version)
    }

    fn delete(&self, id: JobId, expected: ExpectedVersion) -> Result<bool, StoreError> {
        let mut jobs = self.write()?;
        let Some(stored) = jobs.get(&id) else {
            return Ok(false);
        };
        if let Err(DomainError::VersionConflict { expected, actual }) = expected.check(stored.version) {
            return Err(StoreError::StaleVersion {
                id,
                expected,
                found: actual,
            });
        }
        jobs.remove(&id);
        Ok(true)
    }

    fn replace_with_next_cycle(
        &self,
        id: JobId,
        expected_version: u64,
        mut next: Job,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.write()?;
        let Some(stored) = jobs.get(&id) else {
            return Ok(None);
        };
        if stored.version != expected_version {
            return Err(StoreError::StaleVersion {
                id,
                expected: expected_version,
                found: stored.version,
            });
        }
        if jobs.contains_key(&next.id) {
            return Err(StoreError::AlreadyExists(next.id));
        }
        jobs.remove(&id);
        next.version = 1;
        jobs.insert(next.id, next.clone());
        Ok(Some(next))
    }

    fn find_expired_locks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.read()?;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| j.lock_expiration_time.is_some_and(|exp| exp < now))
            .cloned()
            .collect();
        out.sort_by_key(|j| (j.lock_expiration_time, j.id));
        out.truncate(limit);
        Ok(out)
    }

    fn find_stuck_locks(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.select(limit, |j| {
            j.lock_owner.is_some() && (j.lock_expiration_time.is_none() || j.updated_at < cutoff)
        })
    }

    fn reset_lock(
        &self,
        id: JobId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.version != expected_version {
            return Ok(false);
        }
        job.clear_lock();
        bump(job, now);
        Ok(true)
    }

    fn find(&self, query: &JobQuery, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.select(limit, |j| query.matches(j))
    }

    fn delete_by_scope(&self, scope_id: ScopeId) -> Result<usize, StoreError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, j| j.scope_id != Some(scope_id));
        Ok(before - jobs.len())
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job);
        }
        Ok(stats)
    }
}

// Delegating impl so `Arc<S>` and `Arc<dyn JobStore>` can be passed where a
// store is expected.
impl<T> JobStore for Arc<T>
where
    T: JobStore + ?Sized,
{
    fn insert(&self, job: Job) -> Result<Job, StoreError> {
        (**self).insert(job)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(id)
    }

    fn find_due(
        &self,
        category: JobCategory,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).find_due(category, now, limit)
    }

    fn try_lock(
        &self,
        id: JobId,
        owner: &str,
        lease: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<LockResult, StoreError> {
        (**self).try_lock(id, owner, lease, now)
    }

    fn release(
        &self,
        id: JobId,
        owner: &str,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).release(id, owner, expected_version, now)
    }

    fn extend_lock(
        &self,
        id: JobId,
        owner: &str,
        lease: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, StoreError> {
        (**self).extend_lock(id, owner, lease, now)
    }

    fn update(&self, job: &Job, expected_version: u64) -> Result<u64, StoreError> {
        (**self).update(job, expected_version)
    }

    fn delete(&self, id: JobId, expected: ExpectedVersion) -> Result<bool, StoreError> {
        (**self).delete(id, expected)
    }

    fn replace_with_next_cycle(
        &self,
        id: JobId,
        expected_version: u64,
        next: Job,
    ) -> Result<Option<Job>, StoreError> {
        (**self).replace_with_next_cycle(id, expected_version, next)
    }

    fn find_expired_locks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).find_expired_locks(now, limit)
    }

    fn find_stuck_locks(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).find_stuck_locks(cutoff, limit)
    }

    fn reset_lock(
        &self,
        id: JobId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).reset_lock(id, expected_version, now)
    }

    fn find(&self, query: &JobQuery, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).find(query, limit)
    }

    fn delete_by_scope(&self, scope_id: ScopeId) -> Result<usize, StoreError> {
        (**self).delete_by_scope(scope_id)
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        (**self).stats()
    }
}
