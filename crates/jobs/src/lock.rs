//! Job leases and scope locks.
//!
//! A job lease lets one owner execute a job; the scope lock is a coarser,
//! independent timestamp lock on the process scope that owns the job. Exclusive
//! jobs hold both while they run. Scope locks are held per job run (see
//! [`job_scope_holder`]), not per node, so two exclusive jobs of one node
//! still exclude each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use jobforge_core::{JobId, ScopeId, SharedClock};

use crate::store::{LockResult, SharedStore, StoreError};
use crate::types::Job;

/// Convert a configured lease to a chrono span, capped at 100 years.
pub fn lease_span(lease: Duration) -> TimeDelta {
    TimeDelta::from_std(lease)
        .ok()
        .filter(|span| *span <= TimeDelta::days(36_500))
        .unwrap_or_else(|| TimeDelta::days(36_500))
}

/// Scope lock holder for one run of `job_id` on `owner`.
pub fn job_scope_holder(owner: &str, job_id: JobId) -> String {
    format!("{owner}/{job_id}")
}

/// Leases job records on behalf of one owner.
#[derive(Clone)]
pub struct LockManager {
    store: SharedStore,
    clock: SharedClock,
    owner: String,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    pub fn new(store: SharedStore, clock: SharedClock, owner: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Attempt to lease `id`. A job that vanished counts as contended.
    pub fn try_lock(&self, id: JobId, lease: Duration) -> Result<LockResult, StoreError> {
        let now = self.clock.now();
        match self.store.try_lock(id, &self.owner, lease_span(lease), now) {
            Err(StoreError::NotFound(_)) => Ok(LockResult {
                acquired: false,
                current_version: 0,
            }),
            other => other,
        }
    }

    /// Lease `job` and bring the local copy in line with the stored one.
    pub fn lock_job(&self, job: &mut Job, lease: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let span = lease_span(lease);
        let result = match self.store.try_lock(job.id, &self.owner, span, now) {
            Err(StoreError::NotFound(_)) => return Ok(false),
            other => other?,
        };
        if result.acquired {
            job.lock_owner = Some(self.owner.clone());
            job.lock_expiration_time = Some(now + span);
            job.version = result.current_version;
            job.updated_at = now;
        }
        Ok(result.acquired)
    }

    /// Give the lease back. A stale version leaves the record untouched.
    pub fn release(&self, id: JobId, expected_version: u64) -> Result<bool, StoreError> {
        let released = self
            .store
            .release(id, &self.owner, expected_version, self.clock.now())?;
        if !released {
            debug!(
                job_id = %id,
                owner = %self.owner,
                expected_version,
                "release skipped, job moved on"
            );
        }
        Ok(released)
    }

    pub fn extend(&self, id: JobId, lease: Duration) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now();
        self.store
            .extend_lock(id, &self.owner, lease_span(lease), now)
    }
}

/// Timestamp lock on a process scope.
///
/// `holder` names one hold. Only the same holder may extend or clear it; any
/// other holder, even from the same node, is refused while the lock is live.
pub trait ScopeLockManager: Send + Sync {
    /// Take or extend the scope lock. `false` when another holder has a live lock.
    fn extend_scope_lock(
        &self,
        scope_id: ScopeId,
        holder: &str,
        lease: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Drop the lock if `holder` holds it.
    fn clear_scope_lock(&self, scope_id: ScopeId, holder: &str) -> Result<bool, StoreError>;

    /// Current holder of a live lock.
    fn scope_lock_owner(
        &self,
        scope_id: ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError>;
}

pub type SharedScopeLocks = Arc<dyn ScopeLockManager>;

impl<T> ScopeLockManager for Arc<T>
where
    T: ScopeLockManager + ?Sized,
{
    fn extend_scope_lock(
        &self,
        scope_id: ScopeId,
        holder: &str,
        lease: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).extend_scope_lock(scope_id, holder, lease, now)
    }

    fn clear_scope_lock(&self, scope_id: ScopeId, holder: &str) -> Result<bool, StoreError> {
        (**self).clear_scope_lock(scope_id, holder)
    }

    fn scope_lock_owner(
        &self,
        scope_id: ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        (**self).scope_lock_owner(scope_id, now)
    }
}

#[derive(Debug, Clone)]
struct ScopeLease {
    holder: String,
    expires: DateTime<Utc>,
}

/// In-memory scope locks for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryScopeLocks {
    locks: Mutex<HashMap<ScopeId, ScopeLease>>,
}

impl InMemoryScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn locks(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ScopeId, ScopeLease>>, StoreError> {
        self.locks
            .lock()
            .map_err(|_| StoreError::storage("scope lock map poisoned"))
    }
}

impl ScopeLockManager for InMemoryScopeLocks {
    fn extend_scope_lock(
        &self,
        scope_id: ScopeId,
        holder: &str,
        lease: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks()?;
        if let Some(held) = locks.get(&scope_id) {
            if held.holder != holder && held.expires > now {
                return Ok(false);
            }
        }
        locks.insert(
            scope_id,
            ScopeLease {
                holder: holder.to_string(),
                expires: now + lease,
            },
        );
        Ok(true)
    }

    fn clear_scope_lock(&self, scope_id: ScopeId, holder: &str) -> Result<bool, StoreError> {
        let mut locks = self.locks()?;
        match locks.get(&scope_id) {
            Some(held) if held.holder == holder => {
                locks.remove(&scope_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn scope_lock_owner(
        &self,
        scope_id: ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .locks()?
            .get(&scope_id)
            .filter(|held| held.expires > now)
            .map(|held| held.holder.clone()))
    }
}
