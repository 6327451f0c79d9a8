//! Periodic sweep that frees jobs whose owner went away.

use std::time::Duration;

use tracing::{debug, info, warn};

use jobforge_core::SharedClock;

use crate::error::SchedulerError;
use crate::lock::lease_span;
use crate::store::{SharedStore, StoreError};
use crate::worker::{spawn_worker, WorkerHandle};

#[derive(Debug, Clone)]
pub struct ReclaimerSettings {
    pub interval: Duration,
    pub page_size: usize,
    /// Locks held longer than this without being extended, or held with no
    /// expiration at all, are reset as well.
    pub max_timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_reset: usize,
    pub stuck_reset: usize,
    pub pages: usize,
}

pub struct ExpiredLockReclaimer {
    settings: ReclaimerSettings,
    store: SharedStore,
    clock: SharedClock,
}

impl ExpiredLockReclaimer {
    pub fn new(settings: ReclaimerSettings, store: SharedStore, clock: SharedClock) -> Self {
        Self {
            settings,
            store,
            clock,
        }
    }

    /// Reset every expired lease, then every stuck lock, page by page.
    pub fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let page_size = self.settings.page_size.max(1);
        let mut report = SweepReport::default();

        loop {
            let page = self.store.find_expired_locks(now, page_size)?;
            if page.is_empty() {
                break;
            }
            report.pages += 1;
            let mut reset = 0;
            for job in &page {
                if self.store.reset_lock(job.id, job.version, now)? {
                    debug!(
                        job_id = %job.id,
                        previous_owner = job.lock_owner.as_deref().unwrap_or("-"),
                        "expired lease reset"
                    );
                    reset += 1;
                }
            }
            report.expired_reset += reset;
            if reset == 0 || page.len() < page_size {
                break;
            }
        }

        let cutoff = now - lease_span(self.settings.max_timeout);
        loop {
            let page = self.store.find_stuck_locks(cutoff, page_size)?;
            if page.is_empty() {
                break;
            }
            report.pages += 1;
            let mut reset = 0;
            for job in &page {
                if self.store.reset_lock(job.id, job.version, now)? {
                    debug!(
                        job_id = %job.id,
                        previous_owner = job.lock_owner.as_deref().unwrap_or("-"),
                        "stuck lock reset"
                    );
                    reset += 1;
                }
            }
            report.stuck_reset += reset;
            if reset == 0 || page.len() < page_size {
                break;
            }
        }

        if report.expired_reset + report.stuck_reset > 0 {
            info!(
                expired = report.expired_reset,
                stuck = report.stuck_reset,
                "reclaimed jobs"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until shutdown. Failures are logged and retried
    /// on the next tick.
    pub fn spawn(self) -> Result<WorkerHandle, SchedulerError> {
        spawn_worker("jobforge-reset-expired", move |signal| {
            loop {
                if let Err(err) = self.sweep() {
                    warn!(error = %err, "expired-lock sweep failed, retrying next interval");
                }
                if signal.wait(self.settings.interval) {
                    break;
                }
            }
        })
    }
}
