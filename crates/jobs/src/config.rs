//! Scheduler configuration and retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::types::DEFAULT_RETRIES;

/// How the wait between retries grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Every retry waits `base_delay`.
    Fixed,
    /// The wait doubles with each failure, starting at `base_delay`.
    #[default]
    Exponential,
    /// The wait grows by `base_delay` with each failure.
    Linear,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(ConfigError::invalid(format!("unknown backoff strategy '{other}'"))),
        }
    }
}

/// Delay applied to a failed job before it becomes due again.
///
/// How many attempts a job gets is the job's own `retries_remaining`; the
/// policy only shapes the wait between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction of the delay by which a retry may be moved earlier or later.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Failed jobs are due again immediately.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Wait before retrying after the `attempt`-th failure, counting from 1.
    /// Attempt 0 never waits. Growth stops at `max_delay`; `Fixed` ignores it.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(doublings) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let grown = match self.strategy {
            BackoffStrategy::Fixed => return self.spread(self.base_delay, attempt),
            BackoffStrategy::Linear => self.base_delay.checked_mul(attempt),
            BackoffStrategy::Exponential => 2u32
                .checked_pow(doublings)
                .and_then(|factor| self.base_delay.checked_mul(factor)),
        };
        let capped = grown.map_or(self.max_delay, |delay| delay.min(self.max_delay));
        self.spread(capped, attempt)
    }

    /// Scale `delay` by up to `jitter` either way. The offset depends only on
    /// the attempt number, so the same failure always waits the same time.
    fn spread(&self, delay: Duration, attempt: u32) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let phase = f64::from(attempt.wrapping_mul(37) % 100) / 100.0;
        let factor = 1.0 + jitter * (2.0 * phase - 1.0);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
    }
}

/// Scheduler settings. Built once, validated, then passed to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Identity written into `lock_owner`. Must be unique per node.
    pub lock_owner: String,
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    /// Idle time after which threads above the core size exit.
    pub keep_alive: Duration,
    pub queue_capacity: usize,
    /// Pause before resubmitting when the execution queue is full.
    pub queue_full_wait: Duration,
    pub timer_acquisition_enabled: bool,
    pub async_acquisition_enabled: bool,
    pub max_timer_jobs_per_acquisition: usize,
    pub max_async_jobs_per_acquisition: usize,
    pub default_timer_acquire_wait: Duration,
    pub default_async_acquire_wait: Duration,
    pub timer_lock_lease: Duration,
    pub async_lock_lease: Duration,
    /// Lease on a scope taken by exclusive jobs.
    pub scope_lock_lease: Duration,
    pub reset_expired_enabled: bool,
    pub reset_expired_interval: Duration,
    pub reset_expired_page_size: usize,
    /// Unlocked Executable jobs untouched for longer than this are reset.
    pub reset_expired_max_timeout: Duration,
    /// Hand jobs to a message broker instead of the local pool.
    pub message_queue_mode: bool,
    /// Jobs created while running go straight to this node's pool.
    pub dispatch_on_create: bool,
    /// Retries given to new jobs and to the next cycle of recurring timers.
    pub number_of_retries: u32,
    pub shutdown_wait: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_owner: format!("jobforge-{}", Uuid::now_v7()),
            core_pool_size: 8,
            max_pool_size: 8,
            keep_alive: Duration::from_secs(5),
            queue_capacity: 2048,
            queue_full_wait: Duration::from_secs(1),
            timer_acquisition_enabled: true,
            async_acquisition_enabled: true,
            max_timer_jobs_per_acquisition: 512,
            max_async_jobs_per_acquisition: 512,
            default_timer_acquire_wait: Duration::from_secs(10),
            default_async_acquire_wait: Duration::from_secs(10),
            timer_lock_lease: Duration::from_secs(3600),
            async_lock_lease: Duration::from_secs(3600),
            scope_lock_lease: Duration::from_secs(3600),
            reset_expired_enabled: true,
            reset_expired_interval: Duration::from_secs(60),
            reset_expired_page_size: 3,
            reset_expired_max_timeout: Duration::from_secs(24 * 3600),
            message_queue_mode: false,
            dispatch_on_create: true,
            number_of_retries: DEFAULT_RETRIES,
            shutdown_wait: Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    pub fn with_pool_size(mut self, core: usize, max: usize) -> Self {
        self.core_pool_size = core;
        self.max_pool_size = max;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_queue(mut self, capacity: usize, full_wait: Duration) -> Self {
        self.queue_capacity = capacity;
        self.queue_full_wait = full_wait;
        self
    }

    pub fn with_timer_acquisition(mut self, enabled: bool) -> Self {
        self.timer_acquisition_enabled = enabled;
        self
    }

    pub fn with_async_acquisition(mut self, enabled: bool) -> Self {
        self.async_acquisition_enabled = enabled;
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, timer: usize, async_jobs: usize) -> Self {
        self.max_timer_jobs_per_acquisition = timer;
        self.max_async_jobs_per_acquisition = async_jobs;
        self
    }

    pub fn with_acquire_wait(mut self, timer: Duration, async_jobs: Duration) -> Self {
        self.default_timer_acquire_wait = timer;
        self.default_async_acquire_wait = async_jobs;
        self
    }

    pub fn with_lock_leases(mut self, timer: Duration, async_jobs: Duration) -> Self {
        self.timer_lock_lease = timer;
        self.async_lock_lease = async_jobs;
        self
    }

    pub fn with_scope_lock_lease(mut self, lease: Duration) -> Self {
        self.scope_lock_lease = lease;
        self
    }

    pub fn with_reset_expired(
        mut self,
        enabled: bool,
        interval: Duration,
        page_size: usize,
        max_timeout: Duration,
    ) -> Self {
        self.reset_expired_enabled = enabled;
        self.reset_expired_interval = interval;
        self.reset_expired_page_size = page_size;
        self.reset_expired_max_timeout = max_timeout;
        self
    }

    pub fn with_message_queue_mode(mut self, enabled: bool) -> Self {
        self.message_queue_mode = enabled;
        self
    }

    pub fn with_dispatch_on_create(mut self, enabled: bool) -> Self {
        self.dispatch_on_create = enabled;
        self
    }

    pub fn with_number_of_retries(mut self, retries: u32) -> Self {
        self.number_of_retries = retries;
        self
    }

    pub fn with_shutdown_wait(mut self, wait: Duration) -> Self {
        self.shutdown_wait = wait;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Defaults overridden by `JOBFORGE_*` environment variables.
    ///
    /// Durations are given in milliseconds (`JOBFORGE_QUEUE_FULL_WAIT_MS`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reading from an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let d = Self::default();

        let config = Self {
            lock_owner: env.string("JOBFORGE_LOCK_OWNER").unwrap_or(d.lock_owner),
            core_pool_size: env.parse("JOBFORGE_CORE_POOL_SIZE", d.core_pool_size)?,
            max_pool_size: env.parse("JOBFORGE_MAX_POOL_SIZE", d.max_pool_size)?,
            keep_alive: env.millis("JOBFORGE_KEEP_ALIVE_MS", d.keep_alive)?,
            queue_capacity: env.parse("JOBFORGE_QUEUE_CAPACITY", d.queue_capacity)?,
            queue_full_wait: env.millis("JOBFORGE_QUEUE_FULL_WAIT_MS", d.queue_full_wait)?,
            timer_acquisition_enabled: env
                .parse("JOBFORGE_TIMER_ACQUISITION", d.timer_acquisition_enabled)?,
            async_acquisition_enabled: env
                .parse("JOBFORGE_ASYNC_ACQUISITION", d.async_acquisition_enabled)?,
            max_timer_jobs_per_acquisition: env.parse(
                "JOBFORGE_MAX_TIMER_JOBS_PER_ACQUISITION",
                d.max_timer_jobs_per_acquisition,
            )?,
            max_async_jobs_per_acquisition: env.parse(
                "JOBFORGE_MAX_ASYNC_JOBS_PER_ACQUISITION",
                d.max_async_jobs_per_acquisition,
            )?,
            default_timer_acquire_wait: env
                .millis("JOBFORGE_TIMER_ACQUIRE_WAIT_MS", d.default_timer_acquire_wait)?,
            default_async_acquire_wait: env
                .millis("JOBFORGE_ASYNC_ACQUIRE_WAIT_MS", d.default_async_acquire_wait)?,
            timer_lock_lease: env.millis("JOBFORGE_TIMER_LOCK_LEASE_MS", d.timer_lock_lease)?,
            async_lock_lease: env.millis("JOBFORGE_ASYNC_LOCK_LEASE_MS", d.async_lock_lease)?,
            scope_lock_lease: env.millis("JOBFORGE_SCOPE_LOCK_LEASE_MS", d.scope_lock_lease)?,
            reset_expired_enabled: env
                .parse("JOBFORGE_RESET_EXPIRED_ENABLED", d.reset_expired_enabled)?,
            reset_expired_interval: env
                .millis("JOBFORGE_RESET_EXPIRED_INTERVAL_MS", d.reset_expired_interval)?,
            reset_expired_page_size: env
                .parse("JOBFORGE_RESET_EXPIRED_PAGE_SIZE", d.reset_expired_page_size)?,
            reset_expired_max_timeout: env
                .millis("JOBFORGE_RESET_EXPIRED_MAX_TIMEOUT_MS", d.reset_expired_max_timeout)?,
            message_queue_mode: env.parse("JOBFORGE_MESSAGE_QUEUE_MODE", d.message_queue_mode)?,
            dispatch_on_create: env.parse("JOBFORGE_DISPATCH_ON_CREATE", d.dispatch_on_create)?,
            number_of_retries: env.parse("JOBFORGE_NUMBER_OF_RETRIES", d.number_of_retries)?,
            shutdown_wait: env.millis("JOBFORGE_SHUTDOWN_WAIT_MS", d.shutdown_wait)?,
            retry_policy: RetryPolicy {
                base_delay: env.millis("JOBFORGE_RETRY_BASE_DELAY_MS", d.retry_policy.base_delay)?,
                max_delay: env.millis("JOBFORGE_RETRY_MAX_DELAY_MS", d.retry_policy.max_delay)?,
                strategy: env.parse("JOBFORGE_RETRY_STRATEGY", d.retry_policy.strategy)?,
                jitter: env.parse("JOBFORGE_RETRY_JITTER", d.retry_policy.jitter)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_owner.trim().is_empty() {
            return Err(ConfigError::invalid("lock owner must not be empty"));
        }
        if self.core_pool_size == 0 {
            return Err(ConfigError::invalid("core pool size must be at least 1"));
        }
        if self.max_pool_size < self.core_pool_size {
            return Err(ConfigError::invalid(format!(
                "max pool size {} is below core pool size {}",
                self.max_pool_size, self.core_pool_size
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue capacity must be at least 1"));
        }
        if self.max_timer_jobs_per_acquisition == 0 || self.max_async_jobs_per_acquisition == 0 {
            return Err(ConfigError::invalid("jobs per acquisition must be at least 1"));
        }
        if self.timer_lock_lease.is_zero()
            || self.async_lock_lease.is_zero()
            || self.scope_lock_lease.is_zero()
        {
            return Err(ConfigError::invalid("lock leases must be positive"));
        }
        if self.reset_expired_enabled {
            if self.reset_expired_page_size == 0 {
                return Err(ConfigError::invalid("reset-expired page size must be at least 1"));
            }
            if self.reset_expired_interval.is_zero() {
                return Err(ConfigError::invalid("reset-expired interval must be positive"));
            }
        }
        if !(0.0..=1.0).contains(&self.retry_policy.jitter) {
            return Err(ConfigError::invalid("retry jitter must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(format!("{key}: cannot parse '{raw}'"))),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let ms: u64 = self.parse(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }
}
