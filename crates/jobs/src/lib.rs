//! Timer and async job scheduling.
//!
//! Jobs live in a [`JobStore`]. Acquisition loops lock due jobs under a lease
//! and hand them to an execution pool (or a message broker). The runner
//! invokes the registered handler, reschedules recurring timers and applies
//! the retry / dead-letter policy. A reclaimer frees leases of nodes that died.

pub mod acquisition;
pub mod broker;
pub mod builtin;
pub mod calendar;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod handler;
pub mod lock;
pub mod pool;
pub mod reclaimer;
pub mod recurrence;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use broker::{InMemoryBroker, JobMessage, MessageBroker, SharedBroker};
pub use builtin::{register_builtin_handlers, ProcessEngine, SharedEngine};
pub use calendar::{BusinessCalendar, CalendarRegistry, EndDateSpec, ExpressionValue, VariableScope};
pub use config::{BackoffStrategy, RetryPolicy, SchedulerConfig};
pub use error::{ConfigError, SchedulerError};
pub use executor::{ExecutorStats, JobRunner, RunOutcome};
pub use handler::{ExceptionHandler, ExecutionError, HandlerRegistry, JobContext, JobHandler};
pub use lock::{job_scope_holder, InMemoryScopeLocks, LockManager, ScopeLockManager, SharedScopeLocks};
pub use recurrence::{IsoDuration, Recurrence, TimerSpec};
pub use scheduler::{JobScheduler, NewJob, NewTimer, SchedulerBuilder, SchedulerStats, ShutdownReport};
pub use store::{InMemoryJobStore, JobQuery, JobStats, JobStore, LockResult, SharedStore, StoreError};
pub use types::{Job, JobCategory};
