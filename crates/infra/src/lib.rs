//! Durable adapters for the job scheduler: Postgres storage and an optional
//! Redis broker for message-queue mode.

pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis_broker;

pub use postgres::{PostgresJobStore, PostgresScopeLocks};

#[cfg(feature = "redis")]
pub use redis_broker::RedisJobBroker;
