//! Redis list-backed job broker (optional).
//!
//! Messages are JSON-encoded [`JobMessage`]s pushed with `LPUSH` and popped
//! with `BRPOP`, giving FIFO delivery shared by every consumer of the list.
//! Delivery is at-most-once: a consumer that dies after popping loses the
//! message, and the job is picked up again once its lease expires.

use std::time::Duration;

use redis::Commands;
use tracing::debug;

use jobforge_jobs::broker::{BrokerError, JobMessage, MessageBroker};

/// Default list key.
pub const DEFAULT_QUEUE_KEY: &str = "jobforge:jobs";

/// Shortest blocking pop; `BRPOP` treats 0 as "wait forever".
const MIN_POP_TIMEOUT_SECS: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct RedisJobBroker {
    client: redis::Client,
    queue_key: String,
}

impl RedisJobBroker {
    pub fn new(redis_url: impl AsRef<str>, queue_key: Option<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            queue_key: queue_key.unwrap_or_else(|| DEFAULT_QUEUE_KEY.to_string()),
        })
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.client
            .get_connection()
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }
}

fn encode(message: &JobMessage) -> Result<String, BrokerError> {
    serde_json::to_string(message).map_err(|e| BrokerError::Codec(e.to_string()))
}

fn decode(payload: &str) -> Result<JobMessage, BrokerError> {
    serde_json::from_str(payload).map_err(|e| BrokerError::Codec(e.to_string()))
}

fn pop_timeout(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(MIN_POP_TIMEOUT_SECS)
}

impl MessageBroker for RedisJobBroker {
    fn publish(&self, message: &JobMessage) -> Result<(), BrokerError> {
        let payload = encode(message)?;
        let mut conn = self.connection()?;
        let _: i64 = conn
            .lpush(&self.queue_key, payload)
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        debug!(job_id = %message.job_id, version = message.version, "job message published");
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<JobMessage>, BrokerError> {
        let mut conn = self.connection()?;
        let popped: Option<(String, String)> = conn
            .brpop(&self.queue_key, pop_timeout(timeout))
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        popped.map(|(_, payload)| decode(&payload)).transpose()
    }

    fn pending(&self) -> usize {
        self.connection()
            .and_then(|mut conn| {
                conn.llen(&self.queue_key)
                    .map_err(|e| BrokerError::Transport(e.to_string()))
            })
            .unwrap_or(0)
    }
}
