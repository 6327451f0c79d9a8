//! Job handler registry and exception-handler chain.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use jobforge_core::ScopeId;

use crate::store::JobStore;
use crate::types::Job;

/// Why a handler invocation did not succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("no handler registered for job type '{0}'")]
    MissingHandler(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("invalid handler configuration: {0}")]
    InvalidConfiguration(String),
}

impl ExecutionError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::Panicked(panic_message(payload))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Everything a handler may look at while running a job.
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    pub job: &'a Job,
    /// Owner holding the job's lease.
    pub owner: &'a str,
    pub now: DateTime<Utc>,
}

impl<'a> JobContext<'a> {
    pub fn new(job: &'a Job, owner: &'a str, now: DateTime<Utc>) -> Self {
        Self { job, owner, now }
    }

    pub fn configuration(&self) -> &'a str {
        &self.job.handler_configuration
    }

    pub fn scope_id(&self) -> Option<ScopeId> {
        self.job.scope_id
    }

    /// Decode the handler configuration as JSON.
    pub fn decode<T>(&self) -> Result<T, ExecutionError>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_str(self.configuration())
            .map_err(|e| ExecutionError::invalid_configuration(e.to_string()))
    }
}

/// Executes jobs of one handler type.
pub trait JobHandler: Send + Sync {
    fn handler_type(&self) -> &str;

    fn execute(&self, ctx: &JobContext<'_>) -> Result<(), ExecutionError>;
}

/// Handler backed by a closure.
pub struct FnHandler<F> {
    handler_type: String,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&JobContext<'_>) -> Result<(), ExecutionError> + Send + Sync,
{
    pub fn new(handler_type: impl Into<String>, f: F) -> Self {
        Self {
            handler_type: handler_type.into(),
            f,
        }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&JobContext<'_>) -> Result<(), ExecutionError> + Send + Sync,
{
    fn handler_type(&self) -> &str {
        &self.handler_type
    }

    fn execute(&self, ctx: &JobContext<'_>) -> Result<(), ExecutionError> {
        (self.f)(ctx)
    }
}

/// Handlers keyed by handler type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register<H>(&mut self, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers
            .insert(handler.handler_type().to_string(), Arc::new(handler));
    }

    pub fn register_fn<F>(&mut self, handler_type: impl Into<String>, f: F)
    where
        F: Fn(&JobContext<'_>) -> Result<(), ExecutionError> + Send + Sync + 'static,
    {
        self.register(FnHandler::new(handler_type, f));
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(handler_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Gets a look at a failure before the retry ladder does.
///
/// Returning `true` claims the failure: the runner then leaves the job as the
/// handler left it in the store.
pub trait ExceptionHandler: Send + Sync {
    fn handle(&self, job: &Job, error: &ExecutionError, store: &dyn JobStore) -> bool;
}

impl<F> ExceptionHandler for F
where
    F: Fn(&Job, &ExecutionError, &dyn JobStore) -> bool + Send + Sync,
{
    fn handle(&self, job: &Job, error: &ExecutionError, store: &dyn JobStore) -> bool {
        self(job, error, store)
    }
}

/// Ordered exception handlers; the first claim wins.
#[derive(Clone, Default)]
pub struct ExceptionHandlerChain {
    handlers: Vec<Arc<dyn ExceptionHandler>>,
}

impl std::fmt::Debug for ExceptionHandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionHandlerChain")
            .field("len", &self.handlers.len())
            .finish()
    }
}

impl ExceptionHandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<H>(&mut self, handler: H)
    where
        H: ExceptionHandler + 'static,
    {
        self.handlers.push(Arc::new(handler));
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Offer the failure to each handler in order.
    pub fn handle(&self, job: &Job, error: &ExecutionError, store: &dyn JobStore) -> bool {
        for (position, handler) in self.handlers.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(job, error, store))) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(payload) => {
                    warn!(
                        job_id = %job.id,
                        position,
                        panic = %panic_message(payload.as_ref()),
                        "exception handler panicked"
                    );
                }
            }
        }
        false
    }
}
