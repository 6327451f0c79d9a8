//! Built-in handlers delegating to the process engine.
//!
//! The scheduler does not know what an activity is; these handlers decode the
//! job's JSON configuration and call the matching [`ProcessEngine`] operation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use jobforge_core::ScopeId;

use crate::handler::{ExecutionError, HandlerRegistry, JobContext, JobHandler};

pub const ASYNC_CONTINUATION: &str = "async-continuation";
pub const TRIGGER_TIMER: &str = "trigger-timer";
pub const TIMER_START_EVENT: &str = "timer-start-event";
pub const SUSPEND_PROCESS_DEFINITION: &str = "suspend-process-definition";
pub const ACTIVATE_PROCESS_DEFINITION: &str = "activate-process-definition";
pub const EVENT: &str = "event";

/// Operations the built-in handlers need from the process engine.
pub trait ProcessEngine: Send + Sync {
    /// Continue an execution past an asynchronous boundary.
    fn continue_execution(&self, scope_id: ScopeId, activity_id: &str) -> Result<(), ExecutionError>;

    /// Fire a timer attached to an activity.
    fn trigger_timer(&self, scope_id: ScopeId, activity_id: &str) -> Result<(), ExecutionError>;

    /// Start a new instance from a timer start event.
    fn start_process_by_timer(&self, process_definition_id: &str) -> Result<(), ExecutionError>;

    fn set_process_definition_suspended(
        &self,
        process_definition_id: &str,
        suspended: bool,
        include_process_instances: bool,
    ) -> Result<(), ExecutionError>;

    /// Deliver an event to a waiting execution.
    fn deliver_event(
        &self,
        scope_id: Option<ScopeId>,
        event_name: &str,
        payload: &serde_json::Value,
    ) -> Result<(), ExecutionError>;
}

pub type SharedEngine = Arc<dyn ProcessEngine>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityConfig {
    pub activity_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerStartConfig {
    pub process_definition_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinitionConfig {
    pub process_definition_id: String,
    #[serde(default)]
    pub include_process_instances: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    pub event_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn required_scope(ctx: &JobContext<'_>) -> Result<ScopeId, ExecutionError> {
    ctx.scope_id().ok_or_else(|| {
        ExecutionError::invalid_configuration(format!(
            "{} job {} has no owning scope",
            ctx.job.handler_type, ctx.job.id
        ))
    })
}

#[derive(Clone)]
pub struct AsyncContinuationHandler {
    engine: SharedEngine,
}

impl JobHandler for AsyncContinuationHandler {
    fn handler_type(&self) -> &str {
        ASYNC_CONTINUATION
    }

    fn execute(&self, ctx: &JobContext<'_>) -> Result<(), ExecutionError> {
        let config: ActivityConfig = ctx.decode()?;
        self.engine
            .continue_execution(required_scope(ctx)?, &config.activity_id)
    }
}

#[derive(Clone)]
pub struct TriggerTimerHandler {
    engine: SharedEngine,
}

impl JobHandler for TriggerTimerHandler {
    fn handler_type(&self) -> &str {
        TRIGGER_TIMER
    }

    fn execute(&self, ctx: &JobContext<'_>) -> Result<(), ExecutionError> {
        let config: ActivityConfig = ctx.decode()?;
        self.engine
            .trigger_timer(required_scope(ctx)?, &config.activity_id)
    }
}

#[derive(Clone)]
pub struct TimerStartEventHandler {
    engine: SharedEngine,
}

impl JobHandler for TimerStartEventHandler {
    fn handler_type(&self) -> &str {
        TIMER_START_EVENT
    }

    fn execute(&self, ctx: &JobContext<'_>) -> Result<(), ExecutionError> {
        let config: TimerStartConfig = ctx.decode()?;
        self.engine
            .start_process_by_timer(&config.process_definition_id)
    }
}

/// Suspends or activates a process definition when its timer fires.
#[derive(Clone)]
pub struct ProcessDefinitionStateHandler {
    engine: SharedEngine,
    suspend: bool,
}

impl JobHandler for ProcessDefinitionStateHandler {
    fn handler_type(&self) -> &str {
        if self.suspend {
            SUSPEND_PROCESS_DEFINITION
        } else {
            ACTIVATE_PROCESS_DEFINITION
        }
    }

    fn execute(&self, ctx: &JobContext<'_>) -> Result<(), ExecutionError> {
        let config: ProcessDefinitionConfig = ctx.decode()?;
        self.engine.set_process_definition_suspended(
            &config.process_definition_id,
            self.suspend,
            config.include_process_instances,
        )
    }
}

#[derive(Clone)]
pub struct EventHandler {
    engine: SharedEngine,
}

impl JobHandler for EventHandler {
    fn handler_type(&self) -> &str {
        EVENT
    }

    fn execute(&self, ctx: &JobContext<'_>) -> Result<(), ExecutionError> {
        let config: EventConfig = ctx.decode()?;
        self.engine
            .deliver_event(ctx.scope_id(), &config.event_name, &config.payload)
    }
}

/// Register every built-in handler against `engine`.
pub fn register_builtin_handlers(registry: &mut HandlerRegistry, engine: SharedEngine) {
    registry.register(AsyncContinuationHandler {
        engine: Arc::clone(&engine),
    });
    registry.register(TriggerTimerHandler {
        engine: Arc::clone(&engine),
    });
    registry.register(TimerStartEventHandler {
        engine: Arc::clone(&engine),
    });
    registry.register(ProcessDefinitionStateHandler {
        engine: Arc::clone(&engine),
        suspend: true,
    });
    registry.register(ProcessDefinitionStateHandler {
        engine: Arc::clone(&engine),
        suspend: false,
    });
    registry.register(EventHandler { engine });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Job;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEngine {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingEngine {
        fn record(&self, call: String) -> Result<(), ExecutionError> {
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    impl ProcessEngine for RecordingEngine {
        fn continue_execution(&self, _scope: ScopeId, activity_id: &str) -> Result<(), ExecutionError> {
            self.record(format!("continue:{activity_id}"))
        }

        fn trigger_timer(&self, _scope: ScopeId, activity_id: &str) -> Result<(), ExecutionError> {
            self.record(format!("timer:{activity_id}"))
        }

        fn start_process_by_timer(&self, definition: &str) -> Result<(), ExecutionError> {
            self.record(format!("start:{definition}"))
        }

        fn set_process_definition_suspended(
            &self,
            definition: &str,
            suspended: bool,
            include_instances: bool,
        ) -> Result<(), ExecutionError> {
            self.record(format!("suspended:{definition}:{suspended}:{include_instances}"))
        }

        fn deliver_event(
            &self,
            _scope: Option<ScopeId>,
            event_name: &str,
            payload: &serde_json::Value,
        ) -> Result<(), ExecutionError> {
            self.record(format!("event:{event_name}:{payload}"))
        }
    }

    fn run(registry: &HandlerRegistry, job: &Job) -> Result<(), ExecutionError> {
        let ctx = JobContext::new(job, "node-a", Utc::now());
        registry.get(&job.handler_type).unwrap().execute(&ctx)
    }

    #[test]
    fn builtins_delegate_to_the_engine() {
        let engine = Arc::new(RecordingEngine::default());
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry, engine.clone());
        assert_eq!(registry.registered_types().len(), 6);

        let scope = ScopeId::new();
        let now = Utc::now();
        let jobs = [
            Job::executable(ASYNC_CONTINUATION, r#"{"activity_id":"review"}"#, now).with_scope(scope),
            Job::executable(TRIGGER_TIMER, r#"{"activity_id":"reminder"}"#, now).with_scope(scope),
            Job::executable(TIMER_START_EVENT, r#"{"process_definition_id":"billing:3"}"#, now),
            Job::executable(
                SUSPEND_PROCESS_DEFINITION,
                r#"{"process_definition_id":"billing:3","include_process_instances":true}"#,
                now,
            ),
            Job::executable(ACTIVATE_PROCESS_DEFINITION, r#"{"process_definition_id":"billing:3"}"#, now),
            Job::executable(EVENT, r#"{"event_name":"paid","payload":{"amount":5}}"#, now),
        ];
        for job in &jobs {
            run(&registry, job).unwrap();
        }

        assert_eq!(
            *engine.calls.lock().unwrap(),
            vec![
                "continue:review",
                "timer:reminder",
                "start:billing:3",
                "suspended:billing:3:true:true",
                "suspended:billing:3:false:false",
                r#"event:paid:{"amount":5}"#,
            ]
        );
    }

    #[test]
    fn bad_configuration_and_missing_scope_are_rejected() {
        let engine = Arc::new(RecordingEngine::default());
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry, engine);

        let now = Utc::now();
        let garbled = Job::executable(ASYNC_CONTINUATION, "{", now).with_scope(ScopeId::new());
        assert!(matches!(
            run(&registry, &garbled),
            Err(ExecutionError::InvalidConfiguration(_))
        ));

        let unscoped = Job::executable(TRIGGER_TIMER, r#"{"activity_id":"x"}"#, now);
        assert!(matches!(
            run(&registry, &unscoped),
            Err(ExecutionError::InvalidConfiguration(_))
        ));
    }
}
