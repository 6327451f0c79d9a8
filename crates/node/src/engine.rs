//! Process engine stand-in for a standalone node: every callback is logged.

use jobforge_core::ScopeId;
use jobforge_jobs::builtin::ProcessEngine;
use jobforge_jobs::ExecutionError;
use tracing::info;

#[derive(Debug, Default)]
pub struct LoggingEngine;

impl ProcessEngine for LoggingEngine {
    fn continue_execution(&self, scope_id: ScopeId, activity_id: &str) -> Result<(), ExecutionError> {
        info!(scope_id = %scope_id, activity_id, "continue execution");
        Ok(())
    }

    fn trigger_timer(&self, scope_id: ScopeId, activity_id: &str) -> Result<(), ExecutionError> {
        info!(scope_id = %scope_id, activity_id, "timer fired");
        Ok(())
    }

    fn start_process_by_timer(&self, process_definition_id: &str) -> Result<(), ExecutionError> {
        info!(process_definition_id, "start process by timer");
        Ok(())
    }

    fn set_process_definition_suspended(
        &self,
        process_definition_id: &str,
        suspended: bool,
        include_process_instances: bool,
    ) -> Result<(), ExecutionError> {
        info!(
            process_definition_id,
            suspended, include_process_instances, "process definition state changed"
        );
        Ok(())
    }

    fn deliver_event(
        &self,
        scope_id: Option<ScopeId>,
        event_name: &str,
        payload: &serde_json::Value,
    ) -> Result<(), ExecutionError> {
        info!(scope_id = ?scope_id, event_name, payload = %payload, "event delivered");
        Ok(())
    }
}
