//! Workflow-level error types.

use super::CallError;
use thiserror::Error;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors surfaced by the registry and the workflow engine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("overloaded: {active} active workflows (limit {limit})")]
    Overloaded { active: usize, limit: usize },
    #[error("deadlock detected; blocked steps: {}", .blocked.join(", "))]
    Deadlock { blocked: Vec<String> },
    #[error("workflow {workflow_id} cancelled: {reason}")]
    Cancelled { workflow_id: String, reason: String },
    #[error("step '{step}' failed: {error}")]
    StepFailed { step: String, error: String },
    #[error("registry error: {0}")]
    Registry(String),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for OrchestratorError {
    fn from(value: std::io::Error) -> Self {
        OrchestratorError::Registry(value.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(value: serde_json::Error) -> Self {
        OrchestratorError::Validation(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_blocked_steps() {
        let err = OrchestratorError::Deadlock {
            blocked: vec!["b".into(), "c".into()],
        };
        assert_eq!(err.to_string(), "deadlock detected; blocked steps: b, c");
    }

    #[test]
    fn call_error_is_transparent() {
        let err: OrchestratorError = CallError::PoolShutdown.into();
        assert_eq!(err.to_string(), "connection pool shut down");
    }
}
