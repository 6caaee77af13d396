//! Typed failure categories for the task runtime.
//!
//! Orchestration code returns `anyhow::Result`; these variants are wrapped in
//! the `anyhow::Error` so callers that need to branch on a category can
//! `downcast_ref::<RuntimeError>()`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("task '{0}' not found")]
    TaskNotFound(String),

    /// Invalid transition or action for the task's current state.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("path policy violation: {}", paths.join(", "))]
    PathPolicyViolation { paths: Vec<String> },

    /// The agent or test invocation itself errored (spawn failure, non-zero
    /// agent exit), as opposed to reporting a failure through its output.
    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    #[error("merge preflight failed: {0}")]
    MergePreflight(String),

    #[error("merge apply failed: {0}")]
    MergeApply(String),

    #[error("decision token rejected: {0}")]
    DecisionTokenInvalid(String),

    #[error("actor '{0}' is not allowed to control tasks")]
    Unauthorized(String),
}

impl RuntimeError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        RuntimeError::Precondition(msg.into())
    }

    pub fn token(msg: impl Into<String>) -> Self {
        RuntimeError::DecisionTokenInvalid(msg.into())
    }

    /// True for requests refused without mutating anything.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RuntimeError::TaskNotFound(_)
                | RuntimeError::Precondition(_)
                | RuntimeError::DecisionTokenInvalid(_)
                | RuntimeError::Unauthorized(_)
        )
    }
}

/// Find a [`RuntimeError`] anywhere in an error chain.
pub fn runtime_error(err: &anyhow::Error) -> Option<&RuntimeError> {
    err.chain().find_map(|cause| cause.downcast_ref::<RuntimeError>())
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn finds_runtime_error_behind_context() {
        let err: anyhow::Result<()> =
            Err(RuntimeError::token("expired")).context("consume decision");
        let err = err.unwrap_err();
        let found = runtime_error(&err).expect("runtime error in chain");
        assert_eq!(found, &RuntimeError::token("expired"));
        assert!(found.is_rejection());
    }

    #[test]
    fn path_violation_lists_paths() {
        let err = RuntimeError::PathPolicyViolation {
            paths: vec![".env".to_string(), "config.yaml".to_string()],
        };
        assert_eq!(err.to_string(), "path policy violation: .env, config.yaml");
    }
}
