//! Task invocation boundary.
//!
//! The evaluator never performs business logic itself. Every Task state is
//! dispatched through a [`TaskInvoker`], which infra implements against the
//! real backend (HTTP) or a simulated one. Tests substitute scripted fakes.

pub mod circuit;

use futures_util::future::BoxFuture;
use serde_json::Value;

use complyflow_types::workflow::InvocationMode;

/// Reserved error class names used for Retry/Catch matching.
pub mod error_class {
    /// Wildcard: matches every class except `States.Runtime` and the fatal ones.
    pub const ALL: &str = "States.ALL";
    /// The handler ran and reported a failure without a more specific class.
    pub const TASK_FAILED: &str = "States.TaskFailed";
    /// A task or execution exceeded its time bound.
    pub const TIMEOUT: &str = "States.Timeout";
    /// The backend could not be reached or answered with a server error.
    pub const BACKEND_UNAVAILABLE: &str = "States.BackendUnavailable";
    /// Dispatch refused because the resource's circuit is open.
    pub const CIRCUIT_OPEN: &str = "States.CircuitOpen";
    /// Engine-side failure: bad path, non-array items, depth exceeded.
    pub const RUNTIME: &str = "States.Runtime";
    /// A Choice state matched no rule and declared no default.
    pub const NO_CHOICE_MATCHED: &str = "States.NoChoiceMatched";
    /// The execution was stopped on request.
    pub const ABORTED: &str = "States.Aborted";

    /// Classes that no Retry or Catch rule can intercept.
    pub fn is_fatal(class: &str) -> bool {
        class == NO_CHOICE_MATCHED || class == ABORTED
    }
}

/// A typed task failure.
///
/// `error_class` drives Retry/Catch matching; `cause` is the human-readable
/// detail surfaced on the execution record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error_class}: {cause}")]
pub struct TaskError {
    pub error_class: String,
    pub cause: String,
}

impl TaskError {
    pub fn new(error_class: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error_class: error_class.into(),
            cause: cause.into(),
        }
    }

    pub fn task_failed(cause: impl Into<String>) -> Self {
        Self::new(error_class::TASK_FAILED, cause)
    }

    pub fn timeout(cause: impl Into<String>) -> Self {
        Self::new(error_class::TIMEOUT, cause)
    }

    pub fn backend_unavailable(cause: impl Into<String>) -> Self {
        Self::new(error_class::BACKEND_UNAVAILABLE, cause)
    }

    pub fn circuit_open(resource: &str) -> Self {
        Self::new(
            error_class::CIRCUIT_OPEN,
            format!("circuit for '{resource}' is open; dispatch refused"),
        )
    }

    pub fn runtime(cause: impl Into<String>) -> Self {
        Self::new(error_class::RUNTIME, cause)
    }

    /// Whether this failure says something about backend health (as opposed
    /// to the task's own logic rejecting its input).
    pub fn is_backend_failure(&self) -> bool {
        self.error_class == error_class::BACKEND_UNAVAILABLE
            || self.error_class == error_class::TIMEOUT
    }
}

/// Dispatches a Task state to an external handler.
///
/// Implementations must be safe for concurrent use by many executions and
/// by the branches of a single Parallel/Map state.
pub trait TaskInvoker: Send + Sync {
    /// Invoke `resource` with `payload`.
    ///
    /// In [`InvocationMode::Async`] the call returns as soon as the backend
    /// has accepted the work; the returned value is only an acknowledgement.
    fn invoke<'a>(
        &'a self,
        resource: &'a str,
        payload: Value,
        mode: InvocationMode,
    ) -> BoxFuture<'a, Result<Value, TaskError>>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_display() {
        let err = TaskError::task_failed("scanner rejected region");
        assert_eq!(err.to_string(), "States.TaskFailed: scanner rejected region");
    }

    #[test]
    fn test_backend_failure_classification() {
        assert!(TaskError::backend_unavailable("503").is_backend_failure());
        assert!(TaskError::timeout("slow").is_backend_failure());
        assert!(!TaskError::task_failed("bad input").is_backend_failure());
        assert!(!TaskError::circuit_open("scan").is_backend_failure());
        assert!(!TaskError::new("InvalidFrameworkError", "x").is_backend_failure());
    }

    #[test]
    fn test_fatal_classes() {
        assert!(error_class::is_fatal(error_class::NO_CHOICE_MATCHED));
        assert!(error_class::is_fatal(error_class::ABORTED));
        assert!(!error_class::is_fatal(error_class::TASK_FAILED));
    }
}
