//! Error types for definition loading, validation, and execution
//!
//! Two error layers coexist here, and it matters which one a failure lands in:
//!
//! - [`ExecutionError`] is the flat `{code, cause}` value that flows through
//!   the workflow language itself. It is what agents raise, what `Retry` and
//!   `Catch` rules match on by code, and what a `Fail` outcome surfaces. Codes
//!   form a single flat namespace - the engine-owned `States.*` codes in
//!   [`codes`], the `Agent.*` prefix reserved for agent-originated codes, and
//!   anything else a workflow author chooses to throw and catch.
//! - [`EngineError`] is the host-facing Rust error for everything outside a
//!   running state: a definition that fails validation, a resume token nobody
//!   is waiting on, a checkpoint that cannot be loaded.
//!
//! A caught [`ExecutionError`] never becomes an [`EngineError`]; it is routed
//! by the retry/catch engine and disappears into the trace.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result type using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;

/// The flat error-code namespace of the workflow language.
pub mod codes {
    /// Wildcard for retry/catch rules; never actually raised
    pub const ALL: &str = "States.ALL";
    /// Generic task failure (default for unclassified agent errors)
    pub const TASK_FAILED: &str = "States.TaskFailed";
    /// Task exceeded `TimeoutSeconds` or missed a heartbeat
    pub const TIMEOUT: &str = "States.Timeout";
    /// Cooperative cancellation propagated
    pub const CANCELLED: &str = "States.Cancelled";
    /// Access denied by an agent or tool collaborator
    pub const PERMISSIONS: &str = "States.Permissions";
    /// Agent or collaborator signalled throttling
    pub const RATE_LIMIT_EXCEEDED: &str = "States.RateLimitExceeded";
    /// Totals exceeded an agent-enforced budget
    pub const BUDGET_EXCEEDED: &str = "States.BudgetExceeded";
    /// Choice/Approval routing found no match and no default
    pub const NO_CHOICE_MATCHED: &str = "States.NoChoiceMatched";
    /// A required path read failed
    pub const PARAMETER_PATH_FAILURE: &str = "States.ParameterPathFailure";
    /// A result write targeted a non-object location
    pub const RESULT_PATH_MATCH_FAILURE: &str = "States.ResultPathMatchFailure";
    /// An intrinsic function call failed
    pub const INTRINSIC_FAILURE: &str = "States.IntrinsicFailure";
    /// An approval timed out with `OnTimeout: Fail`
    pub const APPROVAL_TIMEOUT: &str = "States.ApprovalTimeout";
    /// A Map state exceeded its tolerated failures
    pub const MAP_FAILED: &str = "States.MapFailed";
    /// A Parallel state had an uncaught branch failure
    pub const PARALLEL_FAILED: &str = "States.ParallelFailed";
}

/// A workflow-level error: a flat code plus a human-readable cause.
///
/// Retry and Catch rules match on `code`. The type is deliberately not
/// recursive - nested failures flatten into the cause string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {cause}")]
pub struct ExecutionError {
    /// Flat error code, e.g. `States.Timeout` or `Agent.ToolDenied`
    pub code: String,
    /// Human-readable description of what went wrong
    pub cause: String,
}

impl ExecutionError {
    pub fn new(code: impl Into<String>, cause: impl Into<String>) -> Self {
        let code = code.into();
        let code = if code.is_empty() {
            codes::TASK_FAILED.to_string()
        } else {
            code
        };
        Self {
            code,
            cause: cause.into(),
        }
    }

    pub fn task_failed(cause: impl Into<String>) -> Self {
        Self::new(codes::TASK_FAILED, cause)
    }

    pub fn timeout(cause: impl Into<String>) -> Self {
        Self::new(codes::TIMEOUT, cause)
    }

    pub fn cancelled(cause: impl Into<String>) -> Self {
        Self::new(codes::CANCELLED, cause)
    }

    pub fn path_failure(cause: impl Into<String>) -> Self {
        Self::new(codes::PARAMETER_PATH_FAILURE, cause)
    }

    pub fn result_path_failure(cause: impl Into<String>) -> Self {
        Self::new(codes::RESULT_PATH_MATCH_FAILURE, cause)
    }

    pub fn intrinsic(cause: impl Into<String>) -> Self {
        Self::new(codes::INTRINSIC_FAILURE, cause)
    }

    /// Whether this error is the cooperative-cancellation signal, which
    /// bypasses retry and catch matching.
    pub fn is_cancellation(&self) -> bool {
        self.code == codes::CANCELLED
    }
}

/// Host-facing error type for all engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The definition failed structural validation and was not loaded
    #[error("Definition validation failed: {0}")]
    Validation(String),

    /// An execution terminated with an unhandled workflow error
    #[error("Execution failed: {0}")]
    Execution(#[from] ExecutionError),

    /// JSON serialization or deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The checkpoint store reported a failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] stateline_checkpoint::CheckpointError),

    /// Reading a definition file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `resume` was called with a token no suspended execution owns
    #[error("No suspended execution for resume token '{0}'")]
    UnknownResumeToken(String),

    /// `resume_from_checkpoint` found no snapshot under the given id
    #[error("Checkpoint '{0}' not found")]
    CheckpointNotFound(String),

    /// The workflow needs a collaborator the host did not configure
    #[error("Configuration error: {0}")]
    Configuration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_code_normalizes_to_task_failed() {
        let err = ExecutionError::new("", "agent panicked");
        assert_eq!(err.code, codes::TASK_FAILED);
        assert_eq!(err.cause, "agent panicked");
    }

    #[test]
    fn test_custom_codes_pass_through_verbatim() {
        let err = ExecutionError::new("CustomError", "domain failure");
        assert_eq!(err.code, "CustomError");
    }

    #[test]
    fn test_display_includes_code_and_cause() {
        let err = ExecutionError::timeout("agent 'slow' exceeded 30s");
        assert_eq!(err.to_string(), "States.Timeout: agent 'slow' exceeded 30s");
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(ExecutionError::cancelled("stop").is_cancellation());
        assert!(!ExecutionError::task_failed("boom").is_cancellation());
    }
}
