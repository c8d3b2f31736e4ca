//! Wire-level error taxonomy.
//!
//! Every user-visible failure carries one of these kinds, either in a
//! `failed` event payload or in a WebSocket error frame. Internal error
//! types (`StoreError`, `LlmError`, ...) map into this taxonomy at the
//! boundary where they become visible to a client.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Short machine-readable failure tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Input errors - surfaced immediately, never retried
    InvalidArguments,
    PathEscape,
    PlanInvalid,
    NoPendingInterrupt,
    TaskBusy,

    // Tool errors - first-class values routed to the Supervisor
    ToolFailed,
    ToolTimeout,
    SandboxViolation,

    // LLM errors
    LlmUnavailable,
    LlmParseError,

    // Plan errors
    PlaceholderUnresolved,
    PlanUnrecoverable,

    // Lifecycle
    TaskCancelled,
    TaskNotFound,

    // Internal
    StorageError,
    Bug,
}

impl ErrorKind {
    /// Tag string as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArguments => "invalid_arguments",
            ErrorKind::PathEscape => "path_escape",
            ErrorKind::PlanInvalid => "plan_invalid",
            ErrorKind::NoPendingInterrupt => "no_pending_interrupt",
            ErrorKind::TaskBusy => "task_busy",
            ErrorKind::ToolFailed => "tool_failed",
            ErrorKind::ToolTimeout => "tool_timeout",
            ErrorKind::SandboxViolation => "sandbox_violation",
            ErrorKind::LlmUnavailable => "llm_unavailable",
            ErrorKind::LlmParseError => "llm_parse_error",
            ErrorKind::PlaceholderUnresolved => "placeholder_unresolved",
            ErrorKind::PlanUnrecoverable => "plan_unrecoverable",
            ErrorKind::TaskCancelled => "task_cancelled",
            ErrorKind::TaskNotFound => "task_not_found",
            ErrorKind::StorageError => "storage_error",
            ErrorKind::Bug => "bug",
        }
    }

    /// Whether the Supervisor may treat this as a retry candidate.
    ///
    /// Sandbox violations are deliberately excluded: retrying a path escape
    /// re-runs the same adversarial input.
    pub fn is_retry_candidate(self) -> bool {
        matches!(
            self,
            ErrorKind::ToolFailed | ErrorKind::ToolTimeout | ErrorKind::PlaceholderUnresolved
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tags_are_snake_case() {
        let json = serde_json::to_value(ErrorKind::PathEscape).unwrap();
        assert_eq!(json, serde_json::json!("path_escape"));
        assert_eq!(ErrorKind::PathEscape.to_string(), "path_escape");
    }

    #[test]
    fn sandbox_violation_is_not_retryable() {
        assert!(!ErrorKind::SandboxViolation.is_retry_candidate());
        assert!(!ErrorKind::PathEscape.is_retry_candidate());
        assert!(ErrorKind::ToolTimeout.is_retry_candidate());
        assert!(ErrorKind::PlaceholderUnresolved.is_retry_candidate());
    }
}
