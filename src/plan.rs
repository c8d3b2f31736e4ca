//! Plan vocabulary: routes, plans, steps, tool calls, and supervisor
//! judgements.
//!
//! These types are the shared currency between the Architect/Chair nodes
//! (which produce plans), the execution loop (which consumes them), and the
//! event log (which records them).

pub mod template;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Sentinel `tool_name` for steps answered by the Worker model directly.
pub const NO_TOOL: &str = "None";

/// Router classification of an incoming prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Route {
    DirectQa,
    ComplexTask,
    PeerReview,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::DirectQa => write!(f, "DIRECT_QA"),
            Route::ComplexTask => write!(f, "COMPLEX_TASK"),
            Route::PeerReview => write!(f, "PEER_REVIEW"),
        }
    }
}

/// Lifecycle of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One unit of work inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: u32,
    pub instruction: String,
    /// Registry key, or [`NO_TOOL`] for an LLM-only step.
    pub tool_name: String,
    /// Template value: a string or a map whose string leaves may carry
    /// `{step_N_output}` placeholders.
    #[serde(default)]
    pub tool_input: Value,
    pub expected_outcome: String,
    #[serde(default)]
    pub status: StepStatus,
    /// Populated exactly once, when the step completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<Value>,
}

impl PlanStep {
    pub fn is_llm_only(&self) -> bool {
        self.tool_name == NO_TOOL
    }
}

/// Ordered sequence of steps produced by the Architect or Board Chair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

/// Why a plan failed validation. Collected exhaustively so a client (or a
/// re-prompted Architect) sees every problem at once.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid plan: {}", .problems.join("; "))]
pub struct PlanError {
    pub problems: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Validate structural invariants: dense 1-based step ids, tool names
    /// that resolve in the registry (or the `"None"` sentinel), and
    /// placeholders that only reference earlier steps.
    pub fn validate(&self, known_tools: &BTreeSet<String>) -> Result<(), PlanError> {
        let mut problems = Vec::new();

        if self.steps.is_empty() {
            problems.push("plan has no steps".to_string());
        }

        for (idx, step) in self.steps.iter().enumerate() {
            let expected_id = u32::try_from(idx + 1).unwrap_or(u32::MAX);
            if step.step_id != expected_id {
                problems.push(format!(
                    "step {} has id {} (ids must be a dense 1-based sequence)",
                    idx + 1,
                    step.step_id
                ));
            }

            if !step.is_llm_only() && !known_tools.contains(&step.tool_name) {
                problems.push(format!(
                    "step {} names unknown tool '{}'",
                    step.step_id, step.tool_name
                ));
            }

            for reference in template::references(&step.tool_input) {
                if reference >= step.step_id {
                    problems.push(format!(
                        "step {} references {{step_{}_output}}, which is not an earlier step",
                        step.step_id, reference
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PlanError { problems })
        }
    }

    /// Reset all execution-time fields, e.g. on a user-modified plan.
    pub fn reset_progress(&mut self) {
        for step in &mut self.steps {
            step.status = StepStatus::Pending;
            step.actual_output = None;
        }
    }

    /// Outputs of completed steps, keyed by step id, for placeholder
    /// hydration.
    pub fn completed_outputs(&self) -> std::collections::HashMap<u32, Value> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| s.actual_output.clone().map(|out| (s.step_id, out)))
            .collect()
    }
}

/// A concrete tool invocation: registry key plus fully hydrated arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub args: Value,
}

/// Supervisor routing decision for an executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Retry,
    Escalate,
}

/// Structured judgement returned by the Supervisor node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub outcome: StepOutcome,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_instruction: Option<String>,
}

/// A reviewer persona proposed for the board-of-experts path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expert {
    pub name: String,
    pub specialty: String,
}

/// One expert's critique of the chair's draft plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub expert: String,
    pub critique: String,
}
