//! The persisted, replayable event log vocabulary.
//!
//! Every observable thing a task does is one of these payloads, wrapped in a
//! [`TaskEvent`] envelope carrying the task id, a per-task gapless sequence
//! number, and a wall-clock timestamp. The store assigns `seq` at append;
//! only the owning task controller appends, which is what makes the
//! numbering race-free.

use crate::error::ErrorKind;
use crate::llm::Role;
use crate::plan::{Critique, Evaluation, Expert, Plan, PlanStep, Route, ToolCall};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope for one persisted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Typed event payloads, exactly the core → client vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    RouterDecision {
        route: Route,
    },
    /// Terminal for DIRECT_QA runs.
    DirectAnswer {
        text: String,
    },
    ArchitectPlanGenerated {
        plan: Plan,
        is_awaiting_approval: bool,
    },
    PlanProposal {
        plan: Plan,
    },
    BoardApprovalRequest {
        experts: Vec<Expert>,
    },
    ChairPlanGenerated {
        plan: Plan,
    },
    ExpertCritiqueGenerated {
        critique: Critique,
    },
    FinalPlanApprovalRequest {
        plan: Plan,
        critiques: Vec<Critique>,
        #[serde(skip_serializing_if = "Option::is_none")]
        implementation_notes: Option<String>,
    },
    ForemanStepPrepared {
        step: PlanStep,
        hydrated_tool_call: ToolCall,
    },
    WorkerStepExecuted {
        tool_call: ToolCall,
        output: Value,
        artifacts: Vec<String>,
    },
    SupervisorStepEvaluated {
        evaluation: Evaluation,
    },
    EditorReportGenerated {
        report: String,
    },
    /// Terminal for plan-executing runs.
    FinalAnswer {
        text: String,
    },
    TokenUsage {
        role: Role,
        model_id: String,
        input: u64,
        output: u64,
        total: u64,
    },
    /// Terminal: the run was stopped (or its approval gate rejected).
    TaskCancelled,
    /// Terminal: the run failed.
    Failed {
        reason: ErrorKind,
        detail: String,
    },
}

impl EventPayload {
    /// Whether this event ends the current run. Exactly one terminal event
    /// is emitted per run, always last.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::DirectAnswer { .. }
                | EventPayload::FinalAnswer { .. }
                | EventPayload::Failed { .. }
                | EventPayload::TaskCancelled
        )
    }

    /// Wire tag, also used as the `event_type` column in the store.
    pub fn type_tag(&self) -> &'static str {
        match self {
            EventPayload::RouterDecision { .. } => "router_decision",
            EventPayload::DirectAnswer { .. } => "direct_answer",
            EventPayload::ArchitectPlanGenerated { .. } => "architect_plan_generated",
            EventPayload::PlanProposal { .. } => "plan_proposal",
            EventPayload::BoardApprovalRequest { .. } => "board_approval_request",
            EventPayload::ChairPlanGenerated { .. } => "chair_plan_generated",
            EventPayload::ExpertCritiqueGenerated { .. } => "expert_critique_generated",
            EventPayload::FinalPlanApprovalRequest { .. } => "final_plan_approval_request",
            EventPayload::ForemanStepPrepared { .. } => "foreman_step_prepared",
            EventPayload::WorkerStepExecuted { .. } => "worker_step_executed",
            EventPayload::SupervisorStepEvaluated { .. } => "supervisor_step_evaluated",
            EventPayload::EditorReportGenerated { .. } => "editor_report_generated",
            EventPayload::FinalAnswer { .. } => "final_answer",
            EventPayload::TokenUsage { .. } => "token_usage",
            EventPayload::TaskCancelled => "task_cancelled",
            EventPayload::Failed { .. } => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_tag_matches_wire_type() {
        let payload = EventPayload::DirectAnswer {
            text: "4".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "direct_answer");
        assert_eq!(payload.type_tag(), "direct_answer");
    }

    #[test]
    fn envelope_flattens_payload() {
        let event = TaskEvent {
            task_id: "t1".to_string(),
            seq: 7,
            timestamp: Utc::now(),
            payload: EventPayload::TaskCancelled,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_cancelled");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["task_id"], "t1");
    }

    #[test]
    fn terminal_classification() {
        assert!(EventPayload::TaskCancelled.is_terminal());
        assert!(EventPayload::Failed {
            reason: ErrorKind::PlanUnrecoverable,
            detail: String::new()
        }
        .is_terminal());
        assert!(!EventPayload::RouterDecision {
            route: Route::DirectQa
        }
        .is_terminal());
        assert!(!EventPayload::TokenUsage {
            role: Role::Router,
            model_id: "m".to_string(),
            input: 1,
            output: 2,
            total: 3
        }
        .is_terminal());
    }

    #[test]
    fn round_trip_through_json() {
        let payload = EventPayload::Failed {
            reason: ErrorKind::LlmUnavailable,
            detail: "provider down".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
