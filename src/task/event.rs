//! Events that drive run state transitions.
//!
//! User inputs (run, resume, stop) and node/tool completions arrive on the
//! same controller channel and are fed through the pure transition function
//! one at a time.

use crate::error::ErrorKind;
use crate::llm::Role;
use crate::plan::{Critique, Evaluation, Expert, Plan, Route, ToolCall};
use crate::tools::ToolOutcome;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A client decision resuming a suspended run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeInput {
    pub decision: ResumeDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_plan: Option<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeDecision {
    Approve,
    Reject,
    Modify,
}

/// Inputs to the transition function.
#[derive(Debug, Clone)]
pub enum RunEvent {
    // User events
    RunRequested {
        prompt: String,
        role_models: HashMap<Role, String>,
        enabled_tools: BTreeSet<String>,
    },
    ResumeReceived {
        input: ResumeInput,
    },
    StopRequested,

    // Node completions
    RouteChosen {
        route: Route,
    },
    AnswerReady {
        text: String,
    },
    PlanReady {
        plan: Plan,
    },
    RosterReady {
        experts: Vec<Expert>,
    },
    DraftReady {
        plan: Plan,
        notes: Option<String>,
    },
    CritiqueReady {
        critique: Critique,
    },
    Verdict {
        evaluation: Evaluation,
    },
    ReportReady {
        report: String,
    },

    // Step execution
    StepHydrated {
        call: ToolCall,
    },
    HydrationFailed {
        message: String,
    },
    ToolFinished {
        outcome: ToolOutcome,
    },

    // Failures and aborts
    NodeFailed {
        kind: ErrorKind,
        detail: String,
    },
    /// The in-flight operation was cancelled (token fired mid-call).
    Aborted,
}
