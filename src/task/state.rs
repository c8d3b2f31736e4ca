//! Run state for the node graph.
//!
//! A task's current position in the graph is one serializable value. HITL
//! gates persist it so a suspended run survives process restarts; the
//! controller rehydrates from it on resume.

use crate::llm::Role;
use crate::plan::{Critique, Expert, Plan, PlanStep, StepStatus, ToolCall};
use crate::store::TaskStatus;
use crate::tools::ToolOutcome;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Per-run configuration and accumulated context, carried through every
/// non-idle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCtx {
    pub prompt: String,
    /// Per-run model overrides, role → model id.
    #[serde(default)]
    pub role_models: HashMap<Role, String>,
    /// Tools this run may invoke.
    #[serde(default)]
    pub enabled_tools: BTreeSet<String>,
    /// Remaining Architect re-entries before the run is unrecoverable.
    pub replans_remaining: u32,
    /// Failure summaries accumulated across escalations, fed back to the
    /// Architect on re-plan.
    #[serde(default)]
    pub failure_context: Vec<String>,
}

/// Execution-loop position: the approved plan plus the cursor into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecCtx {
    pub plan: Plan,
    pub step_index: usize,
    pub retries_remaining: u32,
}

impl ExecCtx {
    pub fn new(plan: Plan, retries: u32) -> Self {
        Self {
            plan,
            step_index: 0,
            retries_remaining: retries,
        }
    }

    pub fn current_step(&self) -> &PlanStep {
        &self.plan.steps[self.step_index]
    }

    pub fn current_step_mut(&mut self) -> &mut PlanStep {
        &mut self.plan.steps[self.step_index]
    }

    pub fn is_last_step(&self) -> bool {
        self.step_index + 1 >= self.plan.steps.len()
    }

    pub fn mark_current(&mut self, status: StepStatus) {
        self.current_step_mut().status = status;
    }
}

/// Board-of-experts context for the peer-review path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardCtx {
    pub experts: Vec<Expert>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub critiques: Vec<Critique>,
    /// Index of the expert whose critique is being collected. Critiques are
    /// gathered sequentially to keep event ordering simple.
    #[serde(default)]
    pub next_expert: usize,
}

impl BoardCtx {
    pub fn new(experts: Vec<Expert>) -> Self {
        Self {
            experts,
            ..Self::default()
        }
    }
}

/// Where a run currently is in the node graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunState {
    /// No run in flight.
    Idle,

    /// Router is classifying the prompt.
    Routing { run: RunCtx },

    /// Librarian is answering a DIRECT_QA prompt.
    Answering { run: RunCtx },

    /// Architect is drafting (or re-drafting) a plan.
    Planning { run: RunCtx },

    /// Suspended at the plan approval gate.
    AwaitingPlanApproval { run: RunCtx, plan: Plan },

    /// Board Chair is proposing an expert roster.
    BoardProposing { run: RunCtx },

    /// Suspended at the board roster approval gate.
    AwaitingBoardApproval { run: RunCtx, board: BoardCtx },

    /// Chair is drafting the initial peer-review plan.
    ChairDrafting { run: RunCtx, board: BoardCtx },

    /// Experts are critiquing the draft, one at a time.
    Critiquing { run: RunCtx, board: BoardCtx },

    /// Chair is synthesizing the final plan from critiques.
    ChairFinalizing { run: RunCtx, board: BoardCtx },

    /// Suspended at the final plan approval gate.
    AwaitingFinalApproval {
        run: RunCtx,
        plan: Plan,
        board: BoardCtx,
    },

    /// Foreman is hydrating the current step's tool input.
    Hydrating { run: RunCtx, exec: ExecCtx },

    /// Worker is executing the hydrated call (tool or LLM-only).
    InvokingTool {
        run: RunCtx,
        exec: ExecCtx,
        call: ToolCall,
    },

    /// Supervisor is judging the step result.
    Evaluating {
        run: RunCtx,
        exec: ExecCtx,
        call: ToolCall,
        outcome: ToolOutcome,
    },

    /// Editor is producing the final report.
    Editing { run: RunCtx, exec: ExecCtx },
}

impl Default for RunState {
    fn default() -> Self {
        RunState::Idle
    }
}

impl RunState {
    /// Whether a run is in flight (anything but `Idle`).
    pub fn is_active(&self) -> bool {
        !matches!(self, RunState::Idle)
    }

    /// Whether the run is suspended at a HITL gate.
    pub fn is_awaiting_input(&self) -> bool {
        matches!(
            self,
            RunState::AwaitingPlanApproval { .. }
                | RunState::AwaitingBoardApproval { .. }
                | RunState::AwaitingFinalApproval { .. }
        )
    }

    /// The run context, for any state with a live run.
    pub fn run_ctx(&self) -> Option<&RunCtx> {
        match self {
            RunState::Idle => None,
            RunState::Routing { run }
            | RunState::Answering { run }
            | RunState::Planning { run }
            | RunState::AwaitingPlanApproval { run, .. }
            | RunState::BoardProposing { run }
            | RunState::AwaitingBoardApproval { run, .. }
            | RunState::ChairDrafting { run, .. }
            | RunState::Critiquing { run, .. }
            | RunState::ChairFinalizing { run, .. }
            | RunState::AwaitingFinalApproval { run, .. }
            | RunState::Hydrating { run, .. }
            | RunState::InvokingTool { run, .. }
            | RunState::Evaluating { run, .. }
            | RunState::Editing { run, .. } => Some(run),
        }
    }

    /// Task-level status this state maps to while the run is live.
    pub fn live_status(&self) -> TaskStatus {
        if self.is_awaiting_input() {
            TaskStatus::AwaitingInput
        } else if self.is_active() {
            TaskStatus::Running
        } else {
            TaskStatus::Idle
        }
    }
}
