//! Effects produced by run state transitions.
//!
//! The transition function is pure; everything observable happens when the
//! controller executes these, in order. Effects that launch work (`RunNode`,
//! `HydrateStep`, `InvokeTool`) resolve to a follow-up [`super::event::RunEvent`].

use crate::events::EventPayload;
use crate::plan::ToolCall;
use crate::store::{PendingInterrupt, TaskStatus};

/// A reasoning node the controller should run against the LLM gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Router,
    Librarian,
    Architect,
    /// Chair proposes the expert roster.
    BoardRoster,
    /// Chair drafts the initial peer-review plan.
    ChairDraft,
    /// One expert critiques the draft.
    ExpertCritique {
        index: usize,
    },
    /// Chair synthesizes the final plan.
    ChairFinal,
    /// Worker answers an LLM-only step.
    WorkerLlm,
    Supervisor,
    Editor,
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Append an event to the task's log (durable, then fanned out).
    Emit(EventPayload),

    /// Update the task's status column.
    SetStatus(TaskStatus),

    /// Persist the current run state (and clear it when idle).
    PersistRun,

    /// Persist a pending HITL interrupt on the task record.
    StoreInterrupt(PendingInterrupt),

    /// Clear the pending interrupt.
    ClearInterrupt,

    /// Run a reasoning node; resolves to its completion event.
    RunNode(Node),

    /// Hydrate the current step's template; resolves to
    /// `StepHydrated` or `HydrationFailed`.
    HydrateStep,

    /// Invoke a tool; resolves to `ToolFinished` or `Aborted`.
    InvokeTool { call: ToolCall },
}
