//! Store schema and persisted record types.

use crate::error::ErrorKind;
use crate::llm::{Role, Usage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// SQL schema for initialization.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    workspace_root TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'idle',
    run_state TEXT,
    pending_interrupt TEXT,
    token_totals TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    task_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (task_id, seq),
    FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_tasks_updated ON tasks(updated_at DESC);
";

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    AwaitingInput,
    Cancelling,
    Completed,
    Failed,
}

impl TaskStatus {
    /// The task has a live run (new `run_agent` messages are rejected).
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::AwaitingInput | TaskStatus::Cancelling
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingInput => "awaiting_input",
            TaskStatus::Cancelling => "cancelling",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub fn parse_status(s: &str) -> TaskStatus {
    match s {
        "running" => TaskStatus::Running,
        "awaiting_input" => TaskStatus::AwaitingInput,
        "cancelling" => TaskStatus::Cancelling,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        _ => TaskStatus::Idle,
    }
}

/// What kind of human decision a suspended run is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    PlanApproval,
    BoardApproval,
    FinalPlanApproval,
}

/// Persisted HITL suspension: the gate kind plus the payload the client saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInterrupt {
    pub kind: InterruptKind,
    pub payload: Value,
}

/// Per-role token accounting, folded in on every successful gateway call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTotals {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenTotals(pub HashMap<Role, RoleTotals>);

impl TokenTotals {
    pub fn add(&mut self, role: Role, usage: Usage) {
        let entry = self.0.entry(role).or_default();
        entry.input += usage.input_tokens;
        entry.output += usage.output_tokens;
        entry.total += usage.total();
    }

    pub fn get(&self, role: Role) -> RoleTotals {
        self.0.get(&role).copied().unwrap_or_default()
    }
}

/// Task record as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub workspace_root: String,
    pub status: TaskStatus,
    /// Serialized `RunState`, kept so suspended tasks survive restarts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<PendingInterrupt>,
    pub token_totals: TokenTotals,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Point-in-time view handed to reconnecting clients.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    pub history: Vec<crate::events::TaskEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<PendingInterrupt>,
}

/// Store-level errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("corrupt record for task {task_id}: {detail}")]
    Corrupt { task_id: String, detail: String },
}

impl StoreError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            StoreError::TaskNotFound(_) => ErrorKind::TaskNotFound,
            _ => ErrorKind::StorageError,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
