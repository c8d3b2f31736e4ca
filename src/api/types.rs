//! Wire types for the WebSocket session and the HTTP endpoints.

use crate::error::ErrorKind;
use crate::events::TaskEvent;
use crate::plan::Plan;
use crate::store::TaskRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Client → core frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientMessage {
    TaskCreate {
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    TaskDelete {
        task_id: String,
    },
    TaskRename {
        task_id: String,
        name: String,
    },
    RunAgent {
        task_id: String,
        prompt: String,
        /// Role label (e.g. "ROUTER") → model id.
        #[serde(default)]
        llm_config: HashMap<String, String>,
        #[serde(default)]
        enabled_tools: Vec<String>,
    },
    Resume {
        task_id: String,
        decision: String,
        #[serde(default)]
        modified_plan: Option<Plan>,
        #[serde(default)]
        feedback: Option<String>,
    },
    Stop {
        task_id: String,
    },
    /// Attach this connection to a task's event stream, replaying history
    /// from `from_seq` (default 1).
    Subscribe {
        task_id: String,
        #[serde(default)]
        from_seq: Option<i64>,
    },
}

/// Core → client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    TaskList {
        tasks: Vec<TaskRecord>,
    },
    Ack {
        request: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    Error {
        error: ErrorKind,
        detail: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    Event {
        event: TaskEvent,
    },
}

impl ServerMessage {
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"kind\":\"error\",\"error\":\"bug\",\"detail\":\"serialize: {e}\"}}"
            )
        })
    }
}
