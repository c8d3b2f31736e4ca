//! Tool catalog: the uniform contract every tool satisfies, argument-schema
//! validation, scope flags, and the registry shared by all tasks.
//!
//! Tools are stateless singletons; everything call-specific (workspace
//! handle, cancellation signal) arrives via [`ToolContext`]. The registry is
//! read-only after startup.

mod file_ops;
mod run_script;
mod web_search;

pub use file_ops::{DeleteFileTool, ListFilesTool, ReadFileTool, WriteFileTool};
pub use run_script::RunScriptTool;
pub use web_search::WebSearchTool;

use crate::error::ErrorKind;
use crate::workspace::WorkspaceHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Declared type of a tool argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ArgKind {
    fn json_type(self) -> &'static str {
        match self {
            ArgKind::String => "string",
            ArgKind::Number => "number",
            ArgKind::Boolean => "boolean",
            ArgKind::Object => "object",
            ArgKind::Array => "array",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            ArgKind::String => value.is_string(),
            ArgKind::Number => value.is_number(),
            ArgKind::Boolean => value.is_boolean(),
            ArgKind::Object => value.is_object(),
            ArgKind::Array => value.is_array(),
        }
    }
}

/// Specification of one argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSpec {
    pub kind: ArgKind,
    pub required: bool,
    pub description: String,
}

/// Ordered mapping from argument name to its spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSchema {
    args: Vec<(String, ArgSpec)>,
}

impl ToolSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(
        mut self,
        name: &str,
        kind: ArgKind,
        required: bool,
        description: &str,
    ) -> Self {
        self.args.push((
            name.to_string(),
            ArgSpec {
                kind,
                required,
                description: description.to_string(),
            },
        ));
        self
    }

    /// Validate `args` against this schema.
    ///
    /// Returns the (possibly coerced) argument object. The only coercion
    /// performed is parsing a JSON-encoded string supplied for a declared
    /// `object` argument.
    pub fn validate(&self, args: &Value) -> Result<Value, ToolError> {
        let Some(map) = args.as_object() else {
            // Tools with a single required string argument accept a bare
            // string for convenience (plans often write `"tool_input": "."`).
            if args.is_string() {
                if let Some(name) = self.single_required_string_arg() {
                    let mut obj = serde_json::Map::new();
                    obj.insert(name.to_string(), args.clone());
                    return Ok(Value::Object(obj));
                }
            }
            return Err(ToolError::InvalidArguments {
                missing: vec![],
                mistyped: vec!["arguments must be a JSON object".to_string()],
            });
        };

        let mut missing = Vec::new();
        let mut mistyped = Vec::new();
        let mut coerced = map.clone();

        for (name, spec) in &self.args {
            match map.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        missing.push(name.clone());
                    }
                }
                Some(value) if spec.kind.matches(value) => {}
                Some(Value::String(s)) if spec.kind == ArgKind::Object => {
                    // JSON-encoded object in a string slot.
                    match serde_json::from_str::<Value>(s) {
                        Ok(parsed) if parsed.is_object() => {
                            coerced.insert(name.clone(), parsed);
                        }
                        _ => mistyped.push(format!("{name}: expected object, got string")),
                    }
                }
                Some(value) => {
                    mistyped.push(format!(
                        "{name}: expected {}, got {}",
                        spec.kind.json_type(),
                        json_type_name(value)
                    ));
                }
            }
        }

        if missing.is_empty() && mistyped.is_empty() {
            Ok(Value::Object(coerced))
        } else {
            Err(ToolError::InvalidArguments { missing, mistyped })
        }
    }

    fn single_required_string_arg(&self) -> Option<&str> {
        let required: Vec<_> = self.args.iter().filter(|(_, s)| s.required).collect();
        match required.as_slice() {
            [(name, spec)] if spec.kind == ArgKind::String => Some(name.as_str()),
            _ => None,
        }
    }

    /// Render as a JSON-schema object for planner prompts and `/api/tools`.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for (name, spec) in &self.args {
            properties.insert(
                name.clone(),
                json!({
                    "type": spec.kind.json_type(),
                    "description": spec.description,
                }),
            );
            if spec.required {
                required.push(Value::String(name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Static capability flags for a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolScope {
    pub reads_workspace: bool,
    pub writes_workspace: bool,
    pub executes_code: bool,
    pub network: bool,
}

impl ToolScope {
    pub const fn read_only() -> Self {
        Self {
            reads_workspace: true,
            writes_workspace: false,
            executes_code: false,
            network: false,
        }
    }

    pub const fn writes() -> Self {
        Self {
            reads_workspace: true,
            writes_workspace: true,
            executes_code: false,
            network: false,
        }
    }

    pub const fn executes() -> Self {
        Self {
            reads_workspace: true,
            writes_workspace: true,
            executes_code: true,
            network: false,
        }
    }

    pub const fn network() -> Self {
        Self {
            reads_workspace: false,
            writes_workspace: false,
            executes_code: false,
            network: true,
        }
    }

    /// Pick the wall-clock budget for this scope.
    pub fn timeout(self, timeouts: &ToolTimeouts) -> Duration {
        if self.executes_code {
            timeouts.executes_code
        } else if self.writes_workspace {
            timeouts.writes
        } else {
            timeouts.read_only
        }
    }
}

/// Per-scope wall-clock budgets.
#[derive(Debug, Clone, Copy)]
pub struct ToolTimeouts {
    pub read_only: Duration,
    pub writes: Duration,
    pub executes_code: Duration,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            read_only: Duration::from_secs(30),
            writes: Duration::from_secs(60),
            executes_code: Duration::from_secs(300),
        }
    }
}

/// All context needed for one tool invocation. Created fresh per call.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace: WorkspaceHandle,
    pub cancel: CancellationToken,
}

/// Structured failure inside a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFault {
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of a tool invocation. Tools report failure through `error`; a
/// panic across the invoke boundary is treated as a fatal `tool_failed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub output: Value,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFault>,
}

impl ToolOutcome {
    pub fn success(output: impl Into<Value>) -> Self {
        Self {
            output: output.into(),
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            artifacts: Vec::new(),
            error: Some(ToolFault {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Wire shape for `worker_step_executed`: the plain output on success,
    /// `{error, message}` on failure.
    pub fn wire_output(&self) -> Value {
        match &self.error {
            Some(fault) => json!({
                "error": fault.kind,
                "message": fault.message,
            }),
            None => self.output.clone(),
        }
    }
}

/// Errors raised by the registry itself, before or around a tool run.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("tool '{0}' is not enabled for this task")]
    NotPermitted(String),
    #[error("invalid arguments: missing {missing:?}, mistyped {mistyped:?}")]
    InvalidArguments {
        missing: Vec<String>,
        mistyped: Vec<String>,
    },
    #[error("tool timed out after {0:?}")]
    Timeout(Duration),
    #[error("tool cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn into_outcome(self) -> ToolOutcome {
        match self {
            ToolError::Timeout(d) => ToolOutcome::failure(
                ErrorKind::ToolTimeout,
                format!("tool timed out after {d:?}"),
            ),
            ToolError::InvalidArguments { .. } => {
                let msg = self.to_string();
                ToolOutcome::failure(ErrorKind::InvalidArguments, msg)
            }
            other => ToolOutcome::failure(ErrorKind::ToolFailed, other.to_string()),
        }
    }
}

/// Trait every tool satisfies.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> String;
    fn schema(&self) -> ToolSchema;
    fn scope(&self) -> ToolScope;

    /// Execute the tool. Long-running tools should watch `ctx.cancel`.
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolOutcome;
}

/// Metadata row exposed over `GET /api/tools`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub scope: ToolScope,
}

/// Collection of tools available to every task.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    timeouts: ToolTimeouts,
}

impl ToolRegistry {
    /// The standard catalog.
    pub fn standard(timeouts: ToolTimeouts) -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ReadFileTool),
            Arc::new(WriteFileTool),
            Arc::new(ListFilesTool),
            Arc::new(DeleteFileTool),
            Arc::new(RunScriptTool),
            Arc::new(WebSearchTool::from_env()),
        ];
        Self { tools, timeouts }
    }

    #[cfg(test)]
    pub fn with_tools(tools: Vec<Arc<dyn Tool>>, timeouts: ToolTimeouts) -> Self {
        Self { tools, timeouts }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Names of every registered tool.
    pub fn names(&self) -> BTreeSet<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// Metadata for all tools.
    pub fn list(&self) -> Vec<ToolInfo> {
        self.tools
            .iter()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description(),
                schema: t.schema().to_json_schema(),
                scope: t.scope(),
            })
            .collect()
    }

    /// Validate and invoke a tool, bounded by its scope timeout and the
    /// caller's cancellation token. A panicking tool is a fatal
    /// `tool_failed`, never a crashed controller.
    pub async fn invoke(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolContext,
        enabled: &BTreeSet<String>,
    ) -> Result<ToolOutcome, ToolError> {
        use futures::FutureExt;

        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        if !enabled.contains(name) {
            return Err(ToolError::NotPermitted(name.to_string()));
        }

        let args = tool.schema().validate(args)?;
        let budget = tool.scope().timeout(&self.timeouts);
        let guarded = std::panic::AssertUnwindSafe(tool.invoke(args, ctx)).catch_unwind();

        tokio::select! {
            result = tokio::time::timeout(budget, guarded) => match result {
                Err(_) => Err(ToolError::Timeout(budget)),
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(_)) => Ok(ToolOutcome::failure(
                    ErrorKind::ToolFailed,
                    format!("tool '{name}' panicked"),
                )),
            },
            () = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
        }
    }
}
