//! Script execution tool.
//!
//! Runs a shell command via `bash -c` with the task workspace as the working
//! directory. Output is combined stdout/stderr, truncated from the middle
//! when oversized. The process is killed on cancellation; the registry's
//! scope timeout bounds total runtime.

use super::{ArgKind, Tool, ToolContext, ToolOutcome, ToolSchema, ToolScope};
use crate::error::ErrorKind;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::process::Command;

const MAX_OUTPUT_LENGTH: usize = 64 * 1024;
const SNIP_SIZE: usize = 4 * 1024;

#[derive(Debug, Deserialize)]
struct RunScriptInput {
    command: String,
}

pub struct RunScriptTool;

impl RunScriptTool {
    fn truncate_output(output: &str) -> String {
        if output.len() <= MAX_OUTPUT_LENGTH {
            return output.to_string();
        }
        let mut head_end = SNIP_SIZE.min(output.len());
        while !output.is_char_boundary(head_end) {
            head_end -= 1;
        }
        let mut tail_start = output.len() - SNIP_SIZE.min(output.len());
        while !output.is_char_boundary(tail_start) {
            tail_start += 1;
        }
        format!(
            "[output truncated in middle: got {} bytes, max is {} bytes]\n{}\n\n[snip]\n\n{}",
            output.len(),
            MAX_OUTPUT_LENGTH,
            &output[..head_end],
            &output[tail_start..]
        )
    }
}

#[async_trait]
impl Tool for RunScriptTool {
    fn name(&self) -> &'static str {
        "run_script"
    }

    fn description(&self) -> String {
        "Execute a shell command via bash -c inside the task workspace, returning combined stdout/stderr. Shell state does not persist between calls.".to_string()
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new().arg(
            "command",
            ArgKind::String,
            true,
            "Shell command to execute via bash -c",
        )
    }

    fn scope(&self) -> ToolScope {
        ToolScope::executes()
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let input: RunScriptInput = match serde_json::from_value(args) {
            Ok(i) => i,
            Err(e) => {
                return ToolOutcome::failure(ErrorKind::InvalidArguments, e.to_string());
            }
        };

        if input.command.trim().is_empty() {
            return ToolOutcome::failure(ErrorKind::InvalidArguments, "command cannot be empty");
        }

        let mut cmd = Command::new("bash");
        cmd.args(["-c", &input.command])
            .current_dir(ctx.workspace.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return ToolOutcome::failure(
                    ErrorKind::ToolFailed,
                    format!("failed to spawn process: {e}"),
                );
            }
        };

        let output = tokio::select! {
            result = child.wait_with_output() => match result {
                Ok(o) => o,
                Err(e) => {
                    return ToolOutcome::failure(
                        ErrorKind::ToolFailed,
                        format!("command execution failed: {e}"),
                    );
                }
            },
            () = ctx.cancel.cancelled() => {
                // kill_on_drop reaps the child when the future is dropped.
                return ToolOutcome::failure(ErrorKind::TaskCancelled, "command cancelled");
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{stdout}{stderr}");
        let formatted = Self::truncate_output(&combined);

        if output.status.success() {
            ToolOutcome::success(json!(formatted))
        } else {
            let exit_code = output.status.code().unwrap_or(-1);
            ToolOutcome::failure(
                ErrorKind::ToolFailed,
                format!("[command failed: exit code {exit_code}]\n{formatted}"),
            )
        }
    }
}
