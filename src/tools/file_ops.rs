//! Workspace file tools: read, write, list, delete.
//!
//! All paths are relative to the task workspace; escapes surface as
//! `path_escape` faults that the Supervisor must escalate.

use super::{ArgKind, Tool, ToolContext, ToolOutcome, ToolSchema, ToolScope};
use crate::error::ErrorKind;
use crate::workspace::WorkspaceError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

const MAX_READ_BYTES: usize = 256 * 1024;

fn workspace_fault(err: &WorkspaceError) -> ToolOutcome {
    match err {
        WorkspaceError::PathEscape(path) => {
            ToolOutcome::failure(ErrorKind::PathEscape, format!("path escape: {path}"))
        }
        WorkspaceError::NotFound(path) => {
            ToolOutcome::failure(ErrorKind::ToolFailed, format!("not found: {path}"))
        }
        WorkspaceError::Io(e) => ToolOutcome::failure(ErrorKind::ToolFailed, e.to_string()),
    }
}

// write_file

#[derive(Debug, Deserialize)]
struct WriteFileInput {
    file: String,
    content: String,
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn description(&self) -> String {
        "Write text content to a file in the task workspace, creating parent directories as needed. Overwrites existing content.".to_string()
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new()
            .arg("file", ArgKind::String, true, "Path relative to the workspace root")
            .arg("content", ArgKind::String, true, "Text content to write")
    }

    fn scope(&self) -> ToolScope {
        ToolScope::writes()
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let input: WriteFileInput = match serde_json::from_value(args) {
            Ok(i) => i,
            Err(e) => {
                return ToolOutcome::failure(ErrorKind::InvalidArguments, e.to_string());
            }
        };

        match ctx.workspace.write(&input.file, input.content.as_bytes()) {
            Ok(()) => ToolOutcome::success(json!(format!(
                "wrote {} bytes to {}",
                input.content.len(),
                input.file
            )))
            .with_artifacts(vec![input.file]),
            Err(e) => workspace_fault(&e),
        }
    }
}

// read_file

#[derive(Debug, Deserialize)]
struct ReadFileInput {
    path: String,
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> String {
        "Read a text file from the task workspace.".to_string()
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new().arg("path", ArgKind::String, true, "Path relative to the workspace root")
    }

    fn scope(&self) -> ToolScope {
        ToolScope::read_only()
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let input: ReadFileInput = match serde_json::from_value(args) {
            Ok(i) => i,
            Err(e) => {
                return ToolOutcome::failure(ErrorKind::InvalidArguments, e.to_string());
            }
        };

        match ctx.workspace.read_to_string(&input.path) {
            Ok(mut text) => {
                if text.len() > MAX_READ_BYTES {
                    let mut cut = MAX_READ_BYTES;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                    text.push_str("\n[truncated]");
                }
                ToolOutcome::success(json!(text))
            }
            Err(e) => workspace_fault(&e),
        }
    }
}

// list_files

#[derive(Debug, Deserialize)]
struct ListFilesInput {
    #[serde(default = "default_path")]
    path: String,
}

fn default_path() -> String {
    ".".to_string()
}

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &'static str {
        "list_files"
    }

    fn description(&self) -> String {
        "List the entries of a workspace directory. Each entry is tagged file or directory.".to_string()
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new().arg(
            "path",
            ArgKind::String,
            false,
            "Directory relative to the workspace root (default: the root)",
        )
    }

    fn scope(&self) -> ToolScope {
        ToolScope::read_only()
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let input: ListFilesInput = match serde_json::from_value(args) {
            Ok(i) => i,
            Err(e) => {
                return ToolOutcome::failure(ErrorKind::InvalidArguments, e.to_string());
            }
        };

        match ctx.workspace.list(&input.path) {
            Ok(entries) => {
                ToolOutcome::success(serde_json::to_value(entries).unwrap_or(Value::Null))
            }
            Err(e) => workspace_fault(&e),
        }
    }
}

// delete_file

#[derive(Debug, Deserialize)]
struct DeleteFileInput {
    path: String,
}

pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &'static str {
        "delete_file"
    }

    fn description(&self) -> String {
        "Delete a file or directory (recursively) from the task workspace.".to_string()
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new().arg("path", ArgKind::String, true, "Path relative to the workspace root")
    }

    fn scope(&self) -> ToolScope {
        ToolScope::writes()
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let input: DeleteFileInput = match serde_json::from_value(args) {
            Ok(i) => i,
            Err(e) => {
                return ToolOutcome::failure(ErrorKind::InvalidArguments, e.to_string());
            }
        };

        match ctx.workspace.delete(&input.path) {
            Ok(()) => ToolOutcome::success(json!(format!("deleted {}", input.path))),
            Err(e) => workspace_fault(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceManager;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> (TempDir, ToolContext) {
        let dir = TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(dir.path()).unwrap();
        let ws = mgr.create("t").unwrap();
        (
            dir,
            ToolContext {
                workspace: ws,
                cancel: CancellationToken::new(),
            },
        )
    }

    #[tokio::test]
    async fn write_then_read_then_list() {
        let (_dir, ctx) = ctx();

        let out = WriteFileTool
            .invoke(json!({"file": "hello.txt", "content": "hi"}), &ctx)
            .await;
        assert!(!out.is_error());
        assert_eq!(out.artifacts, vec!["hello.txt".to_string()]);

        let out = ReadFileTool.invoke(json!({"path": "hello.txt"}), &ctx).await;
        assert_eq!(out.output, json!("hi"));

        let out = ListFilesTool.invoke(json!({}), &ctx).await;
        let listing = out.output.as_array().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0]["name"], json!("hello.txt"));
        assert_eq!(listing[0]["kind"], json!("file"));
    }

    #[tokio::test]
    async fn path_escape_reported_as_fault() {
        let (_dir, ctx) = ctx();
        let out = WriteFileTool
            .invoke(
                json!({"file": "../../etc/passwd", "content": "x"}),
                &ctx,
            )
            .await;
        let wire = out.wire_output();
        let fault = out.error.unwrap();
        assert_eq!(fault.kind, ErrorKind::PathEscape);
        assert_eq!(wire["error"], json!("path_escape"));
    }

    #[tokio::test]
    async fn read_missing_file_is_tool_failed() {
        let (_dir, ctx) = ctx();
        let out = ReadFileTool.invoke(json!({"path": "absent.txt"}), &ctx).await;
        assert_eq!(out.error.unwrap().kind, ErrorKind::ToolFailed);
    }

    #[tokio::test]
    async fn delete_file_and_directory() {
        let (_dir, ctx) = ctx();
        WriteFileTool
            .invoke(json!({"file": "sub/a.txt", "content": "1"}), &ctx)
            .await;
        let out = DeleteFileTool.invoke(json!({"path": "sub"}), &ctx).await;
        assert!(!out.is_error());
        let out = ReadFileTool.invoke(json!({"path": "sub/a.txt"}), &ctx).await;
        assert!(out.is_error());
    }
}
