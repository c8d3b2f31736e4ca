//! Per-task sandboxed workspaces.
//!
//! Every task owns one directory under the configured workspace root. All
//! file operations take paths relative to that directory and are rejected
//! with `PathEscape` if normalisation (or symlink resolution) would land
//! outside it. The manager is reentrant across workspaces; operations within
//! one workspace are serialized by the owning task controller.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("path escapes the workspace: {0}")]
    PathEscape(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

/// Directory entry kind reported by `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// Issues per-task workspace roots under a single base directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base: impl Into<PathBuf>) -> WorkspaceResult<Self> {
        let base: PathBuf = base.into();
        fs::create_dir_all(&base)?;
        // Canonicalize once so later containment checks compare resolved paths.
        let base = base.canonicalize()?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Create (idempotently) the workspace for a task and return a handle.
    pub fn create(&self, task_id: &str) -> WorkspaceResult<WorkspaceHandle> {
        let dir = self.task_dir(task_id)?;
        fs::create_dir_all(&dir)?;
        Ok(WorkspaceHandle { root: dir })
    }

    /// Handle to an existing workspace (created if missing, so reconnecting
    /// tasks always have a root).
    pub fn handle(&self, task_id: &str) -> WorkspaceResult<WorkspaceHandle> {
        self.create(task_id)
    }

    /// Remove a task's workspace subtree. Absent workspaces are fine.
    pub fn destroy(&self, task_id: &str) -> WorkspaceResult<()> {
        let dir = self.task_dir(task_id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn task_dir(&self, task_id: &str) -> WorkspaceResult<PathBuf> {
        // Task ids are server-generated UUIDs or client-supplied opaque
        // strings; either way they must be a single path component.
        if task_id.is_empty()
            || task_id
                .chars()
                .any(|c| c == '/' || c == '\\' || c == '\0' || c == '.')
        {
            return Err(WorkspaceError::PathEscape(task_id.to_string()));
        }
        Ok(self.base.join(task_id))
    }
}

/// Bounded filesystem surface for one task.
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    root: PathBuf,
}

impl WorkspaceHandle {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path against the workspace root, rejecting any
    /// form of escape: absolute paths, `..` traversal past the root, and
    /// symlinks whose targets resolve outside the root.
    pub fn resolve(&self, rel: &str) -> WorkspaceResult<PathBuf> {
        let candidate = Path::new(rel);
        let mut depth: usize = 0;
        let mut joined = self.root.clone();

        for component in candidate.components() {
            match component {
                Component::Normal(part) => {
                    joined.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(WorkspaceError::PathEscape(rel.to_string()));
                    }
                    joined.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(WorkspaceError::PathEscape(rel.to_string()));
                }
            }
        }

        // Symlink containment: resolve the deepest existing ancestor and
        // make sure it is still inside the root.
        let mut probe = joined.clone();
        while !probe.exists() {
            if !probe.pop() || !probe.starts_with(&self.root) {
                break;
            }
        }
        if probe.exists() {
            let resolved = probe.canonicalize()?;
            if !resolved.starts_with(&self.root) {
                return Err(WorkspaceError::PathEscape(rel.to_string()));
            }
        }

        Ok(joined)
    }

    pub fn read(&self, rel: &str) -> WorkspaceResult<Vec<u8>> {
        let path = self.resolve(rel)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(WorkspaceError::NotFound(rel.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_to_string(&self, rel: &str) -> WorkspaceResult<String> {
        let bytes = self.read(rel)?;
        String::from_utf8(bytes)
            .map_err(|_| WorkspaceError::Io(io::Error::other("file is not valid UTF-8")))
    }

    pub fn write(&self, rel: &str, contents: &[u8]) -> WorkspaceResult<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(())
    }

    pub fn list(&self, rel: &str) -> WorkspaceResult<Vec<WorkspaceEntry>> {
        let path = self.resolve(rel)?;
        let read_dir = match fs::read_dir(&path) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(WorkspaceError::NotFound(rel.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let meta = entry.metadata()?;
            entries.push(WorkspaceEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: if meta.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn rename(&self, from: &str, to: &str) -> WorkspaceResult<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if !src.exists() {
            return Err(WorkspaceError::NotFound(from.to_string()));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(src, dst)?;
        Ok(())
    }

    pub fn delete(&self, rel: &str) -> WorkspaceResult<()> {
        let path = self.resolve(rel)?;
        if path == self.root {
            return Err(WorkspaceError::PathEscape(rel.to_string()));
        }
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path)?,
            Ok(_) => fs::remove_file(&path)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(WorkspaceError::NotFound(rel.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Store uploaded content under a client-declared filename. The filename
    /// goes through the same resolver as every other path, so traversal
    /// attempts fail with `PathEscape`.
    pub fn upload(&self, filename: &str, contents: &[u8]) -> WorkspaceResult<String> {
        self.write(filename, contents)?;
        Ok(filename.to_string())
    }
}
