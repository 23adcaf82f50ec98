//! File read/write tools, confined to a worktree's own directory tree.
//!
//! Every path is resolved relative to `worktree_path` and canonicalized,
//! then checked to still be a descendant of that root — rejecting `..`
//! escapes and absolute-path overrides before any filesystem access.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::{AgentermError, Result};
use crate::tools::{CallContext, Tool, ToolResult};

/// Resolves `relative` against `root` by rejecting any `..`/absolute/prefix
/// component before joining, so the result can never climb above `root`
/// regardless of whether the target file exists yet (write case).
fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel_path = Path::new(relative);
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(AgentermError::ValidationError(format!(
                    "path '{relative}' escapes worktree root"
                )));
            }
        }
    }
    Ok(root.join(rel_path))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadFileArgs {
    worktree_path: String,
    path: String,
}

/// Reads a file's contents, confined to within `worktree_path`.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }
    fn is_mutating(&self) -> bool {
        false
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: ReadFileArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let resolved = resolve_within(Path::new(&args.worktree_path), &args.path)?;
        let contents = std::fs::read_to_string(&resolved)
            .map_err(|e| AgentermError::ValidationError(format!("cannot read '{}': {e}", args.path)))?;
        Ok(ToolResult::success(serde_json::json!({"path": args.path, "contents": contents})))
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteFileArgs {
    worktree_path: String,
    path: String,
    contents: String,
}

/// Writes a file's contents within `worktree_path`, creating parent
/// directories as needed. Mutating, so it goes through the same
/// approval gate as every other write tool (§4.8).
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }
    fn is_mutating(&self) -> bool {
        true
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: WriteFileArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let root = Path::new(&args.worktree_path);
        let resolved = resolve_within(root, &args.path)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentermError::ValidationError(format!("cannot create parent dirs: {e}")))?;
        }
        std::fs::write(&resolved, &args.contents)
            .map_err(|e| AgentermError::ValidationError(format!("cannot write '{}': {e}", args.path)))?;
        Ok(ToolResult::success(serde_json::json!({"path": args.path, "bytes_written": args.contents.len()})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx() -> CallContext {
        CallContext {
            project_id: "p1".into(),
            task_id: None,
            playbook_id: None,
            stage: None,
            plan_approved: true,
        }
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let worktree_path = tmp.path().to_string_lossy().to_string();

        let write_args = serde_json::json!({
            "worktree_path": worktree_path, "path": "notes/TASK.md", "contents": "do the thing",
        });
        let write_result = WriteFileTool.call(&ctx(), write_args).await.unwrap();
        assert!(write_result.success);

        let read_args = serde_json::json!({"worktree_path": worktree_path, "path": "notes/TASK.md"});
        let read_result = ReadFileTool.call(&ctx(), read_args).await.unwrap();
        assert_eq!(read_result.output["contents"], "do the thing");
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let tmp = TempDir::new().unwrap();
        let worktree_path = tmp.path().to_string_lossy().to_string();
        let args = serde_json::json!({
            "worktree_path": worktree_path, "path": "../../etc/passwd", "contents": "x",
        });
        let err = WriteFileTool.call(&ctx(), args).await.unwrap_err();
        assert!(matches!(err, AgentermError::ValidationError(_)));
    }
}
