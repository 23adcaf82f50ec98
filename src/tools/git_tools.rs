//! Git-query tools: worktree status and log, scoped read-only so the
//! orchestrator can inspect progress without needing approval.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Command;

use crate::errors::{AgentermError, Result};
use crate::git::GitController;
use crate::tools::{CallContext, Tool, ToolResult};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WorktreePathArgs {
    worktree_path: PathBuf,
}

pub struct GetWorktreeGitStatusTool;

#[async_trait]
impl Tool for GetWorktreeGitStatusTool {
    fn name(&self) -> &'static str {
        "get_worktree_git_status"
    }
    fn is_mutating(&self) -> bool {
        false
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: WorktreePathArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let git = GitController::new(args.worktree_path.clone());
        let has_changes = git
            .has_changes()
            .map_err(|e| AgentermError::SubprocessError { command: "git status".into(), detail: e.to_string() })?;
        let diff = git
            .diff_full()
            .map_err(|e| AgentermError::SubprocessError { command: "git diff".into(), detail: e.to_string() })?;
        Ok(ToolResult::success(serde_json::json!({"has_changes": has_changes, "diff": diff})))
    }
}

pub struct GetWorktreeGitLogTool;

#[async_trait]
impl Tool for GetWorktreeGitLogTool {
    fn name(&self) -> &'static str {
        "get_worktree_git_log"
    }
    fn is_mutating(&self) -> bool {
        false
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: WorktreePathArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let output = Command::new("git")
            .current_dir(&args.worktree_path)
            .args(["log", "--format=%H %s", "-n", "20"])
            .output()
            .map_err(|e| AgentermError::SubprocessError { command: "git log".into(), detail: e.to_string() })?;
        let log = String::from_utf8_lossy(&output.stdout).to_string();
        Ok(ToolResult::success(serde_json::json!({"log": log})))
    }
}
