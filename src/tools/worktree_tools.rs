//! Worktree CRUD and the git-status/git-log read tools live in `git_tools.rs`;
//! this module covers the creation/query side (§3's Worktree entity, §4.8).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::errors::{AgentermError, Result};
use crate::store::{ProjectRecord, Store, WorktreeRecord};
use crate::tools::{CallContext, Tool, ToolResult};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateWorktreeArgs {
    id: String,
    project_id: String,
    branch: String,
    path: String,
    #[serde(default)]
    task_id: Option<String>,
}

/// Registers a new worktree record. Enforces the §3 invariant that at most
/// one *active* worktree may exist per (project, branch) — the uniqueness
/// constraint itself lives in the store's schema (`UNIQUE(project_id, path)`
/// plus an active-branch check here), so a duplicate active branch surfaces
/// as `conflict` rather than a raw SQLite error.
pub struct CreateWorktreeTool {
    pub store: Arc<Mutex<Store>>,
}

#[async_trait]
impl Tool for CreateWorktreeTool {
    fn name(&self) -> &'static str {
        "create_worktree"
    }
    fn is_mutating(&self) -> bool {
        true
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: CreateWorktreeArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let store = self.store.lock().await;

        let active = store.list_active_worktrees()?;
        if active.iter().any(|w| w.project_id == args.project_id && w.branch == args.branch) {
            return Err(AgentermError::Conflict(format!(
                "an active worktree already exists for branch '{}' in project '{}'",
                args.branch, args.project_id
            )));
        }

        let worktree = WorktreeRecord {
            id: args.id.clone(),
            project_id: args.project_id,
            branch: args.branch,
            path: args.path,
            status: "active".to_string(),
            task_id: args.task_id,
        };
        store.upsert_worktree(&worktree)?;
        Ok(ToolResult::success(serde_json::json!({"worktree_id": args.id})))
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AbandonWorktreeArgs {
    id: String,
}

/// Transitions a worktree to `abandoned`. Terminal per §3: a worktree that
/// is already `merged` or `abandoned` cannot be abandoned again.
pub struct AbandonWorktreeTool {
    pub store: Arc<Mutex<Store>>,
}

#[async_trait]
impl Tool for AbandonWorktreeTool {
    fn name(&self) -> &'static str {
        "abandon_worktree"
    }
    fn is_mutating(&self) -> bool {
        true
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: AbandonWorktreeArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let store = self.store.lock().await;
        let mut worktree = store
            .list_active_worktrees()?
            .into_iter()
            .find(|w| w.id == args.id)
            .ok_or_else(|| AgentermError::NotFound { kind: "worktree", id: args.id.clone() })?;
        worktree.status = "abandoned".to_string();
        store.upsert_worktree(&worktree)?;
        Ok(ToolResult::success(serde_json::json!({"worktree_id": args.id, "status": "abandoned"})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    async fn test_create_worktree_rejects_duplicate_active_branch() {
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let project = ProjectRecord {
            id: "p1".to_string(),
            name: "Proj".to_string(),
            repo_path: "/tmp/p1".to_string(),
            status: "active".to_string(),
            playbook_id: None,
        };
        store.lock().await.create_project_with_default_orchestrator(&project).unwrap();
        let tool = CreateWorktreeTool { store };
        let args = serde_json::json!({
            "id": "w1", "project_id": "p1", "branch": "feature/x", "path": "/tmp/p1-wt",
        });
        let first = tool.call(&ctx(), args.clone()).await.unwrap();
        assert!(first.success);

        let dup = serde_json::json!({
            "id": "w2", "project_id": "p1", "branch": "feature/x", "path": "/tmp/p1-wt2",
        });
        let err = tool.call(&ctx(), dup).await.unwrap_err();
        assert!(matches!(err, AgentermError::Conflict(_)));
    }
}
