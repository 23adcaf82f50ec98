//! Task CRUD and reporting tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::errors::{AgentermError, Result};
use crate::store::{Store, TaskRecord};
use crate::tools::{CallContext, Tool, ToolResult};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteTaskSpecArgs {
    id: String,
    project_id: String,
    title: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    worktree_id: Option<String>,
}

pub struct WriteTaskSpecTool {
    pub store: Arc<Mutex<Store>>,
}

#[async_trait]
impl Tool for WriteTaskSpecTool {
    fn name(&self) -> &'static str {
        "write_task_spec"
    }
    fn is_mutating(&self) -> bool {
        true
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: WriteTaskSpecArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let task = TaskRecord {
            id: args.id.clone(),
            project_id: args.project_id,
            title: args.title,
            status: "pending".to_string(),
            worktree_id: args.worktree_id,
            depends_on: args.depends_on,
        };
        self.store.lock().await.upsert_task(&task)?;
        Ok(ToolResult::success(serde_json::json!({"task_id": args.id})))
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateTaskStatusArgs {
    id: String,
    status: String,
}

pub struct UpdateTaskStatusTool {
    pub store: Arc<Mutex<Store>>,
}

#[async_trait]
impl Tool for UpdateTaskStatusTool {
    fn name(&self) -> &'static str {
        "update_task_status"
    }
    fn is_mutating(&self) -> bool {
        true
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: UpdateTaskStatusArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let store = self.store.lock().await;
        let mut task = store
            .get_task(&args.id)?
            .ok_or_else(|| AgentermError::NotFound { kind: "task", id: args.id.clone() })?;

        if args.status == "running" {
            for dep_id in &task.depends_on {
                let dep = store
                    .get_task(dep_id)?
                    .ok_or_else(|| AgentermError::NotFound { kind: "task", id: dep_id.clone() })?;
                if dep.status != "completed" {
                    return Err(AgentermError::Conflict(format!(
                        "task {} cannot run: dependency {dep_id} is not completed",
                        args.id
                    )));
                }
            }
        }

        task.status = args.status;
        store.upsert_task(&task)?;
        Ok(ToolResult::success(serde_json::json!({"task_id": task.id, "status": task.status})))
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GenerateProgressReportArgs {
    project_id: String,
}

pub struct GenerateProgressReportTool {
    pub store: Arc<Mutex<Store>>,
}

#[async_trait]
impl Tool for GenerateProgressReportTool {
    fn name(&self) -> &'static str {
        "generate_progress_report"
    }
    fn is_mutating(&self) -> bool {
        false
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: GenerateProgressReportArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let store = self.store.lock().await;
        let history = store.recent_history(&args.project_id, 50)?;
        Ok(ToolResult::success(serde_json::json!({
            "project_id": args.project_id,
            "history_entries": history.len(),
        })))
    }
}
