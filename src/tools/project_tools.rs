//! Project CRUD tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::errors::{AgentermError, Result};
use crate::store::{ProjectRecord, Store};
use crate::tools::{CallContext, Tool, ToolResult};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateProjectArgs {
    id: String,
    name: String,
    repo_path: String,
    #[serde(default)]
    playbook_id: Option<String>,
}

/// Creates a project together with its default orchestrator-history row in
/// one atomic commit, per §4.8's transactional guarantee.
pub struct CreateProjectTool {
    pub store: Arc<Mutex<Store>>,
}

#[async_trait]
impl Tool for CreateProjectTool {
    fn name(&self) -> &'static str {
        "create_project"
    }
    fn is_mutating(&self) -> bool {
        true
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: CreateProjectArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let project = ProjectRecord {
            id: args.id.clone(),
            name: args.name,
            repo_path: args.repo_path,
            status: "active".to_string(),
            playbook_id: args.playbook_id,
        };
        let mut store = self.store.lock().await;
        store.create_project_with_default_orchestrator(&project)?;
        Ok(ToolResult::success(serde_json::json!({"project_id": args.id})))
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GetProjectArgs {
    id: String,
}

pub struct GetProjectTool {
    pub store: Arc<Mutex<Store>>,
}

#[async_trait]
impl Tool for GetProjectTool {
    fn name(&self) -> &'static str {
        "get_project"
    }
    fn is_mutating(&self) -> bool {
        false
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: GetProjectArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let store = self.store.lock().await;
        let history = store.recent_history(&args.id, 20)?;
        Ok(ToolResult::success(serde_json::json!({
            "project_id": args.id,
            "recent_history": history,
        })))
    }
}
