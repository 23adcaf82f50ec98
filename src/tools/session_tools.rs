//! Session interaction tools: send input, read output, check idle status.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::{AgentermError, Result};
use crate::hub::EventHub;
use crate::lifecycle::LifecycleManager;
use crate::parser::SessionStatus;
use crate::store::SessionRecord;
use crate::tools::{CallContext, Tool, ToolResult};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SendCommandArgs {
    session_id: String,
    keys: String,
}

pub struct SendCommandTool {
    pub lifecycle: Arc<LifecycleManager>,
}

#[async_trait]
impl Tool for SendCommandTool {
    fn name(&self) -> &'static str {
        "send_command"
    }
    fn is_mutating(&self) -> bool {
        true
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: SendCommandArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        self.lifecycle
            .send_command(&args.session_id, &args.keys)
            .await
            .map_err(|e| AgentermError::InternalError(e.to_string()))?;
        Ok(ToolResult::success(serde_json::json!({"sent": true})))
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadSessionOutputArgs {
    session_id: String,
    #[serde(default = "default_max_lines")]
    max_lines: usize,
}

fn default_max_lines() -> usize {
    100
}

pub struct ReadSessionOutputTool {
    pub lifecycle: Arc<LifecycleManager>,
}

#[async_trait]
impl Tool for ReadSessionOutputTool {
    fn name(&self) -> &'static str {
        "read_session_output"
    }
    fn is_mutating(&self) -> bool {
        false
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: ReadSessionOutputArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let lines = self.lifecycle.get_output(&args.session_id, args.max_lines).await;
        Ok(ToolResult::success(serde_json::json!({"lines": lines})))
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct IsSessionIdleArgs {
    session_id: String,
}

pub struct IsSessionIdleTool {
    pub lifecycle: Arc<LifecycleManager>,
}

#[async_trait]
impl Tool for IsSessionIdleTool {
    fn name(&self) -> &'static str {
        "is_session_idle"
    }
    fn is_mutating(&self) -> bool {
        false
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: IsSessionIdleArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let status = self.lifecycle.status(&args.session_id).await;
        let idle = matches!(status, Some(SessionStatus::Idle));
        Ok(ToolResult::success(serde_json::json!({"idle": idle, "status": status.map(|s| format!("{s:?}"))})))
    }
}

fn default_env() -> Vec<(String, String)> {
    Vec::new()
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateSessionArgs {
    id: String,
    task_id: String,
    agent_profile_id: String,
    role: String,
    command: Vec<String>,
    worktree_path: String,
    #[serde(default = "default_env")]
    env: Vec<(String, String)>,
}

/// Launches a new terminal session for a task's role and wires its output
/// through the Output Parser onward to the Event Hub, the only path (besides
/// a viewer's ad-hoc `new_session` websocket message) that can bring a
/// session into existence.
pub struct CreateSessionTool {
    pub lifecycle: Arc<LifecycleManager>,
    pub hub: Arc<EventHub>,
}

#[async_trait]
impl Tool for CreateSessionTool {
    fn name(&self) -> &'static str {
        "create_session"
    }
    fn is_mutating(&self) -> bool {
        true
    }
    async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
        let args: CreateSessionArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentermError::ValidationError(e.to_string()))?;
        let session = SessionRecord {
            id: args.id.clone(),
            task_id: Some(args.task_id),
            agent_profile_id: args.agent_profile_id,
            role: args.role,
            status: "working".to_string(),
            human_attached: false,
        };
        self.lifecycle
            .create_and_pump(&session, &args.command, Path::new(&args.worktree_path), &args.env, self.hub.clone())
            .await
            .map_err(|e| AgentermError::InternalError(e.to_string()))?;
        Ok(ToolResult::success(serde_json::json!({"session_id": args.id})))
    }
}
