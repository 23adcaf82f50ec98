//! Tool Surface
//!
//! The bounded set of primitive actions the Orchestrator Kernel may invoke.
//! Each tool validates its inputs, enforces stage policy, and returns a
//! structured `ToolResult` — the same success/failure constructor shape as
//! the `CloudLLM-ai-cloudllm` example's `tool_protocol::ToolResult`
//! (`ToolResult::success(..)` / `ToolResult::failure(..)`), generalized from
//! one toolchain's JSON envelope to this crate's own tool set.

pub mod file_tools;
pub mod git_tools;
pub mod project_tools;
pub mod session_tools;
pub mod task_tools;
pub mod worktree_tools;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{AgentermError, Result};
use crate::playbook::PlaybookEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: serde_json::Value,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ToolResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self { success: true, output, error: None, metadata: HashMap::new() }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, output: serde_json::Value::Null, error: Some(error.into()), metadata: HashMap::new() }
    }
}

/// Context identifying which (project, task, stage) a tool call is running
/// under, so the registry can enforce the stage's tool whitelist before the
/// tool itself runs.
pub struct CallContext {
    pub project_id: String,
    pub task_id: Option<String>,
    pub playbook_id: Option<String>,
    pub stage: Option<String>,
    pub plan_approved: bool,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    /// Whether this tool mutates state (requires an approved plan) or is read-only.
    fn is_mutating(&self) -> bool;
    async fn call(&self, ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult>;
}

/// Registry of tools, keyed by name, enforcing stage policy before dispatch.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<&'static str, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn known_tool_names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    /// Invoke `tool_name` under `ctx`, enforcing:
    /// - stage whitelist, if `ctx.stage` and a `playbook_engine` are given
    /// - approval gate for mutating tools outside an approved plan
    pub async fn invoke(
        &self,
        tool_name: &str,
        ctx: &CallContext,
        arguments: serde_json::Value,
        playbook_engine: Option<&PlaybookEngine>,
    ) -> Result<ToolResult> {
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| AgentermError::NotFound { kind: "tool", id: tool_name.to_string() })?;

        if let (Some(playbook_id), Some(stage_name), Some(engine)) =
            (&ctx.playbook_id, &ctx.stage, playbook_engine)
        {
            let resolution = engine.resolve(playbook_id, stage_name)?;
            if !resolution.stage.allowed_tools.iter().any(|t| t == tool_name) {
                return Err(AgentermError::StageToolNotAllowed {
                    stage: stage_name.clone(),
                    tool: tool_name.to_string(),
                    reason: "tool not in stage whitelist".to_string(),
                });
            }
        }

        if tool.is_mutating() && !ctx.plan_approved {
            return Err(AgentermError::ApprovalRequired {
                reason: format!("{tool_name} mutates state and requires an approved plan"),
            });
        }

        tool.call(ctx, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn is_mutating(&self) -> bool {
            false
        }
        async fn call(&self, _ctx: &CallContext, arguments: serde_json::Value) -> Result<ToolResult> {
            Ok(ToolResult::success(arguments))
        }
    }

    struct WriteTool;

    #[async_trait]
    impl Tool for WriteTool {
        fn name(&self) -> &'static str {
            "write"
        }
        fn is_mutating(&self) -> bool {
            true
        }
        async fn call(&self, _ctx: &CallContext, _arguments: serde_json::Value) -> Result<ToolResult> {
            Ok(ToolResult::success(serde_json::json!({"wrote": true})))
        }
    }

    fn ctx(plan_approved: bool) -> CallContext {
        CallContext {
            project_id: "p1".into(),
            task_id: None,
            playbook_id: None,
            stage: None,
            plan_approved,
        }
    }

    #[tokio::test]
    async fn test_read_only_tool_runs_without_approval() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        let result = registry
            .invoke("echo", &ctx(false), serde_json::json!({"x": 1}), None)
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_mutating_tool_requires_approval() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(WriteTool));
        let err = registry.invoke("write", &ctx(false), serde_json::json!({}), None).await.unwrap_err();
        assert!(matches!(err, AgentermError::ApprovalRequired { .. }));
    }

    #[tokio::test]
    async fn test_mutating_tool_runs_when_approved() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(WriteTool));
        let result = registry.invoke("write", &ctx(true), serde_json::json!({}), None).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_unknown_tool_errors() {
        let registry = ToolRegistry::new();
        let err = registry.invoke("nope", &ctx(true), serde_json::json!({}), None).await.unwrap_err();
        assert!(matches!(err, AgentermError::NotFound { .. }));
    }
}
