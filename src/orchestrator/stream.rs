//! Streamed orchestrator event types.
//!
//! Shape mirrors the `CloudLLM-ai-cloudllm` example's `EventHandler` /
//! `AgentEvent` callback pattern, collapsed here into one serializable enum
//! the Event Hub can forward straight to a viewer as JSON, since this
//! crate's orchestrator has one observer channel (the hub) rather than a
//! pluggable handler trait.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Token { run_id: String, delta: String },
    ToolCall { run_id: String, tool: String, arguments: serde_json::Value },
    ToolResult { run_id: String, tool: String, result: crate::tools::ToolResult },
    Done { run_id: String },
    Error { run_id: String, message: String },
}
