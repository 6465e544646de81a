use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::session::Session;
use crate::types::*;

/// A single opaque LLM invocation. May be slow and may fail.
///
/// Implementations own any retry policy; the orchestration layer calls
/// `invoke` exactly once per agent turn.
pub trait LlmCaller: Send + Sync + 'static {
    fn invoke(
        &self,
        agent: &AgentProfile,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<LlmResponse>>;
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub agent: String,
    pub task: String,
    pub session: Session,
    pub cancel: CancellationToken,
}

/// Runs ordinary (non-handoff) tool calls.
pub trait ToolExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;
}

/// Sink for structured lifecycle events.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: AgentEvent);
}

/// Tool executor for agents that have no tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTools;

impl ToolExecutor for NoTools {
    fn execute(
        &self,
        name: &str,
        _args: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        let message = format!("Tool not available: {}", name);
        Box::pin(async move { Ok(ToolResult::error(message)) })
    }
}
