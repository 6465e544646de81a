use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use troupe_core::error::{Result, TroupeError};
use troupe_core::session::Session;
use troupe_core::traits::{LlmCaller, NoTools, ToolContext, ToolExecutor};
use troupe_core::types::*;

/// Per-invocation inputs for an agent run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub task: String,
    pub session: Session,
    pub cancel: CancellationToken,
    pub max_turns: usize,
}

/// How an agent run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentTurn {
    /// The agent produced a final answer.
    Finished {
        output: String,
        messages: Vec<ChatMessage>,
    },
    /// The agent asked to transfer control to another agent.
    Handoff {
        target: String,
        filter: Option<String>,
        messages: Vec<ChatMessage>,
    },
}

/// An agent: immutable profile plus the collaborators it calls.
#[derive(Clone)]
pub struct Agent {
    profile: Arc<AgentProfile>,
    llm: Arc<dyn LlmCaller>,
    tools: Arc<dyn ToolExecutor>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("profile", &self.profile)
            .finish()
    }
}

impl Agent {
    pub fn new(profile: AgentProfile, llm: Arc<dyn LlmCaller>) -> Self {
        Self {
            profile: Arc::new(profile),
            llm,
            tools: Arc::new(NoTools),
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = tools;
        self
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    /// Run the agent until it answers, hands off, or runs out of turns.
    ///
    /// Ordinary tool calls are executed and their results appended to the
    /// conversation. A tool executor `Err` fails the run; a `ToolResult` with
    /// `is_error` is fed back to the model. When a turn contains a handoff,
    /// the first handoff wins and the run ends after the turn's ordinary
    /// calls have executed.
    pub async fn run(&self, mut messages: Vec<ChatMessage>, ctx: &RunContext) -> Result<AgentTurn> {
        for turn in 0..ctx.max_turns {
            if ctx.cancel.is_cancelled() {
                return Err(TroupeError::Cancelled);
            }

            debug!(agent = %self.name(), task = %ctx.task, turn, "Starting agent turn");

            let response = tokio::select! {
                r = self.llm.invoke(&self.profile, messages.clone(), ctx.cancel.clone()) => r?,
                _ = ctx.cancel.cancelled() => return Err(TroupeError::Cancelled),
            };

            if response.tool_calls.is_empty() {
                messages.push(ChatMessage::assistant_text(response.text.clone()));
                return Ok(AgentTurn::Finished {
                    output: response.text,
                    messages,
                });
            }

            messages.push(ChatMessage::assistant_with_tools(
                &response.text,
                &response.tool_calls,
            ));

            let mut handoff: Option<(String, Option<String>)> = None;
            for raw in &response.tool_calls {
                match ToolCall::classify(raw) {
                    ToolCall::Ordinary { id, name, args } => {
                        let result = self.execute_tool(&name, args, ctx).await?;
                        messages.push(ChatMessage::tool_result(
                            id,
                            result.content,
                            result.is_error,
                        ));
                    }
                    ToolCall::Handoff {
                        id,
                        target_agent,
                        filter,
                    } => {
                        if handoff.is_some() {
                            warn!(
                                agent = %self.name(),
                                target = %target_agent,
                                "Ignoring extra handoff in the same turn"
                            );
                            messages.push(ChatMessage::tool_result(
                                id,
                                "Multiple handoffs requested; only the first is followed.",
                                true,
                            ));
                            continue;
                        }
                        messages.push(ChatMessage::tool_result(
                            id,
                            format!("Transferred to {}.", target_agent),
                            false,
                        ));
                        handoff = Some((target_agent, filter));
                    }
                }
            }

            if let Some((target, filter)) = handoff {
                debug!(agent = %self.name(), target = %target, "Agent requested handoff");
                return Ok(AgentTurn::Handoff {
                    target,
                    filter,
                    messages,
                });
            }
        }

        Err(TroupeError::MaxTurnsExceeded(ctx.max_turns))
    }

    async fn execute_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: &RunContext,
    ) -> Result<ToolResult> {
        if !self.profile.allows_tool(name) {
            warn!(agent = %self.name(), tool = %name, "Tool not permitted for agent");
            return Ok(ToolResult::error(format!(
                "Tool '{}' is not available to agent '{}'",
                name,
                self.name()
            )));
        }

        let tool_ctx = ToolContext {
            agent: self.name().to_string(),
            task: ctx.task.clone(),
            session: ctx.session.clone(),
            cancel: ctx.cancel.clone(),
        };

        tokio::select! {
            r = self.tools.execute(name, args, tool_ctx) => r,
            _ = ctx.cancel.cancelled() => Err(TroupeError::Cancelled),
        }
    }
}

/// Agents addressable by name.
#[derive(Debug, Clone, Default)]
pub struct AgentRoster {
    agents: HashMap<String, Agent>,
}

impl AgentRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any agent with the same name.
    pub fn register(&mut self, agent: Agent) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn with(mut self, agent: Agent) -> Self {
        self.register(agent);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Agent> {
        self.agents.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Agent> {
        self.get(name)
            .ok_or_else(|| TroupeError::UnknownAgent(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Agent names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
