use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable agent configuration.
///
/// The role/goal/backstory/instructions strings are opaque to the
/// orchestration layer and are handed to the [`LlmCaller`](crate::traits::LlmCaller)
/// as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub instructions: Option<String>,
    /// Agents this one may hand off to.
    #[serde(default)]
    pub handoffs: Vec<String>,
    /// Tool names this agent may call (empty = every tool the executor knows).
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn with_backstory(mut self, backstory: impl Into<String>) -> Self {
        self.backstory = backstory.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_handoffs(mut self, targets: Vec<String>) -> Self {
        self.handoffs = targets;
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn can_hand_off_to(&self, target: &str) -> bool {
        self.handoffs.iter().any(|t| t == target)
    }

    pub fn allows_tool(&self, tool: &str) -> bool {
        self.tools.is_empty() || self.tools.iter().any(|t| t == tool)
    }

    /// Render the profile as a system prompt.
    pub fn system_prompt(&self) -> String {
        let mut sections = Vec::new();
        if !self.role.is_empty() {
            sections.push(format!("You are {}.", self.role));
        }
        if !self.backstory.is_empty() {
            sections.push(self.backstory.clone());
        }
        if !self.goal.is_empty() {
            sections.push(format!("Your personal goal is: {}", self.goal));
        }
        if let Some(ref instructions) = self.instructions {
            sections.push(instructions.clone());
        }
        if sections.is_empty() {
            sections.push(format!("You are {}.", self.name));
        }
        sections.join("\n\n")
    }
}

/// A unit of work in a task graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expected_output: String,
    /// Owning agent.
    #[serde(default)]
    pub agent: Option<String>,
    /// Tasks whose output this task consumes, in declaration order.
    #[serde(default, alias = "context")]
    pub context_tasks: Vec<String>,
    /// Agent that executes the task instead of `agent` when set.
    #[serde(default)]
    pub agent_override: Option<String>,
    #[serde(default)]
    pub async_execution: bool,
}

impl Task {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = expected.into();
        self
    }

    pub fn with_context(mut self, tasks: Vec<String>) -> Self {
        self.context_tasks = tasks;
        self
    }

    pub fn with_agent_override(mut self, agent: impl Into<String>) -> Self {
        self.agent_override = Some(agent.into());
        self
    }

    pub fn with_async(mut self, async_execution: bool) -> Self {
        self.async_execution = async_execution;
        self
    }

    /// The agent that will actually run this task.
    pub fn assigned_agent(&self) -> Option<&str> {
        self.agent_override.as_deref().or(self.agent.as_deref())
    }
}

/// Lifecycle state of a task inside a graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn is_tool_record(&self) -> bool {
        matches!(self, Self::ToolUse { .. } | Self::ToolResult { .. })
    }
}

/// A chat message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text_with_role(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text_with_role(Role::User, text)
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::text_with_role(Role::Assistant, text)
    }

    fn text_with_role(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
            timestamp: Some(Utc::now()),
        }
    }

    /// Assistant turn carrying optional text plus the tool calls it requested.
    pub fn assistant_with_tools(text: &str, calls: &[RawToolCall]) -> Self {
        let mut content = Vec::with_capacity(calls.len() + 1);
        if !text.is_empty() {
            content.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
        for call in calls {
            content.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
        }
        Self {
            role: Role::Assistant,
            content,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }],
            timestamp: Some(Utc::now()),
        }
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Whether any block is a tool call or a tool result.
    pub fn has_tool_records(&self) -> bool {
        self.content.iter().any(ContentBlock::is_tool_record)
    }
}

/// A tool call exactly as the LLM produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl RawToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// What an [`LlmCaller`](crate::traits::LlmCaller) returns for one invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<RawToolCall>,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: vec![],
        }
    }

    pub fn with_tool_call(mut self, call: RawToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }
}

/// Tool name that signals a handoff request.
pub const HANDOFF_TOOL: &str = "handoff";

/// Prefix of the per-agent handoff tool names (`transfer_to_<agent>`).
pub const TRANSFER_PREFIX: &str = "transfer_to_";

/// A tool call after classification at the LLM boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    Ordinary {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    Handoff {
        id: String,
        target_agent: String,
        filter: Option<String>,
    },
}

impl ToolCall {
    /// Classify a raw call.
    ///
    /// `handoff` with `{"agent": .., "filter": ..}` and `transfer_to_<agent>`
    /// with an optional `{"filter": ..}` are handoffs; a `handoff` call without
    /// a string `agent` field stays ordinary so the executor reports it.
    pub fn classify(raw: &RawToolCall) -> Self {
        let filter = raw
            .input
            .get("filter")
            .and_then(|v| v.as_str())
            .map(String::from);

        if raw.name == HANDOFF_TOOL {
            if let Some(target) = raw.input.get("agent").and_then(|v| v.as_str()) {
                return Self::Handoff {
                    id: raw.id.clone(),
                    target_agent: target.to_string(),
                    filter,
                };
            }
        } else if let Some(target) = raw.name.strip_prefix(TRANSFER_PREFIX) {
            if !target.is_empty() {
                return Self::Handoff {
                    id: raw.id.clone(),
                    target_agent: target.to_string(),
                    filter,
                };
            }
        }

        Self::Ordinary {
            id: raw.id.clone(),
            name: raw.name.clone(),
            args: raw.input.clone(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Ordinary { id, .. } | Self::Handoff { id, .. } => id,
        }
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Lifecycle event emitted through an [`EventSink`](crate::traits::EventSink).
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    RunStarted {
        mode: String,
        tasks: usize,
    },
    TaskStarted {
        task: String,
        agent: String,
    },
    TaskCompleted {
        task: String,
        agent: String,
        elapsed_ms: u64,
    },
    TaskFailed {
        task: String,
        error: String,
    },
    TaskSkipped {
        task: String,
        cause: String,
    },
    HandoffRequested {
        source: String,
        target: String,
        depth: usize,
    },
    HandoffCompleted {
        source: String,
        target: String,
    },
    HandoffRejected {
        source: String,
        target: String,
        reason: String,
    },
    ManagerPlanned {
        manager: String,
        delegations: usize,
        independent: bool,
    },
    RunCompleted {
        completed: usize,
        failed: usize,
        skipped: usize,
        elapsed_ms: u64,
    },
}

impl AgentEvent {
    /// Wire name of the event, e.g. `task_started` or `handoff_rejected:cycle`.
    pub fn name(&self) -> String {
        match self {
            Self::RunStarted { .. } => "run_started".into(),
            Self::TaskStarted { .. } => "task_started".into(),
            Self::TaskCompleted { .. } => "task_completed".into(),
            Self::TaskFailed { .. } => "task_failed".into(),
            Self::TaskSkipped { .. } => "task_skipped".into(),
            Self::HandoffRequested { .. } => "handoff_requested".into(),
            Self::HandoffCompleted { .. } => "handoff_completed".into(),
            Self::HandoffRejected { reason, .. } => format!("handoff_rejected:{}", reason),
            Self::ManagerPlanned { .. } => "manager_planned".into(),
            Self::RunCompleted { .. } => "run_completed".into(),
        }
    }
}
