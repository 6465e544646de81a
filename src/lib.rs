//! Troupe: multi-agent orchestration.
//!
//! A crew is a set of agents and a graph of tasks. The [`ProcessExecutor`]
//! drives the graph in one of three process models (sequential, parallel, or
//! hierarchical with a manager agent), and agents can transfer control to each
//! other mid-task through the [`HandoffRouter`]. LLM access, tools, and
//! telemetry are injected through the [`LlmCaller`], [`ToolExecutor`] and
//! [`EventSink`] traits.

pub use troupe_agent::{
    parse_manager_output, task_output_key, Agent, AgentRoster, AgentTurn, Crew, Delegation,
    DelegationPlan, FilterRegistry, HandoffBudget, HandoffRequest, HandoffResult, HandoffRouter,
    HandoffState, InputFilter, ManagerDirective, ProcessExecutor, RunContext, RunReport,
    TaskGraph, TaskOutcome, TaskOutput, TaskResult, CONTEXT_DIVIDER,
};
pub use troupe_core::traits::{EventSink, LlmCaller, NoTools, ToolContext, ToolExecutor};
pub use troupe_core::{
    AgentEvent, AgentProfile, AppConfig, ChatMessage, ContentBlock, EventBus, ExecutorConfig,
    FanoutSink, HandoffConfig, LlmResponse, ProcessMode, RawToolCall, Result, Role, Scope,
    ScopedValue, Session, SessionArena, SessionId, Task, TaskStatus, ToolCall, ToolResult,
    TracingSink, TroupeError,
};
