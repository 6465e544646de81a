use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TroupeError {
    // Graph construction errors
    #[error("Duplicate task: {0}")]
    DuplicateTask(String),

    #[error("Cyclic task dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Task already completed: {0}")]
    AlreadyCompleted(String),

    #[error("Task '{task}' cannot move from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Task '{0}' has no agent assigned")]
    MissingAgent(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    // Handoff routing errors
    #[error("Handoff cycle: {} -> {target}", .chain.join(" -> "))]
    HandoffCycle { chain: Vec<String>, target: String },

    #[error("Handoff depth exceeded: {hops} hops requested, max {max_depth}")]
    HandoffDepth { max_depth: usize, hops: usize },

    #[error("Handoff time budget exhausted after {elapsed:?}")]
    HandoffTimeout { elapsed: Duration },

    #[error("Agent '{source_agent}' may not hand off to '{target}'")]
    HandoffNotPermitted { source_agent: String, target: String },

    #[error("Unknown handoff input filter: {0}")]
    UnknownFilter(String),

    // Hierarchical process errors
    #[error("Manager plan error: {0}")]
    ManagerPlan(String),

    // Execution errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Agent exceeded max turns ({0})")]
    MaxTurnsExceeded(usize),

    #[error("Execution cancelled")]
    Cancelled,

    // Session errors
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TroupeError {
    /// Build-time invariant and plan errors abort a run; everything else is
    /// recorded on the task that hit it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateTask(_)
                | Self::CyclicDependency { .. }
                | Self::UnknownDependency { .. }
                | Self::MissingAgent(_)
                | Self::ManagerPlan(_)
                | Self::Config(_)
        )
    }

    /// Short reason tag for a rejected handoff, `None` for non-routing errors.
    pub fn rejection_reason(&self) -> Option<&'static str> {
        match self {
            Self::HandoffCycle { .. } => Some("cycle"),
            Self::HandoffDepth { .. } => Some("depth"),
            Self::HandoffTimeout { .. } => Some("timeout"),
            Self::HandoffNotPermitted { .. } => Some("not_permitted"),
            Self::UnknownFilter(_) => Some("unknown_filter"),
            Self::UnknownAgent(_) => Some("unknown_agent"),
            _ => None,
        }
    }
}

impl TroupeError {
    /// Stable snake_case name of the variant, recorded on failed tasks.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateTask(_) => "duplicate_task",
            Self::CyclicDependency { .. } => "cyclic_dependency",
            Self::UnknownDependency { .. } => "unknown_dependency",
            Self::UnknownTask(_) => "unknown_task",
            Self::AlreadyCompleted(_) => "already_completed",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::MissingAgent(_) => "missing_agent",
            Self::UnknownAgent(_) => "unknown_agent",
            Self::HandoffCycle { .. } => "handoff_cycle",
            Self::HandoffDepth { .. } => "handoff_depth",
            Self::HandoffTimeout { .. } => "handoff_timeout",
            Self::HandoffNotPermitted { .. } => "handoff_not_permitted",
            Self::UnknownFilter(_) => "unknown_filter",
            Self::ManagerPlan(_) => "manager_plan",
            Self::LlmRequest(_) => "llm_request",
            Self::ToolExecution { .. } => "tool_execution",
            Self::MaxTurnsExceeded(_) => "max_turns_exceeded",
            Self::Cancelled => "cancelled",
            Self::UnknownSession(_) => "unknown_session",
            Self::Config(_) => "config",
            Self::ConfigNotFound(_) => "config_not_found",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, TroupeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_names_every_task() {
        let err = TroupeError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic task dependency: a -> b -> a");
        assert!(err.is_fatal());
    }

    #[test]
    fn rejection_reasons() {
        let err = TroupeError::HandoffDepth {
            max_depth: 2,
            hops: 3,
        };
        assert_eq!(err.rejection_reason(), Some("depth"));
        assert!(!err.is_fatal());

        let err = TroupeError::LlmRequest("boom".into());
        assert_eq!(err.rejection_reason(), None);
    }

    #[test]
    fn kinds_tell_routing_errors_apart() {
        let cycle = TroupeError::HandoffCycle {
            chain: vec!["a".into(), "b".into()],
            target: "a".into(),
        };
        let timeout = TroupeError::HandoffTimeout {
            elapsed: Duration::ZERO,
        };
        assert_eq!(cycle.kind(), "handoff_cycle");
        assert_eq!(timeout.kind(), "handoff_timeout");
        assert_eq!(TroupeError::Cancelled.kind(), "cancelled");
    }
}
