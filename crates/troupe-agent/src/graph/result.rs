use serde::{Deserialize, Serialize};

use troupe_core::error::TroupeError;
use troupe_core::types::TaskStatus;

/// Separator placed between dependency outputs when they are concatenated
/// into a task's context.
pub const CONTEXT_DIVIDER: &str = "\n\n----------\n\n";

/// Output payload of a completed task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutput {
    /// Final text produced for the task.
    pub raw: String,
    /// Agent that produced the final text.
    pub agent: String,
    /// Agents visited while producing it, starting with the task's own agent.
    pub handoff_chain: Vec<String>,
}

impl TaskOutput {
    pub fn new(raw: impl Into<String>, agent: impl Into<String>) -> Self {
        let agent = agent.into();
        Self {
            raw: raw.into(),
            handoff_chain: vec![agent.clone()],
            agent,
        }
    }
}

/// What the executor reports for one run of one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed { output: TaskOutput, elapsed_ms: u64 },
    Failed {
        error: String,
        kind: Option<String>,
        elapsed_ms: u64,
    },
}

impl TaskOutcome {
    pub fn completed(output: TaskOutput, elapsed_ms: u64) -> Self {
        Self::Completed { output, elapsed_ms }
    }

    pub fn failed(error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Failed {
            error: error.into(),
            kind: None,
            elapsed_ms,
        }
    }

    /// Failure carrying the error's message and [`TroupeError::kind`].
    pub fn from_error(error: &TroupeError, elapsed_ms: u64) -> Self {
        Self::Failed {
            error: error.to_string(),
            kind: Some(error.kind().to_string()),
            elapsed_ms,
        }
    }

    pub fn with_kind(self, kind: impl Into<String>) -> Self {
        match self {
            Self::Failed {
                error, elapsed_ms, ..
            } => Self::Failed {
                error,
                kind: Some(kind.into()),
                elapsed_ms,
            },
            completed => completed,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// The recorded result of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub output: Option<TaskOutput>,
    #[serde(default)]
    pub error: Option<String>,
    /// Machine-readable failure class: a [`TroupeError::kind`] for failed
    /// tasks, `dependency_failed` for skipped ones.
    #[serde(default)]
    pub error_kind: Option<String>,
    /// Upstream tasks this result was built from, in declaration order.
    #[serde(default)]
    pub upstream: Vec<String>,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub async_execution: bool,
}

impl TaskResult {
    pub fn raw(&self) -> Option<&str> {
        self.output.as_ref().map(|o| o.raw.as_str())
    }
}
