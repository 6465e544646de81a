use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TroupeError};
use crate::types::{AgentProfile, Task};

/// Top-level Troupe configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
    /// Process model used for the crew defined in this file.
    #[serde(default)]
    pub process: ProcessMode,
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently running tasks in parallel mode.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Keep going after a failed task in sequential mode.
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Maximum LLM turns per agent invocation.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Keep per-task sessions in the arena after the task finishes.
    #[serde(default)]
    pub retain_sessions: bool,
}

impl ExecutorConfig {
    /// Reject settings the executor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(TroupeError::Config(
                "executor.max_workers must be at least 1".into(),
            ));
        }
        if self.max_turns == 0 {
            return Err(TroupeError::Config(
                "executor.max_turns must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            continue_on_failure: false,
            max_turns: default_max_turns(),
            retain_sessions: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Maximum number of hops in one handoff chain.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Wall-clock allowance for the whole top-level invocation.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl HandoffConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_max_workers() -> usize { 4 }
fn default_max_turns() -> usize { 25 }
fn default_max_depth() -> usize { 5 }
fn default_timeout_secs() -> u64 { 600 }

/// How the executor schedules the task graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ProcessMode {
    #[default]
    Sequential,
    Parallel,
    Hierarchical {
        manager: String,
    },
}

impl ProcessMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Hierarchical { .. } => "hierarchical",
        }
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TroupeError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        Self::from_toml(&expanded)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| TroupeError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        self.executor.validate()
    }

    pub fn agent(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.iter().find(|a| a.name == name)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
