use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use troupe_core::error::{Result, TroupeError};
use troupe_core::types::TaskStatus;

use crate::agent::AgentRoster;
use crate::graph::TaskGraph;

/// One task assigned to one agent by the manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Delegation {
    pub task: String,
    pub agent: String,
}

/// The manager's assignment of every pending task in the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelegationPlan {
    pub delegations: Vec<Delegation>,
    /// Tasks may run concurrently.
    #[serde(default)]
    pub independent: bool,
}

impl DelegationPlan {
    /// Every pending task exactly once, nothing outside the graph, every
    /// agent known. Tasks that already finished must not be delegated.
    pub fn validate(&self, graph: &TaskGraph, agents: &AgentRoster) -> Result<()> {
        let mut seen = HashSet::new();
        for d in &self.delegations {
            let Some(status) = graph.status(&d.task) else {
                return Err(TroupeError::ManagerPlan(format!(
                    "unknown task '{}'",
                    d.task
                )));
            };
            if status != TaskStatus::Pending {
                return Err(TroupeError::ManagerPlan(format!(
                    "task '{}' is {} and cannot be delegated",
                    d.task, status
                )));
            }
            if !seen.insert(d.task.as_str()) {
                return Err(TroupeError::ManagerPlan(format!(
                    "task '{}' delegated more than once",
                    d.task
                )));
            }
            if !agents.contains(&d.agent) {
                return Err(TroupeError::ManagerPlan(format!(
                    "unknown agent '{}' for task '{}'",
                    d.agent, d.task
                )));
            }
        }

        let missing: Vec<String> = graph
            .pending()
            .into_iter()
            .filter(|name| !seen.contains(name.as_str()))
            .collect();
        if !missing.is_empty() {
            return Err(TroupeError::ManagerPlan(format!(
                "tasks not delegated: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Task names in plan order.
    pub fn task_order(&self) -> Vec<String> {
        self.delegations.iter().map(|d| d.task.clone()).collect()
    }
}

/// What the manager decided.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerDirective {
    /// The manager answered every task itself.
    Answer(String),
    Delegate(DelegationPlan),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDirective {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    delegations: Option<Vec<Delegation>>,
    #[serde(default)]
    independent: Option<bool>,
}

fn fenced_block() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z]*\s*\n?(.*?)```").expect("fenced block pattern is valid")
    })
}

/// Pull the JSON object out of the manager's reply.
fn extract_json(text: &str) -> Option<&str> {
    if let Some(body) = fenced_block().captures(text).and_then(|c| c.get(1)) {
        return Some(body.as_str().trim());
    }
    let trimmed = text.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (start < end).then(|| &trimmed[start..=end])
}

/// Parse the manager's reply into a directive.
pub fn parse_manager_output(text: &str) -> Result<ManagerDirective> {
    let json = extract_json(text)
        .ok_or_else(|| TroupeError::ManagerPlan("manager reply contains no JSON object".into()))?;

    let raw: RawDirective = serde_json::from_str(json).map_err(|e| {
        warn!(error = %e, "Failed to parse manager reply");
        TroupeError::ManagerPlan(format!("invalid manager reply: {}", e))
    })?;

    match (raw.answer, raw.delegations) {
        (Some(answer), None) => {
            if raw.independent.is_some() {
                return Err(TroupeError::ManagerPlan(
                    "'independent' only applies to delegations".into(),
                ));
            }
            Ok(ManagerDirective::Answer(answer))
        }
        (None, Some(delegations)) => Ok(ManagerDirective::Delegate(DelegationPlan {
            delegations,
            independent: raw.independent.unwrap_or(false),
        })),
        (Some(_), Some(_)) => Err(TroupeError::ManagerPlan(
            "manager reply has both 'answer' and 'delegations'".into(),
        )),
        (None, None) => Err(TroupeError::ManagerPlan(
            "manager reply has neither 'answer' nor 'delegations'".into(),
        )),
    }
}
