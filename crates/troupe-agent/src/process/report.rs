use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use troupe_core::types::TaskStatus;

use crate::graph::TaskResult;

/// Summary of one executor run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub mode: String,
    /// One result per task, in insertion order.
    pub results: Vec<TaskResult>,
    /// Task whose failure stopped a sequential run.
    #[serde(default)]
    pub halted_by: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
    /// Output of the last task that completed, in insertion order.
    #[serde(default)]
    pub final_output: Option<String>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub(crate) fn new(mode: &str, results: Vec<TaskResult>, elapsed_ms: u64) -> Self {
        let final_output = results
            .iter()
            .rev()
            .find_map(|r| r.raw().map(String::from));
        Self {
            mode: mode.to_string(),
            results,
            halted_by: None,
            cancelled: false,
            final_output,
            elapsed_ms,
        }
    }

    pub fn get(&self, task: &str) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.task == task)
    }

    pub fn status(&self, task: &str) -> Option<TaskStatus> {
        self.get(task).map(|r| r.status)
    }

    /// Raw outputs of completed tasks, by name.
    pub fn outputs(&self) -> BTreeMap<String, String> {
        self.results
            .iter()
            .filter_map(|r| r.raw().map(|raw| (r.task.clone(), raw.to_string())))
            .collect()
    }

    /// Every task completed.
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|r| r.status == TaskStatus::Completed)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}
