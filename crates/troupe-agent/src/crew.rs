use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use troupe_core::config::{AppConfig, ProcessMode};
use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::{EventSink, LlmCaller, ToolExecutor};

use crate::agent::{Agent, AgentRoster};
use crate::graph::TaskGraph;
use crate::handoff::FilterRegistry;
use crate::process::{ProcessExecutor, RunReport};

/// A crew built from a config file: agents, tasks and the process to run
/// them with.
pub struct Crew {
    executor: ProcessExecutor,
    graph: TaskGraph,
    mode: ProcessMode,
}

impl Crew {
    /// Build the roster, the task graph, and an executor from `config`.
    ///
    /// Every agent shares `llm` and `tools`. The graph is validated here so a
    /// bad definition fails before anything is invoked.
    pub fn from_config(
        config: &AppConfig,
        llm: Arc<dyn LlmCaller>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Result<Self> {
        let mut roster = AgentRoster::new();
        for profile in &config.agents {
            if roster.contains(&profile.name) {
                return Err(TroupeError::Config(format!(
                    "duplicate agent '{}'",
                    profile.name
                )));
            }
            roster.register(Agent::new(profile.clone(), llm.clone()).with_tools(tools.clone()));
        }

        let graph = TaskGraph::from_tasks(config.tasks.iter().cloned())?;
        graph.validate()?;

        info!(
            agents = roster.len(),
            tasks = graph.len(),
            mode = config.process.name(),
            "Crew assembled"
        );

        Ok(Self {
            executor: ProcessExecutor::from_config(roster, config),
            graph,
            mode: config.process.clone(),
        })
    }

    /// Load a crew definition from a TOML file.
    pub fn load(
        path: &Path,
        llm: Arc<dyn LlmCaller>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Result<Self> {
        let config = AppConfig::load(path)?;
        Self::from_config(&config, llm, tools)
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.executor = self.executor.with_sink(sink);
        self
    }

    pub fn with_filters(mut self, filters: FilterRegistry) -> Self {
        self.executor = self.executor.with_filters(filters);
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn mode(&self) -> &ProcessMode {
        &self.mode
    }

    pub fn executor(&self) -> &ProcessExecutor {
        &self.executor
    }

    /// Run every task. Results stay in the crew's graph afterwards.
    pub async fn kickoff(&mut self, cancel: CancellationToken) -> Result<RunReport> {
        self.executor.run(&mut self.graph, &self.mode, cancel).await
    }
}
