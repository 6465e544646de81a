use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use troupe_core::config::{AppConfig, ExecutorConfig, HandoffConfig, ProcessMode};
use troupe_core::error::{Result, TroupeError};
use troupe_core::event::TracingSink;
use troupe_core::session::{Session, SessionArena};
use troupe_core::traits::EventSink;
use troupe_core::types::{AgentEvent, AgentProfile, Task, TaskStatus};

use super::plan::{parse_manager_output, ManagerDirective};
use super::prompt::{manager_messages, task_messages};
use super::report::RunReport;
use crate::agent::{AgentRoster, AgentTurn, RunContext};
use crate::graph::{TaskGraph, TaskOutcome, TaskOutput};
use crate::handoff::{FilterRegistry, HandoffBudget, HandoffRequest, HandoffRouter};

/// Session key prefix under which task outputs are stored in the run's root
/// session.
pub const TASK_OUTPUT_PREFIX: &str = "task:";

pub fn task_output_key(task: &str) -> String {
    format!("{}{}", TASK_OUTPUT_PREFIX, task)
}

/// Drives a [`TaskGraph`] to completion under one [`ProcessMode`].
pub struct ProcessExecutor {
    agents: Arc<AgentRoster>,
    filters: Arc<FilterRegistry>,
    sessions: Arc<SessionArena>,
    sink: Arc<dyn EventSink>,
    config: ExecutorConfig,
    handoff: HandoffConfig,
}

impl ProcessExecutor {
    pub fn new(agents: AgentRoster) -> Self {
        Self {
            agents: Arc::new(agents),
            filters: Arc::new(FilterRegistry::with_builtins()),
            sessions: Arc::new(SessionArena::new()),
            sink: Arc::new(TracingSink),
            config: ExecutorConfig::default(),
            handoff: HandoffConfig::default(),
        }
    }

    /// Executor using the `[executor]` and `[handoff]` sections of `config`.
    pub fn from_config(agents: AgentRoster, config: &AppConfig) -> Self {
        Self::new(agents)
            .with_config(config.executor.clone())
            .with_handoff_config(config.handoff.clone())
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handoff_config(mut self, handoff: HandoffConfig) -> Self {
        self.handoff = handoff;
        self
    }

    pub fn with_filters(mut self, filters: FilterRegistry) -> Self {
        self.filters = Arc::new(filters);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionArena>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionArena> {
        &self.sessions
    }

    pub fn agents(&self) -> &Arc<AgentRoster> {
        &self.agents
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the graph in a fresh root session.
    ///
    /// The root session and everything under it is dropped afterwards unless
    /// `retain_sessions` is set.
    pub async fn run(
        &self,
        graph: &mut TaskGraph,
        mode: &ProcessMode,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let root = Session::root(&self.sessions);
        let report = self.run_in(graph, mode, &root, cancel).await;
        if !self.config.retain_sessions {
            if let Err(e) = self.sessions.remove(root.id()) {
                debug!(session = %root.id(), error = %e, "Root session already gone");
            }
        }
        report
    }

    /// Run the graph with `root` as the parent of every task session.
    ///
    /// Returns `Err` only for errors that prevent the run from starting and
    /// for manager plan errors. Task failures are reported in the
    /// [`RunReport`].
    pub async fn run_in(
        &self,
        graph: &mut TaskGraph,
        mode: &ProcessMode,
        root: &Session,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        if let Err(e) = self.preflight(graph, mode) {
            error!(mode = mode.name(), error = %e, "Run aborted before execution");
            return Err(e);
        }

        let started = Instant::now();
        info!(mode = mode.name(), tasks = graph.len(), "Run started");
        self.sink.emit(AgentEvent::RunStarted {
            mode: mode.name().to_string(),
            tasks: graph.len(),
        });

        let runner = TaskRunner {
            agents: self.agents.clone(),
            router: HandoffRouter::new(
                self.agents.clone(),
                self.filters.clone(),
                self.sink.clone(),
                self.config.max_turns,
            ),
            sink: self.sink.clone(),
            root: root.clone(),
            budget: HandoffBudget::new(self.handoff.max_depth, self.handoff.timeout()),
            max_turns: self.config.max_turns,
            retain_sessions: self.config.retain_sessions,
            cancel: cancel.clone(),
        };

        let progress = match mode {
            ProcessMode::Sequential => self.run_sequential(graph, &runner, None).await?,
            ProcessMode::Parallel => self.run_parallel(graph, &runner).await?,
            ProcessMode::Hierarchical { manager } => {
                match self.run_hierarchical(graph, &runner, manager).await {
                    Ok(progress) => progress,
                    Err(e) => {
                        error!(manager = %manager, error = %e, "Hierarchical run aborted");
                        return Err(e);
                    }
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut report = RunReport::new(mode.name(), graph.results(), elapsed_ms);
        report.halted_by = progress.halted_by;
        report.cancelled = progress.cancelled || cancel.is_cancelled();

        let completed = report.count(TaskStatus::Completed);
        let failed = report.count(TaskStatus::Failed);
        let skipped = report.count(TaskStatus::Skipped);
        info!(
            mode = mode.name(),
            completed,
            failed,
            skipped,
            elapsed_ms,
            "Run completed"
        );
        self.sink.emit(AgentEvent::RunCompleted {
            completed,
            failed,
            skipped,
            elapsed_ms,
        });

        Ok(report)
    }

    fn preflight(&self, graph: &TaskGraph, mode: &ProcessMode) -> Result<()> {
        self.config.validate()?;
        graph.validate()?;

        match mode {
            ProcessMode::Hierarchical { manager } => {
                self.agents.require(manager)?;
            }
            ProcessMode::Sequential | ProcessMode::Parallel => {
                for task in graph.tasks() {
                    if graph.status(&task.name) != Some(TaskStatus::Pending) {
                        continue;
                    }
                    let agent = task
                        .assigned_agent()
                        .ok_or_else(|| TroupeError::MissingAgent(task.name.clone()))?;
                    self.agents.require(agent)?;
                }
            }
        }
        Ok(())
    }

    /// One ready task at a time. `order` restricts the choice to the first
    /// ready task in that order instead of insertion order.
    async fn run_sequential(
        &self,
        graph: &mut TaskGraph,
        runner: &TaskRunner,
        order: Option<&[String]>,
    ) -> Result<Progress> {
        let mut progress = Progress::default();

        loop {
            if runner.cancel.is_cancelled() {
                progress.cancelled = true;
                break;
            }

            let next = match order {
                Some(order) => order.iter().find(|name| graph.is_ready(name)).cloned(),
                None => graph.ready_tasks().next().map(|t| t.name.clone()),
            };
            let Some(name) = next else {
                break;
            };

            graph.mark_running(&name)?;
            let (task, context) = prepare(graph, &name)?;
            let outcome = runner.run_task(task, context).await;
            let failed = outcome.is_failed();
            self.record(graph, &name, outcome)?;

            if failed && !self.config.continue_on_failure {
                warn!(task = %name, "Sequential run halted by failed task");
                progress.halted_by = Some(name);
                break;
            }
        }

        Ok(progress)
    }

    /// Every ready task at once, bounded by `max_workers`, until nothing is
    /// ready.
    async fn run_parallel(&self, graph: &mut TaskGraph, runner: &TaskRunner) -> Result<Progress> {
        let mut progress = Progress::default();
        let workers = Arc::new(Semaphore::new(self.config.max_workers));

        loop {
            if runner.cancel.is_cancelled() {
                progress.cancelled = true;
                break;
            }

            let ready: Vec<String> = graph.ready_tasks().map(|t| t.name.clone()).collect();
            if ready.is_empty() {
                break;
            }
            debug!(ready = ready.len(), "Dispatching ready set");

            let mut handles = Vec::with_capacity(ready.len());
            for name in &ready {
                graph.mark_running(name)?;
                let (task, context) = prepare(graph, name)?;
                let runner = runner.clone();
                let workers = workers.clone();
                handles.push(tokio::spawn(async move {
                    let permit = tokio::select! {
                        p = workers.acquire_owned() => p,
                        _ = runner.cancel.cancelled() => return Dispatch::NotStarted,
                    };
                    let Ok(_permit) = permit else {
                        return Dispatch::NotStarted;
                    };
                    if runner.cancel.is_cancelled() {
                        return Dispatch::NotStarted;
                    }
                    Dispatch::Ran(runner.run_task(task, context).await)
                }));
            }

            let joined = join_all(handles).await;
            for (name, dispatch) in ready.iter().zip(joined) {
                match dispatch {
                    Ok(Dispatch::Ran(outcome)) => self.record(graph, name, outcome)?,
                    Ok(Dispatch::NotStarted) => {
                        graph.release(name)?;
                        progress.cancelled = true;
                    }
                    Err(e) => {
                        error!(task = %name, error = %e, "Task worker panicked");
                        runner.sink.emit(AgentEvent::TaskFailed {
                            task: name.clone(),
                            error: e.to_string(),
                        });
                        let outcome = TaskOutcome::failed(e.to_string(), 0).with_kind("panicked");
                        self.record(graph, name, outcome)?;
                    }
                }
            }

            if progress.cancelled {
                break;
            }
        }

        Ok(progress)
    }

    async fn run_hierarchical(
        &self,
        graph: &mut TaskGraph,
        runner: &TaskRunner,
        manager_name: &str,
    ) -> Result<Progress> {
        let manager = self.agents.require(manager_name)?.clone();

        let workers: Vec<&AgentProfile> = self
            .agents
            .names()
            .into_iter()
            .filter(|name| *name != manager_name)
            .filter_map(|name| self.agents.get(name).map(|a| a.profile()))
            .collect();
        let pending: Vec<&Task> = graph
            .tasks()
            .filter(|t| graph.status(&t.name) == Some(TaskStatus::Pending))
            .collect();
        let messages = manager_messages(manager.profile(), &pending, &workers);

        let session = runner.root.child(true)?;
        let ctx = RunContext {
            task: format!("plan:{}", manager_name),
            session: session.clone(),
            cancel: runner.cancel.clone(),
            max_turns: self.config.max_turns,
        };
        let turn = manager.run(messages, &ctx).await;
        runner.cleanup(&session);

        let output = match turn {
            Ok(AgentTurn::Finished { output, .. }) => output,
            Ok(AgentTurn::Handoff { target, .. }) => {
                return Err(TroupeError::ManagerPlan(format!(
                    "manager attempted a handoff to '{}'",
                    target
                )));
            }
            Err(TroupeError::Cancelled) => {
                return Ok(Progress {
                    cancelled: true,
                    halted_by: None,
                });
            }
            Err(e) => {
                return Err(TroupeError::ManagerPlan(format!("manager failed: {}", e)));
            }
        };

        match parse_manager_output(&output)? {
            ManagerDirective::Answer(answer) => {
                info!(manager = %manager_name, "Manager answered directly");
                let names: Vec<String> = graph.pending();
                for name in names {
                    runner.sink.emit(AgentEvent::TaskStarted {
                        task: name.clone(),
                        agent: manager_name.to_string(),
                    });
                    runner.store_output(&name, &answer);
                    runner.sink.emit(AgentEvent::TaskCompleted {
                        task: name.clone(),
                        agent: manager_name.to_string(),
                        elapsed_ms: 0,
                    });
                    self.record(
                        graph,
                        &name,
                        TaskOutcome::completed(TaskOutput::new(answer.clone(), manager_name), 0),
                    )?;
                }
                Ok(Progress::default())
            }
            ManagerDirective::Delegate(plan) => {
                plan.validate(graph, &self.agents)?;
                info!(
                    manager = %manager_name,
                    delegations = plan.delegations.len(),
                    independent = plan.independent,
                    "Manager delegated tasks"
                );
                self.sink.emit(AgentEvent::ManagerPlanned {
                    manager: manager_name.to_string(),
                    delegations: plan.delegations.len(),
                    independent: plan.independent,
                });

                for d in &plan.delegations {
                    graph.set_agent_override(&d.task, d.agent.clone())?;
                }

                if plan.independent {
                    self.run_parallel(graph, runner).await
                } else {
                    let order = plan.task_order();
                    self.run_sequential(graph, runner, Some(&order)).await
                }
            }
        }
    }

    fn record(&self, graph: &mut TaskGraph, name: &str, outcome: TaskOutcome) -> Result<()> {
        let skipped = graph.record_result(name, outcome)?;
        for task in skipped {
            let cause = graph
                .result(&task)
                .and_then(|r| r.error.clone())
                .unwrap_or_default();
            info!(task = %task, cause = %cause, "Task skipped");
            self.sink.emit(AgentEvent::TaskSkipped { task, cause });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Progress {
    halted_by: Option<String>,
    cancelled: bool,
}

enum Dispatch {
    NotStarted,
    Ran(TaskOutcome),
}

fn prepare(graph: &TaskGraph, name: &str) -> Result<(Task, String)> {
    let task = graph
        .task(name)
        .cloned()
        .ok_or_else(|| TroupeError::UnknownTask(name.to_string()))?;
    Ok((task, graph.dependency_context(name)))
}

/// Everything needed to run one task, cheap to clone into a worker.
#[derive(Clone)]
struct TaskRunner {
    agents: Arc<AgentRoster>,
    router: HandoffRouter,
    sink: Arc<dyn EventSink>,
    root: Session,
    budget: HandoffBudget,
    max_turns: usize,
    retain_sessions: bool,
    cancel: CancellationToken,
}

impl TaskRunner {
    async fn run_task(&self, task: Task, context: String) -> TaskOutcome {
        let started = Instant::now();
        let Some(agent_name) = task.assigned_agent().map(String::from) else {
            let e = TroupeError::MissingAgent(task.name.clone());
            return self.fail(&task.name, &e, 0);
        };

        self.sink.emit(AgentEvent::TaskStarted {
            task: task.name.clone(),
            agent: agent_name.clone(),
        });
        info!(task = %task.name, agent = %agent_name, "Task started");

        let session = match self.root.child(true) {
            Ok(s) => s,
            Err(e) => return self.fail(&task.name, &e, 0),
        };

        let result = self.execute(&task, &agent_name, &session, &context).await;
        self.cleanup(&session);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                self.store_output(&task.name, &output.raw);
                info!(task = %task.name, agent = %output.agent, elapsed_ms, "Task completed");
                self.sink.emit(AgentEvent::TaskCompleted {
                    task: task.name.clone(),
                    agent: output.agent.clone(),
                    elapsed_ms,
                });
                TaskOutcome::completed(output, elapsed_ms)
            }
            Err(e) => self.fail(&task.name, &e, elapsed_ms),
        }
    }

    async fn execute(
        &self,
        task: &Task,
        agent_name: &str,
        session: &Session,
        context: &str,
    ) -> Result<TaskOutput> {
        let agent = self.agents.require(agent_name)?;
        let messages = task_messages(agent.profile(), task, context);
        let ctx = RunContext {
            task: task.name.clone(),
            session: session.clone(),
            cancel: self.cancel.clone(),
            max_turns: self.max_turns,
        };

        match agent.run(messages, &ctx).await? {
            AgentTurn::Finished { output, .. } => Ok(TaskOutput::new(output, agent_name)),
            AgentTurn::Handoff {
                target,
                filter,
                messages,
            } => {
                let result = self
                    .router
                    .route(HandoffRequest {
                        source: agent_name.to_string(),
                        target,
                        filter,
                        session: session.clone(),
                        messages,
                        chain: vec![agent_name.to_string()],
                        budget: self.budget.with_fresh_depth(),
                        task: task.name.clone(),
                        cancel: self.cancel.clone(),
                    })
                    .await?;
                Ok(TaskOutput {
                    raw: result.output.clone(),
                    agent: result.agent().to_string(),
                    handoff_chain: result.chain,
                })
            }
        }
    }

    fn fail(&self, task: &str, error: &TroupeError, elapsed_ms: u64) -> TaskOutcome {
        warn!(task = %task, error = %error, elapsed_ms, "Task failed");
        self.sink.emit(AgentEvent::TaskFailed {
            task: task.to_string(),
            error: error.to_string(),
        });
        TaskOutcome::from_error(error, elapsed_ms)
    }

    fn store_output(&self, task: &str, raw: &str) {
        if let Err(e) = self
            .root
            .set(task_output_key(task), serde_json::Value::String(raw.to_string()))
        {
            warn!(task = %task, error = %e, "Could not store task output in session");
        }
    }

    fn cleanup(&self, session: &Session) {
        if self.retain_sessions {
            return;
        }
        if let Err(e) = session.arena().remove(session.id()) {
            debug!(session = %session.id(), error = %e, "Task session already gone");
        }
    }
}
