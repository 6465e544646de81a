use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use troupe_core::error::{Result, TroupeError};
use troupe_core::types::{Task, TaskStatus};

use super::result::{TaskOutcome, TaskResult, CONTEXT_DIVIDER};

#[derive(Debug, Clone)]
struct Entry {
    task: Task,
    status: TaskStatus,
    result: Option<TaskResult>,
}

/// Tasks in insertion order plus their dependency edges and results.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from tasks in order. Does not validate.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task)?;
        }
        Ok(graph)
    }

    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.name) {
            return Err(TroupeError::DuplicateTask(task.name));
        }
        self.index.insert(task.name.clone(), self.entries.len());
        self.entries.push(Entry {
            task,
            status: TaskStatus::Pending,
            result: None,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.entry(name).map(|e| &e.task)
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.entries.iter().map(|e| &e.task)
    }

    pub fn status(&self, name: &str) -> Option<TaskStatus> {
        self.entry(name).map(|e| e.status)
    }

    pub fn result(&self, name: &str) -> Option<&TaskResult> {
        self.entry(name).and_then(|e| e.result.as_ref())
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| TroupeError::UnknownTask(name.to_string()))
    }

    /// Check dependencies and return a topological order (insertion order
    /// breaks ties).
    pub fn validate(&self) -> Result<Vec<String>> {
        for entry in &self.entries {
            for dep in &entry.task.context_tasks {
                if !self.index.contains_key(dep) {
                    return Err(TroupeError::UnknownDependency {
                        task: entry.task.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(TroupeError::CyclicDependency { cycle });
        }

        Ok(self.execution_order())
    }

    /// Positions of a task's dependencies. Unknown names are dropped; they
    /// are reported by `validate`.
    fn dependency_positions(&self, i: usize) -> Vec<usize> {
        self.entries[i]
            .task
            .context_tasks
            .iter()
            .filter_map(|d| self.index.get(d).copied())
            .collect()
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        // Edges point from a task to each task it depends on.
        let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(self.entries.len(), 0);
        let nodes: Vec<NodeIndex> = (0..self.entries.len()).map(|i| graph.add_node(i)).collect();
        for (i, node) in nodes.iter().enumerate() {
            for dep in self.dependency_positions(i) {
                graph.add_edge(*node, nodes[dep], ());
            }
        }

        let start = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || scc.iter().any(|n| graph.contains_edge(*n, *n))
            })
            .filter_map(|scc| scc.iter().map(|n| graph[*n]).min().map(|min| (min, scc)))
            .min_by_key(|(min, _)| *min)?;

        let (first, scc) = start;
        let members: HashSet<usize> = scc.iter().map(|n| graph[*n]).collect();
        let path = self.cycle_path(first, &members)?;
        Some(
            path.into_iter()
                .map(|i| self.entries[i].task.name.clone())
                .collect(),
        )
    }

    /// Walk dependency edges inside one strongly connected component from
    /// `start` back to itself. The returned path repeats `start` at the end.
    fn cycle_path(&self, start: usize, members: &HashSet<usize>) -> Option<Vec<usize>> {
        let mut first_deps = self.dependency_positions(start);
        first_deps.reverse();
        let mut stack: Vec<(usize, Vec<usize>)> = vec![(start, first_deps)];
        let mut visited = HashSet::from([start]);

        while let Some((_, pending)) = stack.last_mut() {
            let Some(next) = pending.pop() else {
                stack.pop();
                continue;
            };
            if next == start {
                let mut path: Vec<usize> = stack.iter().map(|(node, _)| *node).collect();
                path.push(start);
                return Some(path);
            }
            if !members.contains(&next) || !visited.insert(next) {
                continue;
            }
            let mut deps = self.dependency_positions(next);
            deps.reverse();
            stack.push((next, deps));
        }
        None
    }

    /// Kahn order, insertion order breaking ties. No checks: unknown
    /// dependencies are ignored, and tasks on or behind a cycle are absent.
    pub fn execution_order(&self) -> Vec<String> {
        let mut in_degree: Vec<usize> = (0..self.entries.len())
            .map(|i| self.dependency_positions(i).len())
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.entries.len()];
        for i in 0..self.entries.len() {
            for dep in self.dependency_positions(i) {
                dependents[dep].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.entries.len());

        while let Some(i) = ready.pop_first() {
            order.push(self.entries[i].task.name.clone());
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        order
    }

    fn deps_completed(&self, entry: &Entry) -> bool {
        entry
            .task
            .context_tasks
            .iter()
            .all(|d| self.status(d) == Some(TaskStatus::Completed))
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.entry(name)
            .map(|e| e.status == TaskStatus::Pending && self.deps_completed(e))
            .unwrap_or(false)
    }

    /// Pending tasks whose dependencies have all completed, in insertion
    /// order. Evaluated lazily against the graph's current state; call again
    /// after recording results to restart.
    pub fn ready_tasks(&self) -> ReadyTasks<'_> {
        ReadyTasks {
            graph: self,
            cursor: 0,
        }
    }

    pub fn mark_running(&mut self, name: &str) -> Result<()> {
        self.transition(name, TaskStatus::Pending, TaskStatus::Running)
    }

    /// Return a task that was marked running but never started to pending.
    pub fn release(&mut self, name: &str) -> Result<()> {
        self.transition(name, TaskStatus::Running, TaskStatus::Pending)
    }

    fn transition(&mut self, name: &str, from: TaskStatus, to: TaskStatus) -> Result<()> {
        let i = self.position(name)?;
        let entry = &mut self.entries[i];
        if entry.status != from {
            return Err(TroupeError::InvalidTransition {
                task: name.to_string(),
                from: entry.status.to_string(),
                to: to.to_string(),
            });
        }
        entry.status = to;
        Ok(())
    }

    /// Assign the executing agent of a task that has not started yet.
    pub fn set_agent_override(&mut self, name: &str, agent: impl Into<String>) -> Result<()> {
        let i = self.position(name)?;
        let entry = &mut self.entries[i];
        if entry.status != TaskStatus::Pending {
            return Err(TroupeError::InvalidTransition {
                task: name.to_string(),
                from: entry.status.to_string(),
                to: "reassigned".into(),
            });
        }
        entry.task.agent_override = Some(agent.into());
        Ok(())
    }

    /// Record the outcome of a task. Returns the names of tasks that became
    /// `skipped` because of it.
    pub fn record_result(&mut self, name: &str, outcome: TaskOutcome) -> Result<Vec<String>> {
        let i = self.position(name)?;
        if self.entries[i].status.is_terminal() {
            return Err(TroupeError::AlreadyCompleted(name.to_string()));
        }

        let entry = &mut self.entries[i];
        let (status, output, error, error_kind, elapsed_ms) = match outcome {
            TaskOutcome::Completed { output, elapsed_ms } => {
                (TaskStatus::Completed, Some(output), None, None, elapsed_ms)
            }
            TaskOutcome::Failed {
                error,
                kind,
                elapsed_ms,
            } => (TaskStatus::Failed, None, Some(error), kind, elapsed_ms),
        };
        entry.status = status;
        entry.result = Some(TaskResult {
            task: entry.task.name.clone(),
            status,
            output,
            error,
            error_kind,
            upstream: entry.task.context_tasks.clone(),
            elapsed_ms,
            async_execution: entry.task.async_execution,
        });
        debug!(task = %name, status = %status, "Recorded task result");

        if status == TaskStatus::Failed {
            Ok(self.propagate_skips())
        } else {
            Ok(Vec::new())
        }
    }

    /// Mark every pending task with a failed or skipped dependency as skipped,
    /// until nothing changes.
    fn propagate_skips(&mut self) -> Vec<String> {
        let mut skipped = Vec::new();
        loop {
            let mut changed = false;
            for i in 0..self.entries.len() {
                if self.entries[i].status != TaskStatus::Pending {
                    continue;
                }
                let blocker = self.entries[i].task.context_tasks.iter().find_map(|d| {
                    match self.status(d) {
                        Some(s @ (TaskStatus::Failed | TaskStatus::Skipped)) => {
                            Some(format!("dependency '{}' {}", d, s))
                        }
                        _ => None,
                    }
                });
                let Some(cause) = blocker else {
                    continue;
                };

                let entry = &mut self.entries[i];
                entry.status = TaskStatus::Skipped;
                entry.result = Some(TaskResult {
                    task: entry.task.name.clone(),
                    status: TaskStatus::Skipped,
                    output: None,
                    error: Some(cause),
                    error_kind: Some("dependency_failed".into()),
                    upstream: entry.task.context_tasks.clone(),
                    elapsed_ms: 0,
                    async_execution: entry.task.async_execution,
                });
                skipped.push(entry.task.name.clone());
                changed = true;
            }
            if !changed {
                break;
            }
        }
        skipped
    }

    /// Results of the task's declared dependencies, in declaration order.
    pub fn upstream_results(&self, name: &str) -> Vec<&TaskResult> {
        self.task(name)
            .map(|t| {
                t.context_tasks
                    .iter()
                    .filter_map(|d| self.result(d))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Concatenated output of the task's declared dependencies.
    pub fn dependency_context(&self, name: &str) -> String {
        self.upstream_results(name)
            .into_iter()
            .filter_map(|r| r.raw())
            .collect::<Vec<_>>()
            .join(CONTEXT_DIVIDER)
    }

    /// No task is pending or running.
    pub fn is_settled(&self) -> bool {
        self.entries.iter().all(|e| e.status.is_terminal())
    }

    /// Names of tasks still pending, in insertion order.
    pub fn pending(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.status == TaskStatus::Pending)
            .map(|e| e.task.name.clone())
            .collect()
    }

    /// A result for every task in insertion order; tasks that never ran get
    /// a result carrying their current status.
    pub fn results(&self) -> Vec<TaskResult> {
        self.entries
            .iter()
            .map(|e| {
                e.result.clone().unwrap_or_else(|| TaskResult {
                    task: e.task.name.clone(),
                    status: e.status,
                    output: None,
                    error: None,
                    error_kind: None,
                    upstream: e.task.context_tasks.clone(),
                    elapsed_ms: 0,
                    async_execution: e.task.async_execution,
                })
            })
            .collect()
    }
}

/// Lazy iterator over ready tasks. See [`TaskGraph::ready_tasks`].
pub struct ReadyTasks<'a> {
    graph: &'a TaskGraph,
    cursor: usize,
}

impl<'a> Iterator for ReadyTasks<'a> {
    type Item = &'a Task;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.graph.entries.get(self.cursor) {
            self.cursor += 1;
            if entry.status == TaskStatus::Pending && self.graph.deps_completed(entry) {
                return Some(&entry.task);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskOutput;

    fn task(name: &str, deps: &[&str]) -> Task {
        Task::new(name, format!("do {}", name))
            .with_agent("worker")
            .with_context(deps.iter().map(|d| d.to_string()).collect())
    }

    fn done(raw: &str) -> TaskOutcome {
        TaskOutcome::completed(TaskOutput::new(raw, "worker"), 1)
    }

    fn ready_names(graph: &TaskGraph) -> Vec<String> {
        graph.ready_tasks().map(|t| t.name.clone()).collect()
    }

    #[test]
    fn duplicate_task_rejected() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("a", &[])).unwrap();
        let err = graph.add_task(task("a", &[])).unwrap_err();
        assert!(matches!(err, TroupeError::DuplicateTask(name) if name == "a"));
    }

    #[test]
    fn unknown_dependency_named() {
        let graph = TaskGraph::from_tasks([task("a", &["ghost"])]).unwrap();
        match graph.validate().unwrap_err() {
            TroupeError::UnknownDependency { task, dependency } => {
                assert_eq!(task, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn two_node_cycle_named() {
        let graph = TaskGraph::from_tasks([
            task("root", &[]),
            task("a", &["b"]),
            task("b", &["a"]),
        ])
        .unwrap();
        match graph.validate().unwrap_err() {
            TroupeError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "b", "a"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn self_dependency_is_cycle() {
        let graph = TaskGraph::from_tasks([task("a", &["a"])]).unwrap();
        match graph.validate().unwrap_err() {
            TroupeError::CyclicDependency { cycle } => assert_eq!(cycle, vec!["a", "a"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn longer_cycle_path_follows_dependencies() {
        let graph = TaskGraph::from_tasks([
            task("a", &["c"]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("d", &["a"]),
        ])
        .unwrap();
        match graph.validate().unwrap_err() {
            TroupeError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "c", "b", "a"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn topological_order_breaks_ties_by_insertion() {
        let graph = TaskGraph::from_tasks([
            task("report", &["research", "data"]),
            task("research", &[]),
            task("data", &[]),
        ])
        .unwrap();
        assert_eq!(graph.validate().unwrap(), vec!["research", "data", "report"]);
    }

    #[test]
    fn execution_order_stops_at_a_cycle() {
        let graph = TaskGraph::from_tasks([
            task("root", &[]),
            task("a", &["root", "b"]),
            task("b", &["a"]),
            task("after", &["b"]),
            task("side", &["root"]),
        ])
        .unwrap();
        assert_eq!(graph.execution_order(), vec!["root", "side"]);
        assert!(graph.validate().is_err());
    }

    #[test]
    fn ready_tasks_follow_completion() {
        let mut graph =
            TaskGraph::from_tasks([task("a", &[]), task("b", &["a"]), task("c", &[])]).unwrap();
        assert_eq!(ready_names(&graph), vec!["a", "c"]);

        graph.mark_running("a").unwrap();
        assert_eq!(ready_names(&graph), vec!["c"]);

        graph.record_result("a", done("A")).unwrap();
        assert_eq!(ready_names(&graph), vec!["b", "c"]);
        assert!(graph.is_ready("b"));
    }

    #[test]
    fn record_result_twice_rejected() {
        let mut graph = TaskGraph::from_tasks([task("a", &[])]).unwrap();
        graph.record_result("a", done("A")).unwrap();
        let err = graph.record_result("a", done("again")).unwrap_err();
        assert!(matches!(err, TroupeError::AlreadyCompleted(_)));
        assert_eq!(graph.result("a").unwrap().raw(), Some("A"));

        let err = graph.record_result("nope", done("x")).unwrap_err();
        assert!(matches!(err, TroupeError::UnknownTask(_)));
    }

    #[test]
    fn failure_skips_dependents_transitively() {
        let mut graph = TaskGraph::from_tasks([
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("d", &[]),
        ])
        .unwrap();
        let skipped = graph
            .record_result("a", TaskOutcome::failed("llm down", 3))
            .unwrap();
        assert_eq!(skipped, vec!["b", "c"]);
        assert_eq!(graph.status("c"), Some(TaskStatus::Skipped));
        assert_eq!(graph.status("d"), Some(TaskStatus::Pending));
        assert_eq!(
            graph.result("b").unwrap().error.as_deref(),
            Some("dependency 'a' failed")
        );
        assert_eq!(
            graph.result("c").unwrap().error.as_deref(),
            Some("dependency 'b' skipped")
        );
        assert!(graph.ready_tasks().all(|t| t.name == "d"));
    }

    #[test]
    fn release_returns_running_to_pending() {
        let mut graph = TaskGraph::from_tasks([task("a", &[])]).unwrap();
        graph.mark_running("a").unwrap();
        assert!(graph.mark_running("a").is_err());
        graph.release("a").unwrap();
        assert_eq!(graph.status("a"), Some(TaskStatus::Pending));
    }

    #[test]
    fn dependency_context_concatenates_in_declared_order() {
        let mut graph = TaskGraph::from_tasks([
            task("a", &[]),
            task("b", &[]),
            task("c", &["b", "a"]),
        ])
        .unwrap();
        graph.record_result("a", done("alpha")).unwrap();
        graph.record_result("b", done("beta")).unwrap();
        assert_eq!(
            graph.dependency_context("c"),
            format!("beta{}alpha", CONTEXT_DIVIDER)
        );
        assert_eq!(graph.dependency_context("a"), "");
    }

    #[test]
    fn results_cover_every_task() {
        let mut graph = TaskGraph::from_tasks([task("a", &[]), task("b", &["a"])]).unwrap();
        graph.record_result("a", done("A")).unwrap();
        let results = graph.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, TaskStatus::Completed);
        assert_eq!(results[1].status, TaskStatus::Pending);
        assert_eq!(results[1].upstream, vec!["a"]);
        assert!(!graph.is_settled());
        assert_eq!(graph.pending(), vec!["b"]);
    }

    #[test]
    fn override_only_before_start() {
        let mut graph = TaskGraph::from_tasks([task("a", &[])]).unwrap();
        graph.set_agent_override("a", "specialist").unwrap();
        assert_eq!(graph.task("a").unwrap().assigned_agent(), Some("specialist"));
        graph.mark_running("a").unwrap();
        assert!(graph.set_agent_override("a", "other").is_err());
    }
}
