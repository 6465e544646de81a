//! Task graph: tasks, their `context_tasks` dependencies, and results.
//!
//! The `TaskGraph` keeps tasks in insertion order. Validation rejects unknown
//! dependencies and cycles before anything runs; `ready_tasks()` yields the
//! pending tasks whose dependencies have all completed, in insertion order.
//! A failed task marks its pending dependents `skipped`, transitively.

pub mod result;
pub mod task_graph;

pub use result::{TaskOutcome, TaskOutput, TaskResult, CONTEXT_DIVIDER};
pub use task_graph::{ReadyTasks, TaskGraph};
