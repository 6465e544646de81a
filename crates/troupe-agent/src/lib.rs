pub mod agent;
pub mod crew;
pub mod graph;
pub mod handoff;
pub mod process;

pub use agent::{Agent, AgentRoster, AgentTurn, RunContext};
pub use crew::Crew;
pub use graph::{TaskGraph, TaskOutcome, TaskOutput, TaskResult, CONTEXT_DIVIDER};
pub use handoff::{
    FilterRegistry, HandoffBudget, HandoffRequest, HandoffResult, HandoffRouter, HandoffState,
    InputFilter,
};
pub use process::{
    parse_manager_output, task_output_key, Delegation, DelegationPlan, ManagerDirective,
    ProcessExecutor, RunReport,
};
