//! Process models: how a task graph is scheduled onto agents.

pub mod executor;
pub mod plan;
pub mod prompt;
pub mod report;

pub use executor::{task_output_key, ProcessExecutor, TASK_OUTPUT_PREFIX};
pub use plan::{parse_manager_output, Delegation, DelegationPlan, ManagerDirective};
pub use report::RunReport;
