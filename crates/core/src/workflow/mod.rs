pub mod dag;
pub mod executor;
pub mod node_runner;

pub use dag::{ExecutionPlan, GroupLayout, WorkflowGraph};
pub use executor::Executor;
pub use node_runner::NodeOutcome;
