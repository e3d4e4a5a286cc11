// Core types and functionality for the sqlflow workflow executor

pub mod config;
pub mod connection;
pub mod definition;
pub mod error;
pub mod events;
pub mod group;
pub mod task;
pub mod template;
pub mod transfer;
pub mod types;
pub mod workflow;

pub use types::*;

pub use config::ExecutorConfig;
pub use connection::{Connection, ConnectionProvider, MemoryConnectionProvider, MemoryDatabase};
pub use definition::WorkflowDefinition;
pub use error::{
    DbError, DefinitionError, ErrorDetail, ErrorKind, GraphError, ResolutionError, TaskError,
    TransferPhase,
};
pub use events::{Event, EventLog, EventType, MemoryEventLog};
pub use group::TaskGroup;
pub use task::{Task, TaskAction, TaskContext};
pub use template::{ParameterResolver, Template};
pub use transfer::{GenericTransfer, TransferSpec};
pub use workflow::{ExecutionPlan, Executor, WorkflowGraph};
