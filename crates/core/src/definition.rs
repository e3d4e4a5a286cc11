//! TOML workflow definitions.
//!
//! A definition is a plain description of builder calls: loading one goes
//! through [`WorkflowGraph`] and [`TaskGroup`] exactly as code would.

use crate::error::{DefinitionError, GraphError};
use crate::group::TaskGroup;
use crate::task::Task;
use crate::transfer::TransferSpec;
use crate::types::{ConnectionTarget, ParameterSet, TriggerRule};
use crate::workflow::WorkflowGraph;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level workflow file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub groups: Vec<GroupDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    #[serde(flatten)]
    pub action: ActionDefinition,
    #[serde(default)]
    pub params: ParameterSet,
    #[serde(default)]
    pub upstream: Vec<String>,
    #[serde(default)]
    pub trigger_rule: TriggerRule,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Task body, selected by `kind`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionDefinition {
    Empty,
    Statement {
        connection: String,
        #[serde(default)]
        database: Option<String>,
        sql: String,
    },
    Transfer {
        source: String,
        #[serde(default)]
        source_database: Option<String>,
        destination: String,
        #[serde(default)]
        destination_database: Option<String>,
        sql: String,
        destination_table: String,
        #[serde(default)]
        preoperator: Vec<String>,
        #[serde(default)]
        batch_size: Option<usize>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDefinition {
    pub id: String,
    #[serde(default)]
    pub tooltip: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    /// Internal edges as `[from, to]` pairs.
    #[serde(default)]
    pub edges: Vec<(String, String)>,
}

/// `from` must complete before every node in `to`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from: String,
    pub to: Vec<String>,
}

fn target(connection: String, database: Option<String>) -> ConnectionTarget {
    match database {
        Some(db) => ConnectionTarget::new(connection).with_database(db),
        None => ConnectionTarget::new(connection),
    }
}

impl TaskDefinition {
    pub fn into_task(self) -> Task {
        let task = match self.action {
            ActionDefinition::Empty => Task::empty(self.id),
            ActionDefinition::Statement { connection, database, sql } => {
                Task::statement(self.id, target(connection, database), sql)
            }
            ActionDefinition::Transfer {
                source,
                source_database,
                destination,
                destination_database,
                sql,
                destination_table,
                preoperator,
                batch_size,
            } => {
                let mut spec = TransferSpec::new(
                    target(source, source_database),
                    target(destination, destination_database),
                    sql,
                    destination_table,
                );
                for statement in preoperator {
                    spec = spec.with_preoperator(statement);
                }
                if let Some(size) = batch_size {
                    spec = spec.with_batch_size(size);
                }
                Task::transfer(self.id, spec)
            }
        };

        let task = task
            .with_params(self.params)
            .with_upstream(self.upstream)
            .with_trigger_rule(self.trigger_rule);
        match self.timeout_secs {
            Some(secs) => task.with_timeout(Duration::from_secs(secs)),
            None => task,
        }
    }
}

impl GroupDefinition {
    pub fn into_group(self) -> Result<TaskGroup, GraphError> {
        let mut group = TaskGroup::new(self.id);
        if let Some(tooltip) = self.tooltip {
            group = group.with_tooltip(tooltip);
        }
        for task in self.tasks {
            group.add_task(task.into_task())?;
        }
        for (from, to) in &self.edges {
            group.add_edge(from, to)?;
        }
        Ok(group)
    }
}

impl WorkflowDefinition {
    pub fn from_toml(content: &str) -> Result<Self, DefinitionError> {
        Ok(toml::from_str(content)?)
    }

    /// Build the graph: tasks, then groups, then edges, in file order.
    pub fn into_graph(self) -> Result<WorkflowGraph, GraphError> {
        let mut graph = WorkflowGraph::new(self.id).with_tags(self.tags);

        for task in self.tasks {
            graph.add_task(task.into_task())?;
        }
        for group in self.groups {
            graph.add_group(group.into_group()?)?;
        }
        for edge in &self.edges {
            graph.add_edges(&edge.from, edge.to.iter().map(String::as_str))?;
        }

        Ok(graph)
    }
}

/// Parse a TOML definition and build its graph.
pub fn load_graph(content: &str) -> Result<WorkflowGraph, DefinitionError> {
    let graph = WorkflowDefinition::from_toml(content)?.into_graph()?;
    tracing::debug!("Loaded workflow {} with {} task(s)", graph.id(), graph.len());
    Ok(graph)
}
