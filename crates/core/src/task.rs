//! Schedulable units of work.

use crate::connection::ConnectionProvider;
use crate::error::TaskError;
use crate::template::Template;
use crate::transfer::{GenericTransfer, TransferSpec};
use crate::types::{ConnectionTarget, ParameterSet, TaskId, TaskKind, TaskOutput, TriggerRule};
use std::sync::Arc;
use std::time::Duration;

/// What a task does when it runs
#[derive(Debug, Clone)]
pub enum TaskAction {
    /// Marker node; succeeds without touching a database.
    Empty,
    /// Resolve `sql` and submit it to `target`.
    Statement { target: ConnectionTarget, sql: Template },
    /// Copy rows between two connections.
    Transfer(TransferSpec),
}

/// Everything a task needs from the run that executes it.
#[derive(Clone)]
pub struct TaskContext {
    pub connections: Arc<dyn ConnectionProvider>,
    /// Runtime parameters; the task's own parameter set is laid over these.
    pub runtime: ParameterSet,
    pub batch_size: usize,
}

/// A single unit of work in a workflow graph. Immutable once built.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    action: TaskAction,
    params: ParameterSet,
    upstream: Vec<TaskId>,
    trigger_rule: TriggerRule,
    timeout: Option<Duration>,
}

impl Task {
    fn with_action(id: impl Into<String>, action: TaskAction) -> Self {
        Self {
            id: TaskId::new(id),
            action,
            params: ParameterSet::new(),
            upstream: Vec::new(),
            trigger_rule: TriggerRule::default(),
            timeout: None,
        }
    }

    pub fn empty(id: impl Into<String>) -> Self {
        Self::with_action(id, TaskAction::Empty)
    }

    pub fn statement(
        id: impl Into<String>,
        target: ConnectionTarget,
        sql: impl Into<Template>,
    ) -> Self {
        Self::with_action(
            id,
            TaskAction::Statement {
                target,
                sql: sql.into(),
            },
        )
    }

    pub fn transfer(id: impl Into<String>, spec: TransferSpec) -> Self {
        Self::with_action(id, TaskAction::Transfer(spec))
    }

    pub fn with_params(mut self, params: ParameterSet) -> Self {
        self.params = params;
        self
    }

    /// Declare predecessors by id. Resolved when the graph is validated.
    pub fn with_upstream<I, S>(mut self, upstream: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upstream.extend(upstream.into_iter().map(TaskId::new));
        self
    }

    pub fn with_trigger_rule(mut self, rule: TriggerRule) -> Self {
        self.trigger_rule = rule;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn kind(&self) -> TaskKind {
        match self.action {
            TaskAction::Empty => TaskKind::Empty,
            TaskAction::Statement { .. } => TaskKind::Statement,
            TaskAction::Transfer(_) => TaskKind::Transfer,
        }
    }

    pub fn action(&self) -> &TaskAction {
        &self.action
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn upstream(&self) -> &[TaskId] {
        &self.upstream
    }

    pub fn trigger_rule(&self) -> TriggerRule {
        self.trigger_rule
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run the task once against the connections in `ctx`.
    ///
    /// Database side effects are not rolled back on failure.
    pub async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let params = ctx.runtime.overlay(&self.params);

        match &self.action {
            TaskAction::Empty => Ok(TaskOutput::Empty),
            TaskAction::Statement { target, sql } => {
                let statement = sql.resolve(&params)?;
                tracing::debug!(task = %self.id, connection = %target, "Submitting: {}", statement);

                let conn = ctx
                    .connections
                    .get_connection(target)
                    .await
                    .map_err(|e| TaskError::from_db(&target.connection.0, e))?;
                let rows_affected = conn
                    .execute(&statement)
                    .await
                    .map_err(|e| TaskError::from_db(&target.connection.0, e))?;

                Ok(TaskOutput::Statement { rows_affected })
            }
            TaskAction::Transfer(spec) => {
                let rows_transferred = GenericTransfer::new(spec, ctx.batch_size)
                    .run(ctx.connections.as_ref(), &params)
                    .await?;
                Ok(TaskOutput::Transfer { rows_transferred })
            }
        }
    }
}
