use crate::error::ErrorDetail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a task within a workflow graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of a database connection known to the host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connection id plus the database to use on it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub connection: ConnectionId,
    pub database: Option<String>,
}

impl ConnectionTarget {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: ConnectionId::new(connection),
            database: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

impl std::fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.database {
            Some(db) => write!(f, "{}/{}", self.connection, db),
            None => write!(f, "{}", self.connection),
        }
    }
}

/// Value bound to a template parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Named parameters bound to a task's template.
///
/// Ordered so that reports and debug output are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, ParamValue>);

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// Returns a new set where entries from `overrides` replace entries in `self`.
    pub fn overlay(&self, overrides: &ParameterSet) -> ParameterSet {
        let mut merged = self.0.clone();
        for (name, value) in &overrides.0 {
            merged.insert(name.clone(), value.clone());
        }
        ParameterSet(merged)
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A single column value moving between databases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
        }
    }
}

/// A result row: column names paired positionally with values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
    }
}

/// Kind of work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Empty,
    Statement,
    Transfer,
}

/// When a node may run given the terminal states of its predecessors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    /// Every predecessor Succeeded.
    #[default]
    AllSuccess,
    /// All predecessors are terminal and at least one Succeeded.
    OneSuccess,
}

/// Per-node state inside a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// What a successful task produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutput {
    Empty,
    Statement { rows_affected: u64 },
    Transfer { rows_transferred: u64 },
}

/// Host-supplied inputs for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    /// Merged under every task's own parameter set.
    pub parameters: ParameterSet,
    pub triggered_at: DateTime<Utc>,
    pub external_run_id: Option<String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            parameters: ParameterSet::new(),
            triggered_at: Utc::now(),
            external_run_id: None,
        }
    }

    pub fn with_parameters(mut self, parameters: ParameterSet) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_external_run_id(mut self, id: impl Into<String>) -> Self {
        self.external_run_id = Some(id.into());
        self
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Execution record for a single task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: TaskId,
    pub group: Option<String>,
    pub state: NodeState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<TaskOutput>,
    pub error: Option<ErrorDetail>,
}

impl NodeExecution {
    pub fn pending(id: TaskId, group: Option<String>) -> Self {
        Self {
            id,
            group,
            state: NodeState::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
        }
    }
}

/// Derived status of a task group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupReport {
    pub id: String,
    pub state: NodeState,
}

/// A workflow run; returned to the host once terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_id: String,
    pub external_run_id: Option<String>,
    pub status: RunStatus,
    pub cancelled: bool,
    pub triggered_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeExecution>,
    pub groups: Vec<GroupReport>,
}

/// What [`Executor::run`](crate::workflow::Executor::run) hands back to the host.
pub type RunResult = Run;

impl Run {
    pub fn node(&self, id: &str) -> Option<&NodeExecution> {
        self.nodes.iter().find(|n| n.id.as_str() == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut NodeExecution> {
        self.nodes.iter_mut().find(|n| n.id.as_str() == id)
    }

    pub fn state_of(&self, id: &str) -> Option<NodeState> {
        self.node(id).map(|n| n.state)
    }

    pub fn group(&self, id: &str) -> Option<&GroupReport> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Succeeded iff every node Succeeded.
    pub fn aggregate_status(&self) -> RunStatus {
        if self.nodes.iter().all(|n| n.state == NodeState::Succeeded) {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }

    pub fn count_in(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|n| n.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_prefers_overrides() {
        let base = ParameterSet::new().with("table", "base").with("db", "test");
        let task = ParameterSet::new().with("table", "airflow_test");

        let merged = base.overlay(&task);
        assert_eq!(merged.get("table"), Some(&ParamValue::from("airflow_test")));
        assert_eq!(merged.get("db"), Some(&ParamValue::from("test")));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_param_value_rendering() {
        assert_eq!(ParamValue::from(1i64).to_string(), "1");
        assert_eq!(ParamValue::from(2.5f64).to_string(), "2.5");
        assert_eq!(ParamValue::from("a").to_string(), "a");
    }

    #[test]
    fn test_parameter_set_from_toml_values() {
        let params: ParameterSet = toml::from_str("table = \"t\"\nval1 = 1\nratio = 0.5").unwrap();
        assert_eq!(params.get("val1"), Some(&ParamValue::Integer(1)));
        assert_eq!(params.get("ratio"), Some(&ParamValue::Float(0.5)));
        assert_eq!(params.get("table"), Some(&ParamValue::from("t")));
    }

    #[test]
    fn test_row_lookup_is_case_insensitive() {
        let row = Row::new(vec!["A".into()], vec![SqlValue::Integer(1)]);
        assert_eq!(row.get("a"), Some(&SqlValue::Integer(1)));
        assert_eq!(row.get("b"), None);
    }

    #[test]
    fn test_text_value_is_quoted() {
        assert_eq!(SqlValue::Text("it's".into()).to_string(), "'it''s'");
        assert_eq!(SqlValue::Null.to_string(), "NULL");
    }
}
