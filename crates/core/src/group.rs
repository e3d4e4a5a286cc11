//! Task groups: named bundles presenting one dependency surface.

use crate::error::GraphError;
use crate::task::Task;
use crate::types::{NodeState, TaskId};
use std::collections::HashSet;

/// A named, ordered collection of tasks with fixed internal edges.
///
/// To the enclosing graph a group behaves like a single node: incoming edges
/// land on its entry set and outgoing edges leave from its exit set.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    id: String,
    tooltip: Option<String>,
    members: Vec<Task>,
    edges: Vec<(TaskId, TaskId)>,
}

impl TaskGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tooltip: None,
            members: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_tooltip(mut self, tooltip: impl Into<String>) -> Self {
        self.tooltip = Some(tooltip.into());
        self
    }

    /// Append a member. Members keep their insertion order.
    pub fn add_task(&mut self, task: Task) -> Result<(), GraphError> {
        if self.members.iter().any(|m| m.id() == task.id()) {
            return Err(GraphError::DuplicateNode(task.id().to_string()));
        }
        self.members.push(task);
        Ok(())
    }

    pub fn task(mut self, task: Task) -> Result<Self, GraphError> {
        self.add_task(task)?;
        Ok(self)
    }

    /// Declare that member `from` must complete before member `to`.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        for node in [from, to] {
            if !self.contains(node) {
                return Err(GraphError::NotAMember {
                    group: self.id.clone(),
                    node: node.to_string(),
                });
            }
        }
        if from == to {
            return Err(GraphError::SelfLoop(from.to_string()));
        }
        let edge = (TaskId::new(from), TaskId::new(to));
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
        Ok(())
    }

    /// Link members in sequence: `a -> b -> c`.
    pub fn chain(&mut self, ids: &[&str]) -> Result<(), GraphError> {
        for pair in ids.windows(2) {
            self.add_edge(pair[0], pair[1])?;
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tooltip(&self) -> Option<&str> {
        self.tooltip.as_deref()
    }

    pub fn members(&self) -> &[Task] {
        &self.members
    }

    /// Declared edges plus those implied by members naming fellow members
    /// as `upstream`.
    pub fn internal_edges(&self) -> Vec<(TaskId, TaskId)> {
        let mut edges = self.edges.clone();
        for member in &self.members {
            for up in member.upstream() {
                let edge = (up.clone(), member.id().clone());
                if self.contains(up.as_str()) && !edges.contains(&edge) {
                    edges.push(edge);
                }
            }
        }
        edges
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|m| m.id().as_str() == id)
    }

    /// Members with no internal predecessor, in member order.
    pub fn entry_nodes(&self) -> Vec<TaskId> {
        let edges = self.internal_edges();
        let targets: HashSet<&TaskId> = edges.iter().map(|(_, to)| to).collect();
        self.members
            .iter()
            .map(|m| m.id())
            .filter(|id| !targets.contains(id))
            .cloned()
            .collect()
    }

    /// Members with no internal successor, in member order.
    pub fn exit_nodes(&self) -> Vec<TaskId> {
        let edges = self.internal_edges();
        let sources: HashSet<&TaskId> = edges.iter().map(|(from, _)| from).collect();
        self.members
            .iter()
            .map(|m| m.id())
            .filter(|id| !sources.contains(id))
            .cloned()
            .collect()
    }

    pub(crate) fn into_parts(self) -> (String, Vec<Task>, Vec<(TaskId, TaskId)>) {
        let edges = self.internal_edges();
        (self.id, self.members, edges)
    }
}

/// Derive a group's state from its members' states.
///
/// Failed if any member Failed; Succeeded iff all Succeeded; Skipped if all
/// members are terminal and at least one was Skipped; otherwise the least
/// advanced non-terminal state.
pub fn group_state(members: &[NodeState]) -> NodeState {
    if members.contains(&NodeState::Failed) {
        NodeState::Failed
    } else if members.iter().all(|s| *s == NodeState::Succeeded) {
        NodeState::Succeeded
    } else if members.iter().all(|s| s.is_terminal()) {
        NodeState::Skipped
    } else if members.contains(&NodeState::Running) {
        NodeState::Running
    } else if members.contains(&NodeState::Ready) {
        NodeState::Ready
    } else {
        NodeState::Pending
    }
}
