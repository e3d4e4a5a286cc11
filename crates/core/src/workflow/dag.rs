use crate::error::GraphError;
use crate::group::TaskGroup;
use crate::task::Task;
use crate::types::TaskId;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Flattened view of a task group inside a workflow graph
#[derive(Debug, Clone)]
pub struct GroupLayout {
    pub id: String,
    pub tooltip: Option<String>,
    pub members: Vec<TaskId>,
    pub entry: Vec<TaskId>,
    pub exit: Vec<TaskId>,
}

/// A workflow definition: tasks, task groups and must-complete-before edges.
///
/// Built only through explicit calls; nothing registers itself implicitly.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    id: String,
    tags: Vec<String>,
    tasks: Vec<Task>,
    task_index: HashMap<TaskId, usize>,
    membership: HashMap<TaskId, usize>,
    groups: Vec<GroupLayout>,
    edges: Vec<(TaskId, TaskId)>,
}

impl WorkflowGraph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Tasks in definition order, group members included.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.task_index.get(&TaskId::new(id)).map(|&i| &self.tasks[i])
    }

    pub fn groups(&self) -> &[GroupLayout] {
        &self.groups
    }

    pub fn group(&self, id: &str) -> Option<&GroupLayout> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// The group a task belongs to, if any.
    pub fn group_of(&self, task: &TaskId) -> Option<&GroupLayout> {
        self.membership.get(task).map(|&g| &self.groups[g])
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn is_defined(&self, id: &str) -> bool {
        self.task_index.contains_key(&TaskId::new(id)) || self.group(id).is_some()
    }

    fn insert_task(&mut self, task: Task, group: Option<usize>) {
        let id = task.id().clone();
        self.task_index.insert(id.clone(), self.tasks.len());
        if let Some(g) = group {
            self.membership.insert(id, g);
        }
        self.tasks.push(task);
    }

    pub fn add_task(&mut self, task: Task) -> Result<(), GraphError> {
        if self.is_defined(task.id().as_str()) {
            return Err(GraphError::DuplicateNode(task.id().to_string()));
        }
        self.insert_task(task, None);
        Ok(())
    }

    pub fn add_group(&mut self, group: TaskGroup) -> Result<(), GraphError> {
        if self.is_defined(group.id()) {
            return Err(GraphError::DuplicateNode(group.id().to_string()));
        }
        if group.members().is_empty() {
            return Err(GraphError::EmptyGroup(group.id().to_string()));
        }
        if let Some(clash) = group
            .members()
            .iter()
            .find(|m| self.is_defined(m.id().as_str()) || m.id().as_str() == group.id())
        {
            return Err(GraphError::DuplicateNode(clash.id().to_string()));
        }

        let layout = GroupLayout {
            id: group.id().to_string(),
            tooltip: group.tooltip().map(str::to_string),
            members: group.members().iter().map(|m| m.id().clone()).collect(),
            entry: group.entry_nodes(),
            exit: group.exit_nodes(),
        };
        let group_idx = self.groups.len();
        self.groups.push(layout);

        let (_, members, edges) = group.into_parts();
        for task in members {
            self.insert_task(task, Some(group_idx));
        }
        self.edges.extend(edges);
        Ok(())
    }

    /// Tasks an outgoing edge from `id` leaves from.
    fn exits_of(&self, id: &str, edge: &str) -> Result<Vec<TaskId>, GraphError> {
        self.endpoint(id, edge, false)
    }

    /// Tasks an incoming edge to `id` lands on.
    fn entries_of(&self, id: &str, edge: &str) -> Result<Vec<TaskId>, GraphError> {
        self.endpoint(id, edge, true)
    }

    fn endpoint(&self, id: &str, edge: &str, entry: bool) -> Result<Vec<TaskId>, GraphError> {
        if let Some(group) = self.group(id) {
            return Ok(if entry { group.entry.clone() } else { group.exit.clone() });
        }
        let task_id = TaskId::new(id);
        if !self.task_index.contains_key(&task_id) {
            return Err(GraphError::UnknownNode {
                node: id.to_string(),
                referenced_by: edge.to_string(),
            });
        }
        Ok(vec![task_id])
    }

    /// Declare that `from` must complete before `to`. Either end may be a task
    /// or a group, but never a member of a group.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let label = format!("{} -> {}", from, to);
        if from == to {
            return Err(GraphError::SelfLoop(from.to_string()));
        }

        let sources = self.exits_of(from, &label)?;
        let targets = self.entries_of(to, &label)?;

        for task in [TaskId::new(from), TaskId::new(to)] {
            if let Some(group) = self.group_of(&task) {
                return Err(GraphError::MemberEdge {
                    from: from.to_string(),
                    to: to.to_string(),
                    group: group.id.clone(),
                });
            }
        }

        for s in &sources {
            for t in &targets {
                let edge = (s.clone(), t.clone());
                if !self.edges.contains(&edge) {
                    self.edges.push(edge);
                }
            }
        }
        Ok(())
    }

    /// `from >> [to, ...]`
    pub fn add_edges<'a>(
        &mut self,
        from: &str,
        to: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), GraphError> {
        for t in to {
            self.add_edge(from, t)?;
        }
        Ok(())
    }

    /// `[from, ...] >> to`
    pub fn add_edges_from<'a>(
        &mut self,
        from: impl IntoIterator<Item = &'a str>,
        to: &str,
    ) -> Result<(), GraphError> {
        for f in from {
            self.add_edge(f, to)?;
        }
        Ok(())
    }

    /// `a >> b >> c`
    pub fn chain(&mut self, ids: &[&str]) -> Result<(), GraphError> {
        for pair in ids.windows(2) {
            self.add_edge(pair[0], pair[1])?;
        }
        Ok(())
    }

    /// Edges implied by tasks' declared `upstream` lists.
    fn upstream_edges(&self) -> Result<Vec<(TaskId, TaskId)>, GraphError> {
        let mut edges = Vec::new();
        for task in &self.tasks {
            let own_group = self.membership.get(task.id());
            for up in task.upstream() {
                let label = format!("{} (upstream of {})", up, task.id());
                let up_group = self.membership.get(up);

                // Inside a group, upstream may only name fellow members.
                let sources = match (own_group, up_group) {
                    (Some(a), Some(b)) if a == b => vec![up.clone()],
                    (None, None) => self.exits_of(up.as_str(), &label)?,
                    (Some(g), _) | (None, Some(g)) => {
                        if !self.is_defined(up.as_str()) {
                            return Err(GraphError::UnknownNode {
                                node: up.to_string(),
                                referenced_by: task.id().to_string(),
                            });
                        }
                        return Err(GraphError::MemberEdge {
                            from: up.to_string(),
                            to: task.id().to_string(),
                            group: self.groups[*g].id.clone(),
                        });
                    }
                };
                for s in sources {
                    edges.push((s, task.id().clone()));
                }
            }
        }
        Ok(edges)
    }

    /// Check the graph can run: every reference resolves and there is no cycle.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.plan().map(|_| ())
    }

    /// Waves of tasks that may run concurrently, in execution order.
    pub fn topological_order(&self) -> Result<Vec<Vec<TaskId>>, GraphError> {
        Ok(self.plan()?.waves)
    }

    /// Validate and compute the execution plan.
    pub fn plan(&self) -> Result<ExecutionPlan, GraphError> {
        ExecutionPlan::build(self)
    }
}

/// A validated DAG over the tasks of a [`WorkflowGraph`]
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    graph: DiGraph<TaskId, ()>,
    task_indices: HashMap<TaskId, NodeIndex>,
    waves: Vec<Vec<TaskId>>,
}

impl ExecutionPlan {
    fn build(workflow: &WorkflowGraph) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut task_indices = HashMap::new();

        // Add all tasks as nodes
        for task in workflow.tasks() {
            let node = graph.add_node(task.id().clone());
            task_indices.insert(task.id().clone(), node);
        }

        // Add dependency edges (dependency -> dependent)
        let mut seen = HashSet::new();
        let upstream = workflow.upstream_edges()?;
        for (from, to) in workflow.edges.iter().chain(upstream.iter()) {
            if !seen.insert((from.clone(), to.clone())) {
                continue;
            }
            let a = task_indices[from];
            let b = task_indices[to];
            if a == b {
                return Err(GraphError::SelfLoop(from.to_string()));
            }
            graph.add_edge(a, b, ());
        }

        // Verify the graph is acyclic
        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(GraphError::Cycle {
                node: graph[cycle.node_id()].to_string(),
            });
        }

        let waves = Self::layer(&graph);
        Ok(Self {
            graph,
            task_indices,
            waves,
        })
    }

    /// Kahn's algorithm, one layer at a time.
    fn layer(graph: &DiGraph<TaskId, ()>) -> Vec<Vec<TaskId>> {
        let mut in_degree: HashMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();

        let mut current: Vec<NodeIndex> =
            graph.node_indices().filter(|n| in_degree[n] == 0).collect();
        let mut waves = Vec::new();

        while !current.is_empty() {
            current.sort();
            let mut next = Vec::new();
            for &node in &current {
                for succ in graph.neighbors_directed(node, Direction::Outgoing) {
                    if let Some(d) = in_degree.get_mut(&succ) {
                        *d -= 1;
                        if *d == 0 {
                            next.push(succ);
                        }
                    }
                }
            }
            waves.push(current.iter().map(|&n| graph[n].clone()).collect());
            current = next;
        }

        waves
    }

    /// Get dependencies for a task
    pub fn dependencies(&self, task: &TaskId) -> Vec<TaskId> {
        self.neighbors(task, Direction::Incoming)
    }

    /// Get tasks that depend on the given task
    pub fn dependents(&self, task: &TaskId) -> Vec<TaskId> {
        self.neighbors(task, Direction::Outgoing)
    }

    fn neighbors(&self, task: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&node) = self.task_indices.get(task) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionTarget;

    fn stmt(id: &str) -> Task {
        Task::statement(id, ConnectionTarget::new("db"), "SELECT a FROM t")
    }

    fn group(id: &str, members: &[&str]) -> TaskGroup {
        let mut g = TaskGroup::new(id);
        for m in members {
            g.add_task(stmt(m)).unwrap();
        }
        g.chain(members).unwrap();
        g
    }

    /// start -> mysql_create(drop, create)
    ///       -> [insert, mssql_create(drop, create)] -> transfer -> end
    fn mysql_to_mssql() -> WorkflowGraph {
        let mut wf = WorkflowGraph::new("mysql_to_mssql").with_tags(["mysql", "mssql"]);
        wf.add_task(Task::empty("start")).unwrap();
        wf.add_task(Task::empty("end")).unwrap();
        wf.add_task(stmt("insert_data_mysql")).unwrap();
        wf.add_group(group("mysql_create", &["drop_table_mysql", "create_table_mysql"])).unwrap();
        wf.add_group(group("mssql_create", &["drop_table_mssql", "create_table_mssql"])).unwrap();
        wf.add_task(stmt("trans_data")).unwrap();

        wf.add_edge("start", "mysql_create").unwrap();
        wf.add_edges("mysql_create", ["insert_data_mysql", "mssql_create"]).unwrap();
        wf.add_edges_from(["insert_data_mysql", "mssql_create"], "trans_data").unwrap();
        wf.add_edge("trans_data", "end").unwrap();
        wf
    }

    fn ids(wave: &[TaskId]) -> Vec<&str> {
        wave.iter().map(|t| t.as_str()).collect()
    }

    #[test]
    fn test_linear_dag() {
        let mut wf = WorkflowGraph::new("linear");
        for id in ["step1", "step2", "step3"] {
            wf.add_task(stmt(id)).unwrap();
        }
        wf.chain(&["step1", "step2", "step3"]).unwrap();

        let waves = wf.topological_order().unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(ids(&waves[0]), vec!["step1"]);
        assert_eq!(ids(&waves[2]), vec!["step3"]);
    }

    #[test]
    fn test_group_edges_attach_to_entry_and_exit_sets() {
        let wf = mysql_to_mssql();
        let plan = wf.plan().unwrap();

        assert_eq!(plan.dependencies(&TaskId::new("drop_table_mysql")), vec![TaskId::new("start")]);
        assert_eq!(
            plan.dependents(&TaskId::new("create_table_mysql")),
            vec![TaskId::new("drop_table_mssql"), TaskId::new("insert_data_mysql")]
        );
        assert_eq!(
            plan.dependencies(&TaskId::new("trans_data")),
            vec![TaskId::new("create_table_mssql"), TaskId::new("insert_data_mysql")]
        );
    }

    #[test]
    fn test_waves_for_mysql_to_mssql() {
        let waves = mysql_to_mssql().topological_order().unwrap();
        let waves: Vec<Vec<&str>> = waves.iter().map(|w| ids(w)).collect();
        assert_eq!(
            waves,
            vec![
                vec!["start"],
                vec!["drop_table_mysql"],
                vec!["create_table_mysql"],
                vec!["insert_data_mysql", "drop_table_mssql"],
                vec!["create_table_mssql"],
                vec!["trans_data"],
                vec!["end"],
            ]
        );
    }

    #[test]
    fn test_cyclic_dag_rejected() {
        let mut wf = WorkflowGraph::new("cyclic");
        wf.add_task(stmt("step1")).unwrap();
        wf.add_task(stmt("step2")).unwrap();
        wf.add_task(stmt("step3")).unwrap();
        wf.chain(&["step1", "step2", "step3", "step1"]).unwrap();

        let err = wf.validate().unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
        assert!(err.to_string().contains("cycle"));
        assert!(wf.topological_order().is_err());
    }

    #[test]
    fn test_cycle_through_groups_rejected() {
        let mut wf = WorkflowGraph::new("cyclic_groups");
        wf.add_group(group("a", &["a1", "a2"])).unwrap();
        wf.add_group(group("b", &["b1"])).unwrap();
        wf.add_edge("a", "b").unwrap();
        wf.add_edge("b", "a").unwrap();
        assert!(matches!(wf.validate(), Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn test_unknown_and_duplicate_nodes() {
        let mut wf = WorkflowGraph::new("wf");
        wf.add_task(stmt("a")).unwrap();
        assert!(matches!(wf.add_edge("a", "ghost"), Err(GraphError::UnknownNode { .. })));
        assert!(matches!(wf.add_task(stmt("a")), Err(GraphError::DuplicateNode(_))));
        assert!(matches!(wf.add_group(group("a", &["x"])), Err(GraphError::DuplicateNode(_))));
        assert!(matches!(wf.add_group(TaskGroup::new("empty")), Err(GraphError::EmptyGroup(_))));
    }

    #[test]
    fn test_edges_into_group_members_rejected() {
        let mut wf = mysql_to_mssql();
        let err = wf.add_edge("start", "create_table_mysql").unwrap_err();
        assert!(matches!(err, GraphError::MemberEdge { ref group, .. } if group == "mysql_create"));
        assert!(wf.add_edge("drop_table_mssql", "end").is_err());
    }

    #[test]
    fn test_declared_upstream() {
        let mut wf = WorkflowGraph::new("wf");
        wf.add_task(stmt("a")).unwrap();
        wf.add_task(stmt("b").with_upstream(["a"])).unwrap();
        wf.add_group(group("g", &["g1", "g2"])).unwrap();
        wf.add_task(stmt("c").with_upstream(["b", "g"])).unwrap();

        let plan = wf.plan().unwrap();
        assert_eq!(plan.dependencies(&TaskId::new("c")), vec![TaskId::new("b"), TaskId::new("g2")]);

        wf.add_task(stmt("d").with_upstream(["nowhere"])).unwrap();
        assert!(matches!(wf.validate(), Err(GraphError::UnknownNode { .. })));
    }

    #[test]
    fn test_upstream_into_group_member_rejected() {
        let mut wf = WorkflowGraph::new("wf");
        wf.add_group(group("g", &["g1", "g2"])).unwrap();
        wf.add_task(stmt("c").with_upstream(["g1"])).unwrap();
        assert!(matches!(wf.validate(), Err(GraphError::MemberEdge { .. })));
    }

    #[test]
    fn test_group_ordered_by_member_upstream() {
        let mut g = TaskGroup::new("g");
        g.add_task(stmt("g1")).unwrap();
        g.add_task(stmt("g2").with_upstream(["g1"])).unwrap();

        let mut wf = WorkflowGraph::new("wf");
        wf.add_task(Task::empty("start")).unwrap();
        wf.add_group(g).unwrap();
        wf.add_task(Task::empty("end")).unwrap();
        wf.chain(&["start", "g", "end"]).unwrap();

        let layout = wf.group("g").unwrap();
        assert_eq!(layout.entry, vec![TaskId::new("g1")]);
        assert_eq!(layout.exit, vec![TaskId::new("g2")]);

        let plan = wf.plan().unwrap();
        assert_eq!(plan.dependencies(&TaskId::new("g1")), vec![TaskId::new("start")]);
        assert_eq!(plan.dependencies(&TaskId::new("g2")), vec![TaskId::new("g1")]);
        assert_eq!(plan.dependencies(&TaskId::new("end")), vec![TaskId::new("g2")]);
    }
}
