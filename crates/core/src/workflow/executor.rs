use super::dag::{ExecutionPlan, WorkflowGraph};
use super::node_runner::{append, NodeOutcome, NodeRunner};
use crate::config::ExecutorConfig;
use crate::connection::ConnectionProvider;
use crate::error::{ErrorDetail, ErrorKind, GraphError};
use crate::events::{Event, EventLog, EventType, MemoryEventLog};
use crate::group::group_state;
use crate::task::{Task, TaskContext};
use crate::types::{
    GroupReport, NodeExecution, NodeState, Run, RunContext, RunId, RunStatus, TaskId, TriggerRule,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A run the executor is currently driving
struct ActiveRun {
    cancel: CancellationToken,
    run: Arc<RwLock<Run>>,
}

/// What the next scheduling step should do with pending nodes
#[derive(Debug, Default, PartialEq)]
struct Readiness {
    ready: Vec<TaskId>,
    skipped: Vec<(TaskId, String)>,
}

/// Wave-based workflow executor
pub struct Executor {
    connections: Arc<dyn ConnectionProvider>,
    event_log: Arc<dyn EventLog>,
    config: ExecutorConfig,
    // Track active runs for cancellation and snapshots
    active_runs: Arc<RwLock<HashMap<RunId, ActiveRun>>>,
}

impl Executor {
    pub fn new(connections: Arc<dyn ConnectionProvider>, config: ExecutorConfig) -> Self {
        Self {
            connections,
            event_log: Arc::new(MemoryEventLog::new()),
            config,
            active_runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = event_log;
        self
    }

    /// Validate and execute a workflow, returning the terminal run.
    ///
    /// Graph errors are returned before anything runs. Task errors never
    /// surface here; they are recorded on their node in the returned run.
    pub async fn run(&self, graph: &WorkflowGraph, ctx: RunContext) -> Result<Run, GraphError> {
        self.run_with_id(RunId::new(), graph, ctx).await
    }

    /// Like [`run`](Self::run) with a caller-chosen id, so the caller can
    /// cancel or inspect the run while it is in flight.
    pub async fn run_with_id(
        &self,
        run_id: RunId,
        graph: &WorkflowGraph,
        ctx: RunContext,
    ) -> Result<Run, GraphError> {
        let plan = graph.plan().map_err(|e| {
            tracing::error!("Rejecting workflow {}: {}", graph.id(), e);
            e
        })?;

        tracing::info!("Starting workflow execution: workflow={}, run_id={}", graph.id(), run_id);

        let started_at = chrono::Utc::now();
        let run = Run {
            id: run_id,
            workflow_id: graph.id().to_string(),
            external_run_id: ctx.external_run_id.clone(),
            status: RunStatus::Running,
            cancelled: false,
            triggered_at: ctx.triggered_at,
            started_at,
            completed_at: None,
            nodes: initial_nodes(graph, &plan),
            groups: Vec::new(),
        };
        let run = Arc::new(RwLock::new(run));
        refresh_groups(&mut *run.write().await);

        // Create cancellation token
        let cancel = CancellationToken::new();
        self.active_runs.write().await.insert(
            run_id,
            ActiveRun {
                cancel: cancel.clone(),
                run: run.clone(),
            },
        );

        append(
            &self.event_log,
            Event::new(
                run_id,
                EventType::RunStarted {
                    workflow_id: graph.id().to_string(),
                    external_run_id: ctx.external_run_id.clone(),
                    node_count: graph.len(),
                },
            ),
        )
        .await;

        self.execute_plan(run_id, graph, &plan, &ctx, &run, &cancel).await;

        // Update run status
        let completed_at = chrono::Utc::now();
        let duration_secs = (completed_at - started_at).num_seconds().max(0) as u64;
        let finished = {
            let mut run = run.write().await;
            run.completed_at = Some(completed_at);
            run.cancelled = cancel.is_cancelled();
            run.status = run.aggregate_status();
            refresh_groups(&mut run);
            run.clone()
        };

        let event_type = match finished.status {
            RunStatus::Succeeded => {
                tracing::info!("Workflow execution succeeded: run_id={}", run_id);
                EventType::RunCompleted { duration_secs }
            }
            _ => {
                let failed: Vec<TaskId> = finished
                    .nodes
                    .iter()
                    .filter(|n| n.state == NodeState::Failed)
                    .map(|n| n.id.clone())
                    .collect();
                tracing::error!(
                    "Workflow execution failed: run_id={}, failed={}, skipped={}",
                    run_id,
                    failed.len(),
                    finished.count_in(NodeState::Skipped)
                );
                EventType::RunFailed { failed, duration_secs }
            }
        };
        append(&self.event_log, Event::new(run_id, event_type)).await;

        // Clean up active runs
        self.active_runs.write().await.remove(&run_id);

        Ok(finished)
    }

    /// Drive the run wave by wave until no node can make progress.
    async fn execute_plan(
        &self,
        run_id: RunId,
        graph: &WorkflowGraph,
        plan: &ExecutionPlan,
        ctx: &RunContext,
        run: &Arc<RwLock<Run>>,
        cancel: &CancellationToken,
    ) {
        let tasks: HashMap<TaskId, Arc<Task>> = graph
            .tasks()
            .iter()
            .map(|t| (t.id().clone(), Arc::new(t.clone())))
            .collect();
        let order: Vec<TaskId> = graph.tasks().iter().map(|t| t.id().clone()).collect();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let task_ctx = TaskContext {
            connections: self.connections.clone(),
            runtime: ctx.parameters.clone(),
            batch_size: self.config.transfer_batch_size.max(1),
        };

        let mut wave_index = 0;
        loop {
            if cancel.is_cancelled() {
                self.skip_remaining(run_id, run, "run cancelled").await;
                break;
            }

            let readiness = {
                let run = run.read().await;
                evaluate(plan, &tasks, &order, &run)
            };

            if !readiness.skipped.is_empty() {
                let mut state = run.write().await;
                for (id, reason) in &readiness.skipped {
                    tracing::info!("Skipping task {}: {}", id, reason);
                    if let Some(node) = state.node_mut(id.as_str()) {
                        node.state = NodeState::Skipped;
                        node.completed_at = Some(chrono::Utc::now());
                    }
                }
                drop(state);
                for (id, reason) in readiness.skipped.iter().cloned() {
                    append(
                        &self.event_log,
                        Event::new(run_id, EventType::NodeSkipped { task_id: id, reason }),
                    )
                    .await;
                }
            }

            if readiness.ready.is_empty() {
                if readiness.skipped.is_empty() {
                    break;
                }
                continue;
            }

            {
                let mut state = run.write().await;
                for id in &readiness.ready {
                    if let Some(node) = state.node_mut(id.as_str()) {
                        node.state = NodeState::Ready;
                    }
                }
            }
            tracing::info!(
                "Dispatching wave {} with {} task(s)",
                wave_index,
                readiness.ready.len()
            );
            append(
                &self.event_log,
                Event::new(
                    run_id,
                    EventType::WaveStarted {
                        index: wave_index,
                        nodes: readiness.ready.clone(),
                    },
                ),
            )
            .await;

            let mut join_set = JoinSet::new();
            for id in &readiness.ready {
                let Some(task) = tasks.get(id) else {
                    continue;
                };
                join_set.spawn(
                    NodeRunner {
                        run_id,
                        task: task.clone(),
                        ctx: task_ctx.clone(),
                        run: run.clone(),
                        event_log: self.event_log.clone(),
                        semaphore: semaphore.clone(),
                        cancel: cancel.clone(),
                        default_timeout: self.config.node_timeout(),
                        cancel_grace: self.config.cancel_grace(),
                    }
                    .run(),
                );
            }

            // Siblings always run to their own completion; a failure here only
            // affects what becomes ready next.
            let mut reported = HashSet::new();
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((id, outcome)) => {
                        reported.insert(id.clone());
                        self.record(run_id, run, id, outcome).await;
                    }
                    Err(join_err) => {
                        tracing::error!(?join_err, "node task panicked");
                    }
                }
            }

            for id in readiness.ready.iter().filter(|id| !reported.contains(*id)) {
                let mut state = run.write().await;
                if let Some(node) = state.node_mut(id.as_str()) {
                    node.state = NodeState::Failed;
                    node.completed_at = Some(chrono::Utc::now());
                    node.error = Some(ErrorDetail {
                        kind: ErrorKind::Internal,
                        message: "worker task panicked or was aborted".to_string(),
                    });
                }
            }

            refresh_groups(&mut *run.write().await);
            wave_index += 1;
        }
    }

    /// Store a node's terminal state and emit the matching event.
    async fn record(
        &self,
        run_id: RunId,
        run: &Arc<RwLock<Run>>,
        id: TaskId,
        outcome: NodeOutcome,
    ) {
        let now = chrono::Utc::now();
        let event_type = {
            let mut state = run.write().await;
            let Some(node) = state.node_mut(id.as_str()) else {
                return;
            };
            node.completed_at = Some(now);

            match outcome {
                NodeOutcome::Succeeded { output, duration } => {
                    tracing::info!("Task {} succeeded in {:?}", id, duration);
                    node.state = NodeState::Succeeded;
                    node.output = Some(output);
                    EventType::NodeSucceeded {
                        task_id: id,
                        output,
                        duration_ms: duration.as_millis() as u64,
                    }
                }
                NodeOutcome::Failed { error, duration } => {
                    tracing::warn!("Task {} failed: {}", id, error);
                    node.state = NodeState::Failed;
                    node.error = Some(ErrorDetail::from(&error));
                    EventType::NodeFailed {
                        task_id: id,
                        error: error.to_string(),
                        duration_ms: duration.as_millis() as u64,
                    }
                }
                NodeOutcome::NotStarted => {
                    node.state = NodeState::Skipped;
                    EventType::NodeSkipped {
                        task_id: id,
                        reason: "run cancelled before start".to_string(),
                    }
                }
            }
        };
        append(&self.event_log, Event::new(run_id, event_type)).await;
    }

    async fn skip_remaining(&self, run_id: RunId, run: &Arc<RwLock<Run>>, reason: &str) {
        let skipped: Vec<TaskId> = {
            let mut state = run.write().await;
            let now = chrono::Utc::now();
            state
                .nodes
                .iter_mut()
                .filter(|n| !n.state.is_terminal())
                .map(|n| {
                    n.state = NodeState::Skipped;
                    n.completed_at = Some(now);
                    n.id.clone()
                })
                .collect()
        };
        tracing::warn!(
            "Workflow execution cancelled: run_id={}, skipped {} task(s)",
            run_id,
            skipped.len()
        );
        for task_id in skipped {
            append(
                &self.event_log,
                Event::new(
                    run_id,
                    EventType::NodeSkipped {
                        task_id,
                        reason: reason.to_string(),
                    },
                ),
            )
            .await;
        }
    }

    /// Snapshot of a run that is still in flight
    pub async fn get_run(&self, run_id: RunId) -> Option<Run> {
        let active = self.active_runs.read().await;
        match active.get(&run_id) {
            Some(entry) => Some(entry.run.read().await.clone()),
            None => None,
        }
    }

    pub async fn active_runs(&self) -> Vec<RunId> {
        self.active_runs.read().await.keys().copied().collect()
    }

    /// Cancel a running workflow. Returns false if the run is not active.
    pub async fn cancel(&self, run_id: RunId) -> bool {
        let active_runs = self.active_runs.read().await;

        let Some(entry) = active_runs.get(&run_id) else {
            tracing::warn!("Run {} is not active", run_id);
            return false;
        };
        entry.cancel.cancel();
        tracing::info!("Cancellation signal sent for run {}", run_id);

        append(
            &self.event_log,
            Event::new(
                run_id,
                EventType::RunCancelled {
                    reason: "cancellation requested".to_string(),
                },
            ),
        )
        .await;
        true
    }
}

/// One record per task. Tasks with no predecessors start Ready.
fn initial_nodes(graph: &WorkflowGraph, plan: &ExecutionPlan) -> Vec<NodeExecution> {
    graph
        .tasks()
        .iter()
        .map(|t| {
            let group = graph.group_of(t.id()).map(|g| g.id.clone());
            let mut node = NodeExecution::pending(t.id().clone(), group);
            if plan.dependencies(t.id()).is_empty() {
                node.state = NodeState::Ready;
            }
            node
        })
        .collect()
}

/// Decide which undispatched nodes run next and which are Skipped.
fn evaluate(
    plan: &ExecutionPlan,
    tasks: &HashMap<TaskId, Arc<Task>>,
    order: &[TaskId],
    run: &Run,
) -> Readiness {
    let mut readiness = Readiness::default();

    for id in order {
        // Ready nodes are not dispatched until the next evaluation.
        if !matches!(run.state_of(id.as_str()), Some(NodeState::Pending | NodeState::Ready)) {
            continue;
        }
        let rule = tasks.get(id).map(|t| t.trigger_rule()).unwrap_or_default();
        let deps: Vec<(TaskId, NodeState)> = plan
            .dependencies(id)
            .into_iter()
            .map(|d| {
                let state = run.state_of(d.as_str()).unwrap_or(NodeState::Pending);
                (d, state)
            })
            .collect();

        match rule {
            TriggerRule::AllSuccess => {
                if let Some((dep, state)) = deps
                    .iter()
                    .find(|(_, s)| matches!(s, NodeState::Failed | NodeState::Skipped))
                {
                    readiness.skipped.push((id.clone(), format!("upstream {} {}", dep, state)));
                } else if deps.iter().all(|(_, s)| *s == NodeState::Succeeded) {
                    readiness.ready.push(id.clone());
                }
            }
            TriggerRule::OneSuccess => {
                if deps.is_empty() {
                    readiness.ready.push(id.clone());
                } else if deps.iter().all(|(_, s)| s.is_terminal()) {
                    if deps.iter().any(|(_, s)| *s == NodeState::Succeeded) {
                        readiness.ready.push(id.clone());
                    } else {
                        readiness.skipped.push((id.clone(), "no upstream succeeded".to_string()));
                    }
                }
            }
        }
    }

    readiness
}

/// Recompute derived group states from member states.
fn refresh_groups(run: &mut Run) {
    let mut order: Vec<String> = Vec::new();
    let mut members: HashMap<String, Vec<NodeState>> = HashMap::new();
    for node in &run.nodes {
        if let Some(group) = &node.group {
            if !members.contains_key(group) {
                order.push(group.clone());
            }
            members.entry(group.clone()).or_default().push(node.state);
        }
    }

    run.groups = order
        .into_iter()
        .map(|id| {
            let state = group_state(&members[&id]);
            GroupReport { id, state }
        })
        .collect();
}
