use crate::error::TaskError;
use crate::events::{Event, EventLog, EventType};
use crate::task::{Task, TaskContext};
use crate::types::{NodeState, Run, RunId, TaskId, TaskOutput};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

/// How a dispatched node ended
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    Succeeded { output: TaskOutput, duration: Duration },
    Failed { error: TaskError, duration: Duration },
    /// Cancelled before it acquired a slot; never touched a connection.
    NotStarted,
}

/// Everything one node needs to run on its own tokio task.
pub(crate) struct NodeRunner {
    pub run_id: RunId,
    pub task: Arc<Task>,
    pub ctx: TaskContext,
    pub run: Arc<RwLock<Run>>,
    pub event_log: Arc<dyn EventLog>,
    pub semaphore: Arc<Semaphore>,
    pub cancel: CancellationToken,
    pub default_timeout: Option<Duration>,
    pub cancel_grace: Duration,
}

impl NodeRunner {
    /// Acquire a concurrency slot, then execute the task under its timeout.
    pub async fn run(self) -> (TaskId, NodeOutcome) {
        let task_id = self.task.id().clone();

        let _permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return (task_id, NodeOutcome::NotStarted),
            },
            _ = self.cancel.cancelled() => return (task_id, NodeOutcome::NotStarted),
        };
        if self.cancel.is_cancelled() {
            return (task_id, NodeOutcome::NotStarted);
        }

        {
            let mut run = self.run.write().await;
            if let Some(node) = run.node_mut(task_id.as_str()) {
                node.state = NodeState::Running;
                node.started_at = Some(chrono::Utc::now());
            }
        }
        append(
            &self.event_log,
            Event::new(self.run_id, EventType::NodeStarted { task_id: task_id.clone() }),
        )
        .await;

        tracing::info!(
            "Executing task {} ({:?}) for run {}",
            task_id,
            self.task.kind(),
            self.run_id
        );

        let start = Instant::now();
        let result = self.execute_bounded().await;
        let duration = start.elapsed();

        match result {
            Ok(output) => (task_id, NodeOutcome::Succeeded { output, duration }),
            Err(error) => (task_id, NodeOutcome::Failed { error, duration }),
        }
    }

    async fn execute_bounded(&self) -> Result<TaskOutput, TaskError> {
        let timeout = self.task.timeout().or(self.default_timeout);

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        // In-flight work gets a grace period once the run is cancelled.
        let grace = async {
            self.cancel.cancelled().await;
            tokio::time::sleep(self.cancel_grace).await;
        };

        tokio::select! {
            result = self.task.execute(&self.ctx) => result,
            _ = deadline => {
                let limit = timeout.unwrap_or_default();
                tracing::warn!("Task {} timed out after {:?}", self.task.id(), limit);
                Err(TaskError::Timeout(limit))
            }
            _ = grace => {
                tracing::warn!(
                    "Task {} interrupted after cancellation grace period",
                    self.task.id()
                );
                Err(TaskError::Cancelled)
            }
        }
    }
}

/// Append to the event log; a failing sink is logged and otherwise ignored.
pub(crate) async fn append(event_log: &Arc<dyn EventLog>, event: Event) {
    if let Err(e) = event_log.append(event).await {
        tracing::warn!("Failed to append run event: {}", e);
    }
}
