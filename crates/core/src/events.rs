use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// An event in a run's lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events the executor emits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        workflow_id: String,
        external_run_id: Option<String>,
        node_count: usize,
    },
    RunCompleted {
        duration_secs: u64,
    },
    RunFailed {
        failed: Vec<TaskId>,
        duration_secs: u64,
    },
    RunCancelled {
        reason: String,
    },

    // Node lifecycle events
    WaveStarted {
        index: usize,
        nodes: Vec<TaskId>,
    },
    NodeStarted {
        task_id: TaskId,
    },
    NodeSucceeded {
        task_id: TaskId,
        output: TaskOutput,
        duration_ms: u64,
    },
    NodeFailed {
        task_id: TaskId,
        error: String,
        duration_ms: u64,
    },
    NodeSkipped {
        task_id: TaskId,
        reason: String,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;
}

/// Event log kept in memory, for hosts that persist events themselves
#[derive(Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("event log poisoned"))?
            .push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>> {
        let events = self.events.lock().map_err(|_| anyhow::anyhow!("event log poisoned"))?;
        Ok(events.iter().filter(|e| e.run_id == run_id).cloned().collect())
    }
}
