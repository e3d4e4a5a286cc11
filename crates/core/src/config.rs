use crate::transfer::DEFAULT_BATCH_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Executor tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Upper bound on nodes running at once within a wave.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Default per-node timeout; a task's own timeout takes precedence.
    #[serde(default)]
    pub node_timeout_secs: Option<u64>,

    /// How long in-flight nodes may keep running after cancellation.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    #[serde(default = "default_transfer_batch_size")]
    pub transfer_batch_size: usize,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_cancel_grace_secs() -> u64 {
    30
}

fn default_transfer_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            node_timeout_secs: None,
            cancel_grace_secs: default_cancel_grace_secs(),
            transfer_batch_size: default_transfer_batch_size(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace_secs = grace.as_secs();
        self
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_secs.map(Duration::from_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}
