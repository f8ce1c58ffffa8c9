use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryTaskQueue;
pub use self::redis::RedisTaskQueue;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("malformed task payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Unit of asynchronous work executed by the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Provision {
        account_id: Uuid,
        region: String,
        name_prefix: String,
    },
    /// `attempt` is 1-based.
    PollBootSecret { instance_id: Uuid, attempt: u32 },
    Terminate { instance_id: Uuid },
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::Provision { .. } => "provision",
            Task::PollBootSecret { .. } => "poll_boot_secret",
            Task::Terminate { .. } => "terminate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub task: Task,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(task: Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            enqueued_at: Utc::now(),
        }
    }
}

/// Durable delayed-delivery queue. A claimed task is removed from the queue;
/// exactly one claimer wins each task.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push(&self, task: Task, delay: Duration) -> Result<Uuid, QueueError>;

    async fn claim_due(&self, limit: usize) -> Result<Vec<TaskEnvelope>, QueueError>;

    async fn len(&self) -> Result<usize, QueueError>;
}
