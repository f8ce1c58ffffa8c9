use std::time::Duration;

use ::redis::AsyncCommands;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{QueueError, Task, TaskEnvelope, TaskQueue};

/// Sorted set keyed by due time (ms since epoch); members are JSON envelopes.
#[derive(Clone)]
pub struct RedisTaskQueue {
    client: ::redis::Client,
    key: String,
}

impl RedisTaskQueue {
    pub fn new(client: ::redis::Client, key: impl Into<String>) -> Self {
        Self {
            client,
            key: key.into(),
        }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, task: Task, delay: Duration) -> Result<Uuid, QueueError> {
        let envelope = TaskEnvelope::new(task);
        let member = serde_json::to_string(&envelope)?;
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = conn.zadd(&self.key, member, due_ms).await?;
        tracing::debug!(
            "[queue] pushed {} task {} (delay={}s)",
            envelope.task.kind(),
            envelope.id,
            delay.as_secs()
        );
        Ok(envelope.id)
    }

    async fn claim_due(&self, limit: usize) -> Result<Vec<TaskEnvelope>, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let members: Vec<String> = conn
            .zrangebyscore_limit(&self.key, "-inf", now_ms, 0, limit as isize)
            .await?;

        let mut claimed = Vec::with_capacity(members.len());
        for member in members {
            // ZREM returning 1 means this worker won the race for the member.
            let removed: i64 = conn.zrem(&self.key, &member).await?;
            if removed == 0 {
                continue;
            }
            match serde_json::from_str::<TaskEnvelope>(&member) {
                Ok(envelope) => claimed.push(envelope),
                Err(e) => tracing::error!("[queue] dropping malformed task payload: {}", e),
            }
        }
        Ok(claimed)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let n: usize = conn.zcard(&self.key).await?;
        Ok(n)
    }
}
