use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{QueueError, Task, TaskEnvelope, TaskQueue};

struct Entry {
    due: Instant,
    envelope: TaskEnvelope,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    pushed: Vec<(Task, Duration)>,
    failing_pushes: u32,
}

/// In-process queue. Due times follow `tokio::time`, so paused-clock tests can advance them.
#[derive(Default, Clone)]
pub struct MemoryTaskQueue {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every task ever pushed, with the delay it was pushed with.
    pub async fn pushed(&self) -> Vec<(Task, Duration)> {
        self.inner.lock().await.pushed.clone()
    }

    /// Tasks still waiting in the queue, due or not.
    pub async fn pending(&self) -> Vec<Task> {
        self.inner
            .lock()
            .await
            .entries
            .iter()
            .map(|e| e.envelope.task.clone())
            .collect()
    }

    /// Make the next push fail as if the backing store were unreachable.
    pub async fn fail_next_push(&self) {
        self.inner.lock().await.failing_pushes += 1;
    }

    /// Remove and return every queued task regardless of due time.
    pub async fn take_all(&self) -> Vec<Task> {
        let mut inner = self.inner.lock().await;
        let mut entries = std::mem::take(&mut inner.entries);
        entries.sort_by_key(|e| e.due);
        entries.into_iter().map(|e| e.envelope.task).collect()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn push(&self, task: Task, delay: Duration) -> Result<Uuid, QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.failing_pushes > 0 {
            inner.failing_pushes -= 1;
            return Err(QueueError::Redis(
                (::redis::ErrorKind::IoError, "connection refused").into(),
            ));
        }
        let envelope = TaskEnvelope::new(task.clone());
        let id = envelope.id;
        inner.pushed.push((task, delay));
        inner.entries.push(Entry {
            due: Instant::now() + delay,
            envelope,
        });
        Ok(id)
    }

    async fn claim_due(&self, limit: usize) -> Result<Vec<TaskEnvelope>, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.entries.sort_by_key(|e| e.due);
        let due = inner.entries.iter().take_while(|e| e.due <= now).count().min(limit);
        Ok(inner
            .entries
            .drain(..due)
            .map(|e| e.envelope)
            .collect())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.inner.lock().await.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn delayed_tasks_become_due() {
        let q = MemoryTaskQueue::new();
        let id = Uuid::new_v4();
        q.push(Task::Terminate { instance_id: id }, Duration::ZERO).await.unwrap();
        q.push(
            Task::PollBootSecret {
                instance_id: id,
                attempt: 1,
            },
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let first = q.claim_due(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].task, Task::Terminate { instance_id: id });
        assert!(q.claim_due(10).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        let second = q.claim_due(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(q.len().await.unwrap(), 0);
        assert_eq!(q.pushed().await.len(), 2);
    }

    #[tokio::test]
    async fn claim_respects_limit() {
        let q = MemoryTaskQueue::new();
        for _ in 0..5 {
            q.push(
                Task::Terminate {
                    instance_id: Uuid::new_v4(),
                },
                Duration::ZERO,
            )
            .await
            .unwrap();
        }
        assert_eq!(q.claim_due(2).await.unwrap().len(), 2);
        assert_eq!(q.len().await.unwrap(), 3);
    }
}
