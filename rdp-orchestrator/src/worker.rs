use crate::error::{OrchestratorError, Result};
use crate::queue::{Task, TaskEnvelope};
use crate::services::Orchestrator;

impl Orchestrator {
    /// Execute one queued task to completion.
    pub async fn execute(&self, task: Task) -> Result<()> {
        match task {
            Task::Provision {
                account_id,
                region,
                name_prefix,
            } => match self.request_labelled(account_id, &region, &name_prefix).await {
                Ok(_) => Ok(()),
                Err(OrchestratorError::CapacityExceeded { .. }) => {
                    // Another task took the slot between planning and execution.
                    tracing::warn!(
                        "[worker] provision {} skipped: account {} region {} is full",
                        name_prefix,
                        account_id,
                        region
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Task::PollBootSecret {
                instance_id,
                attempt,
            } => self.run_poll_task(instance_id, attempt).await.map(|_| ()),
            Task::Terminate { instance_id } => self.terminate(instance_id).await.map(|_| ()),
        }
    }
}

async fn execute_envelope(orch: Orchestrator, envelope: TaskEnvelope) {
    let kind = envelope.task.kind();
    tracing::debug!("[worker] running {} task {}", kind, envelope.id);
    if let Err(e) = orch.execute(envelope.task).await {
        tracing::error!("[worker] {} task {} failed: {}", kind, envelope.id, e);
    }
}

/// Claim due tasks every poll interval and run each on its own tokio task.
pub async fn run(orch: Orchestrator) {
    let mut interval = tokio::time::interval(orch.config().worker_poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let batch = orch.config().worker_batch_size;
    tracing::info!("[worker] started (batch={})", batch);

    loop {
        interval.tick().await;
        match orch.queue().claim_due(batch).await {
            Ok(envelopes) => {
                for envelope in envelopes {
                    tokio::spawn(execute_envelope(orch.clone(), envelope));
                }
            }
            Err(e) => tracing::error!("[worker] failed to claim tasks: {}", e),
        }
    }
}
