use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::error::Result;
use crate::logger;
use crate::services::Orchestrator;
use crate::state_machine;

const SWEEP_BATCH: usize = 50;

impl Orchestrator {
    /// Fail `pending` records whose polling loop should have ended by `now`.
    ///
    /// Covers loops that lost their follow-up task: a failed retry push, a store
    /// error while recording the outcome, or a worker that died after claiming the task.
    pub async fn recover_stuck_polls(&self, now: DateTime<Utc>) -> Result<usize> {
        let deadline = self.config.polling.deadline();
        let cutoff = now - chrono::Duration::seconds(deadline.as_secs() as i64);
        let stale = self.store.list_stale_pending(cutoff, SWEEP_BATCH).await?;

        let mut recovered = 0usize;
        for instance in stale {
            let reason = format!(
                "boot secret polling did not finish within {}s of creation",
                deadline.as_secs()
            );
            if state_machine::pending_to_failed(self.store.as_ref(), instance.id, &reason).await? {
                tracing::warn!(
                    "[job-recovery] instance {} stuck in pending since {}, marked failed",
                    instance.id,
                    instance.created_at
                );
                logger::log_quick(
                    self.store.as_ref(),
                    logger::RECOVERY_STUCK_POLL,
                    Some(instance.id),
                    json!({"created_at": instance.created_at, "deadline_secs": deadline.as_secs()}),
                )
                .await;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

/// job-recovery: safety net for polling loops that never reached a terminal status.
pub async fn run(orch: Orchestrator, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tracing::info!("[job-recovery] started (every {}s)", every.as_secs());

    loop {
        interval.tick().await;
        match orch.recover_stuck_polls(Utc::now()).await {
            Ok(count) if count > 0 => tracing::info!("[job-recovery] recovered {} instance(s)", count),
            Ok(_) => {}
            Err(e) => tracing::error!("[job-recovery] error: {}", e),
        }
    }
}
