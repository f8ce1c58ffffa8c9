use std::time::Duration;

use crate::services::Orchestrator;

/// job-sync: periodic system-wide status synchronisation.
pub async fn run(orch: Orchestrator, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tracing::info!("[job-sync] started (every {}s)", every.as_secs());

    loop {
        interval.tick().await;
        match orch.sync_all().await {
            Ok(summary) if summary.failures > 0 => tracing::warn!(
                "[job-sync] {} of {} account/region pair(s) failed",
                summary.failures,
                summary.pairs
            ),
            Ok(summary) => tracing::debug!(
                "[job-sync] {} pair(s), {} status update(s)",
                summary.pairs,
                summary.totals.status_updated
            ),
            Err(e) => tracing::error!("[job-sync] error: {}", e),
        }
    }
}
