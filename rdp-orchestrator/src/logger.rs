//! Two-phase action log (`in_progress` -> `success`/`failed`) written through the store.
//! Logging failures are reported via tracing and never fail the workflow.

use std::time::Instant;

use chrono::Utc;
use rdp_common::ActionLog;
use uuid::Uuid;

use crate::store::{ActionLogCompletion, Store, StoreError};

pub const EXECUTE_CREATE: &str = "EXECUTE_CREATE";
pub const PROVIDER_CREATE_NETWORK_RULE: &str = "PROVIDER_CREATE_NETWORK_RULE";
pub const PROVIDER_CREATE_KEY: &str = "PROVIDER_CREATE_KEY";
pub const PROVIDER_LAUNCH: &str = "PROVIDER_LAUNCH";
pub const PROVISION_ROLLBACK: &str = "PROVISION_ROLLBACK";
pub const POLL_BOOT_SECRET: &str = "POLL_BOOT_SECRET";
pub const EXECUTE_TERMINATE: &str = "EXECUTE_TERMINATE";
pub const PROVIDER_TERMINATE: &str = "PROVIDER_TERMINATE";
pub const NETWORK_RULE_CLEANUP_PENDING: &str = "NETWORK_RULE_CLEANUP_PENDING";
pub const STATUS_SYNC: &str = "STATUS_SYNC";
pub const STATE_TRANSITION: &str = "STATE_TRANSITION";
pub const RECOVERY_STUCK_POLL: &str = "RECOVERY_STUCK_POLL";
pub const CLOUD_TERMINATED: &str = "CLOUD_TERMINATED";

pub async fn log_event_with_metadata(
    store: &dyn Store,
    action_type: &str,
    status: &str,
    instance_id: Option<Uuid>,
    error_message: Option<&str>,
    metadata: Option<serde_json::Value>,
) -> Result<Uuid, StoreError> {
    let log_id = Uuid::new_v4();
    store
        .insert_action_log(ActionLog {
            id: log_id,
            action_type: action_type.to_string(),
            status: status.to_string(),
            instance_id,
            error_message: error_message.map(|s| s.to_string()),
            metadata,
            duration_ms: None,
            created_at: Utc::now(),
            completed_at: None,
        })
        .await?;
    tracing::debug!("[action-log] {} - {} ({})", action_type, status, log_id);
    Ok(log_id)
}

pub async fn log_event_complete_with_metadata(
    store: &dyn Store,
    log_id: Uuid,
    status: &str,
    duration_ms: i64,
    error_message: Option<&str>,
    metadata: Option<serde_json::Value>,
) -> Result<(), StoreError> {
    store
        .complete_action_log(
            log_id,
            ActionLogCompletion {
                status: status.to_string(),
                duration_ms,
                error_message: error_message.map(|s| s.to_string()),
                metadata,
                completed_at: Utc::now(),
            },
        )
        .await
}

/// One-off, already finished event (state transitions, warnings).
pub async fn log_quick(
    store: &dyn Store,
    action_type: &str,
    instance_id: Option<Uuid>,
    metadata: serde_json::Value,
) {
    if let Err(e) = log_event_with_metadata(store, action_type, "success", instance_id, None, Some(metadata)).await {
        tracing::warn!("[action-log] failed to write {}: {}", action_type, e);
    }
}

/// An `in_progress` entry plus its start time.
pub struct ActionSpan {
    log_id: Option<Uuid>,
    started: Instant,
    action_type: &'static str,
}

impl ActionSpan {
    pub async fn begin(
        store: &dyn Store,
        action_type: &'static str,
        instance_id: Option<Uuid>,
        metadata: serde_json::Value,
    ) -> Self {
        let log_id = match log_event_with_metadata(store, action_type, "in_progress", instance_id, None, Some(metadata)).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("[action-log] failed to open {}: {}", action_type, e);
                None
            }
        };
        Self {
            log_id,
            started: Instant::now(),
            action_type,
        }
    }

    pub async fn success(self, store: &dyn Store, metadata: Option<serde_json::Value>) {
        self.finish(store, "success", None, metadata).await;
    }

    pub async fn failed(self, store: &dyn Store, error: &str, metadata: Option<serde_json::Value>) {
        self.finish(store, "failed", Some(error), metadata).await;
    }

    async fn finish(
        self,
        store: &dyn Store,
        status: &str,
        error: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) {
        let Some(log_id) = self.log_id else {
            return;
        };
        let duration_ms = self.started.elapsed().as_millis() as i64;
        if let Err(e) =
            log_event_complete_with_metadata(store, log_id, status, duration_ms, error, metadata).await
        {
            tracing::warn!("[action-log] failed to complete {}: {}", self.action_type, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn span_writes_both_phases() {
        let store = MemoryStore::new();
        let instance_id = Uuid::new_v4();
        let span = ActionSpan::begin(
            &store,
            PROVIDER_LAUNCH,
            Some(instance_id),
            serde_json::json!({"region": "us-east-1"}),
        )
        .await;
        span.failed(&store, "boom", Some(serde_json::json!({"step": "launch"}))).await;

        let logs = store.list_action_logs(Some(instance_id)).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action_type, PROVIDER_LAUNCH);
        assert_eq!(logs[0].status, "failed");
        assert_eq!(logs[0].error_message.as_deref(), Some("boom"));
        assert!(logs[0].completed_at.is_some());
        assert_eq!(logs[0].metadata.as_ref().unwrap()["step"], "launch");
    }
}
