use rdp_common::InstanceStatus;
use uuid::Uuid;

use crate::logger;
use crate::store::{Store, StoreError};

/// Every status an explicit termination may start from.
pub const NON_TERMINATED: &[InstanceStatus] = &[
    InstanceStatus::Pending,
    InstanceStatus::Running,
    InstanceStatus::Stopping,
    InstanceStatus::Stopped,
    InstanceStatus::ShuttingDown,
    InstanceStatus::Failed,
];

async fn log_state_transition(
    store: &dyn Store,
    instance_id: Uuid,
    from: InstanceStatus,
    to: InstanceStatus,
    reason: &str,
) {
    logger::log_quick(
        store,
        logger::STATE_TRANSITION,
        Some(instance_id),
        serde_json::json!({"from": from.as_str(), "to": to.as_str(), "reason": reason}),
    )
    .await;
}

/// Conditional transition; a no-op (Ok(None)) when the record moved on meanwhile.
pub async fn transition(
    store: &dyn Store,
    instance_id: Uuid,
    from: &[InstanceStatus],
    to: InstanceStatus,
    reason: &str,
) -> Result<Option<InstanceStatus>, StoreError> {
    let prev = store.transition_status(instance_id, from, to).await?;
    match prev {
        Some(prev) => {
            tracing::info!(
                "[state_machine] instance {}: {} -> {} ({})",
                instance_id,
                prev,
                to,
                reason
            );
            log_state_transition(store, instance_id, prev, to, reason).await;
        }
        None => tracing::debug!(
            "[state_machine] instance {}: no transition to {} (not in {:?})",
            instance_id,
            to,
            from
        ),
    }
    Ok(prev)
}

/// PENDING -> RUNNING with address and sealed login secret (idempotent).
pub async fn pending_to_running(
    store: &dyn Store,
    instance_id: Uuid,
    address: &str,
    sealed_secret: &[u8],
) -> Result<bool, StoreError> {
    let done = store.complete_boot(instance_id, address, sealed_secret).await?;
    if done {
        tracing::info!("[state_machine] instance {}: pending -> running", instance_id);
        log_state_transition(
            store,
            instance_id,
            InstanceStatus::Pending,
            InstanceStatus::Running,
            "boot secret and address retrieved",
        )
        .await;
    }
    Ok(done)
}

pub async fn pending_to_failed(
    store: &dyn Store,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool, StoreError> {
    Ok(transition(
        store,
        instance_id,
        &[InstanceStatus::Pending],
        InstanceStatus::Failed,
        reason,
    )
    .await?
    .is_some())
}

pub async fn mark_terminated(
    store: &dyn Store,
    instance_id: Uuid,
    reason: &str,
) -> Result<Option<InstanceStatus>, StoreError> {
    transition(store, instance_id, NON_TERMINATED, InstanceStatus::Terminated, reason).await
}

/// Status the synchronizer should write for a cloud-reported state, if any.
///
/// - cloud `pending` never changes the record
/// - cloud `running` only mirrors onto `stopping`/`stopped` records (polling owns
///   `pending -> running`, `failed` is never revived)
/// - `stopping`, `stopped`, `shutting-down`, `terminated` are mirrored onto any
///   record that is not already terminated (the synchronizer routes `terminated`
///   through the terminate workflow instead of writing it)
pub fn sync_target(current: InstanceStatus, cloud: InstanceStatus) -> Option<InstanceStatus> {
    if current == cloud || current.is_terminated() {
        return None;
    }
    match cloud {
        InstanceStatus::Pending | InstanceStatus::Failed => None,
        InstanceStatus::Running => matches!(
            current,
            InstanceStatus::Stopping | InstanceStatus::Stopped
        )
        .then_some(InstanceStatus::Running),
        InstanceStatus::Stopping
        | InstanceStatus::Stopped
        | InstanceStatus::ShuttingDown
        | InstanceStatus::Terminated => Some(cloud),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceStatus::*;

    #[test]
    fn sync_never_touches_pending_via_running() {
        assert_eq!(sync_target(Pending, Running), None);
        assert_eq!(sync_target(Pending, Pending), None);
        assert_eq!(sync_target(Failed, Running), None);
    }

    #[test]
    fn sync_mirrors_unexpected_states() {
        assert_eq!(sync_target(Running, Stopped), Some(Stopped));
        assert_eq!(sync_target(Pending, Terminated), Some(Terminated));
        assert_eq!(sync_target(Failed, ShuttingDown), Some(ShuttingDown));
        assert_eq!(sync_target(Stopped, Running), Some(Running));
    }

    #[test]
    fn sync_leaves_terminated_records_alone() {
        assert_eq!(sync_target(Terminated, ShuttingDown), None);
        assert_eq!(sync_target(Terminated, Running), None);
        assert_eq!(sync_target(Running, Running), None);
    }
}
