use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdp_common::{Account, AccountStatus, ActionLog, Instance, InstanceStatus};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub label: String,
    pub encrypted_credentials: Vec<u8>,
    pub default_region: String,
    pub status: AccountStatus,
}

/// Instance row written once every cloud resource exists. Status starts at `pending`.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub account_id: Uuid,
    pub region: String,
    pub cloud_instance_id: String,
    pub network_rule_id: String,
    pub key_id: String,
    pub key_name: String,
    pub public_address: Option<String>,
    pub username: String,
}

/// Second phase of a two-phase action log entry.
#[derive(Debug, Clone)]
pub struct ActionLogCompletion {
    pub status: String,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub completed_at: DateTime<Utc>,
}

/// Persistence for accounts, instances and the audit trail.
///
/// Soft-deleted rows (`deleted_at IS NOT NULL`) are invisible to every method.
/// Status writes are conditional on the current status so concurrent workflows
/// (polling vs termination vs sync) never overwrite each other blindly.
#[async_trait]
pub trait Store: Send + Sync {
    // --- accounts ---
    async fn insert_account(&self, account: NewAccount) -> Result<Account, StoreError>;

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, StoreError>;

    /// Ordered by creation time, oldest first.
    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError>;

    async fn touch_account(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    // --- instances ---
    async fn insert_instance(&self, instance: NewInstance) -> Result<Instance, StoreError>;

    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>, StoreError>;

    /// Non-terminated instances for one account + region.
    async fn list_active_instances(
        &self,
        account_id: Uuid,
        region: &str,
    ) -> Result<Vec<Instance>, StoreError>;

    async fn count_active_instances(&self, account_id: Uuid, region: &str) -> Result<u32, StoreError>;

    /// `pending` records created before `before`, oldest first.
    async fn list_stale_pending(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Instance>, StoreError>;

    /// Non-terminated counts grouped by (account, region). Pairs with zero instances are absent.
    async fn active_instance_counts(&self) -> Result<HashMap<(Uuid, String), u32>, StoreError>;

    async fn set_public_address(&self, id: Uuid, address: &str) -> Result<bool, StoreError>;

    /// `pending -> running` together with the address and the sealed login secret.
    async fn complete_boot(
        &self,
        id: Uuid,
        address: &str,
        sealed_secret: &[u8],
    ) -> Result<bool, StoreError>;

    /// Set `to` if the current status is one of `from`. Returns the previous status on success.
    async fn transition_status(
        &self,
        id: Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<Option<InstanceStatus>, StoreError>;

    /// Soft delete, only for `terminated` records.
    async fn archive_instance(&self, id: Uuid) -> Result<bool, StoreError>;

    // --- action logs ---
    async fn insert_action_log(&self, log: ActionLog) -> Result<(), StoreError>;

    async fn complete_action_log(
        &self,
        id: Uuid,
        completion: ActionLogCompletion,
    ) -> Result<(), StoreError>;

    async fn list_action_logs(&self, instance_id: Option<Uuid>) -> Result<Vec<ActionLog>, StoreError>;
}
