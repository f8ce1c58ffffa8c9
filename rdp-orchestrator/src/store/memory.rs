use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdp_common::{Account, ActionLog, Instance, InstanceStatus};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ActionLogCompletion, NewAccount, NewInstance, Store, StoreError};

#[derive(Default)]
struct Tables {
    accounts: Vec<Account>,
    instances: Vec<Instance>,
    action_logs: Vec<ActionLog>,
}

impl Tables {
    fn live_instance_mut(&mut self, id: Uuid) -> Option<&mut Instance> {
        self.instances
            .iter_mut()
            .find(|i| i.id == id && i.deleted_at.is_none())
    }
}

/// In-memory [`Store`] used by tests and `DATABASE_URL=memory` dev runs.
#[derive(Default, Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed record, bypassing the workflow (fixtures).
    pub async fn seed_instance(&self, instance: Instance) {
        self.tables.write().await.instances.push(instance);
    }

    pub async fn all_instances(&self) -> Vec<Instance> {
        self.tables.read().await.instances.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        let now = Utc::now();
        let row = Account {
            id: Uuid::new_v4(),
            label: account.label,
            encrypted_credentials: account.encrypted_credentials,
            default_region: account.default_region,
            status: account.status,
            last_ping_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.tables.write().await.accounts.push(row.clone());
        Ok(row)
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .accounts
            .iter()
            .find(|a| a.id == id && a.deleted_at.is_none())
            .cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .accounts
            .iter()
            .filter(|a| a.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn touch_account(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        if let Some(a) = t.accounts.iter_mut().find(|a| a.id == id) {
            a.last_ping_at = Some(at);
        }
        Ok(())
    }

    async fn insert_instance(&self, instance: NewInstance) -> Result<Instance, StoreError> {
        let now = Utc::now();
        let row = Instance {
            id: Uuid::new_v4(),
            account_id: instance.account_id,
            region: instance.region,
            cloud_instance_id: instance.cloud_instance_id,
            network_rule_id: instance.network_rule_id,
            key_id: instance.key_id,
            key_name: instance.key_name,
            public_address: instance.public_address,
            username: instance.username,
            login_secret: None,
            status: InstanceStatus::Pending,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.tables.write().await.instances.push(row.clone());
        Ok(row)
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .instances
            .iter()
            .find(|i| i.id == id && i.deleted_at.is_none())
            .cloned())
    }

    async fn list_active_instances(
        &self,
        account_id: Uuid,
        region: &str,
    ) -> Result<Vec<Instance>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .instances
            .iter()
            .filter(|i| {
                i.account_id == account_id
                    && i.region == region
                    && i.deleted_at.is_none()
                    && !i.status.is_terminated()
            })
            .cloned()
            .collect())
    }

    async fn count_active_instances(&self, account_id: Uuid, region: &str) -> Result<u32, StoreError> {
        Ok(self.list_active_instances(account_id, region).await?.len() as u32)
    }

    async fn list_stale_pending(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Instance>, StoreError> {
        let mut stale: Vec<Instance> = self
            .tables
            .read()
            .await
            .instances
            .iter()
            .filter(|i| {
                i.deleted_at.is_none() && i.status == InstanceStatus::Pending && i.created_at < before
            })
            .cloned()
            .collect();
        stale.sort_by_key(|i| i.created_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn active_instance_counts(&self) -> Result<HashMap<(Uuid, String), u32>, StoreError> {
        let mut counts = HashMap::new();
        for i in self
            .tables
            .read()
            .await
            .instances
            .iter()
            .filter(|i| i.deleted_at.is_none() && !i.status.is_terminated())
        {
            *counts.entry((i.account_id, i.region.clone())).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn set_public_address(&self, id: Uuid, address: &str) -> Result<bool, StoreError> {
        let mut t = self.tables.write().await;
        match t.live_instance_mut(id) {
            Some(i) => {
                i.public_address = Some(address.to_string());
                i.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete_boot(
        &self,
        id: Uuid,
        address: &str,
        sealed_secret: &[u8],
    ) -> Result<bool, StoreError> {
        let mut t = self.tables.write().await;
        match t.live_instance_mut(id) {
            Some(i) if i.status == InstanceStatus::Pending => {
                i.public_address = Some(address.to_string());
                i.login_secret = Some(sealed_secret.to_vec());
                i.status = InstanceStatus::Running;
                i.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<Option<InstanceStatus>, StoreError> {
        let mut t = self.tables.write().await;
        match t.live_instance_mut(id) {
            Some(i) if from.contains(&i.status) => {
                let prev = i.status;
                i.status = to;
                i.updated_at = Utc::now();
                Ok(Some(prev))
            }
            _ => Ok(None),
        }
    }

    async fn archive_instance(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut t = self.tables.write().await;
        match t.live_instance_mut(id) {
            Some(i) if i.status.is_terminated() => {
                i.deleted_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_action_log(&self, log: ActionLog) -> Result<(), StoreError> {
        self.tables.write().await.action_logs.push(log);
        Ok(())
    }

    async fn complete_action_log(
        &self,
        id: Uuid,
        completion: ActionLogCompletion,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        if let Some(log) = t.action_logs.iter_mut().find(|l| l.id == id) {
            log.status = completion.status;
            log.duration_ms = Some(completion.duration_ms);
            log.error_message = completion.error_message;
            if completion.metadata.is_some() {
                log.metadata = completion.metadata;
            }
            log.completed_at = Some(completion.completed_at);
        }
        Ok(())
    }

    async fn list_action_logs(&self, instance_id: Option<Uuid>) -> Result<Vec<ActionLog>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .action_logs
            .iter()
            .filter(|l| instance_id.is_none() || l.instance_id == instance_id)
            .cloned()
            .collect())
    }
}
