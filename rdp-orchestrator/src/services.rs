use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rdp_common::{Account, AccountStatus, InstanceStatus};
use rdp_providers::{CloudContext, CloudCredentials, CloudProvider, ProviderFactory};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::crypto::SecretsCrypto;
use crate::error::{OrchestratorError, Result};
use crate::keystore::KeyStore;
use crate::queue::TaskQueue;
use crate::store::{NewAccount, Store};

/// Credentials as sealed at rest in `rdp_accounts.encrypted_credentials`.
#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    access_key_id: String,
    secret_access_key: String,
}

/// Per-(account, region) async locks serialising the capacity re-check with the record insert.
#[derive(Clone, Default)]
pub struct CapacityLocks {
    locks: Arc<Mutex<HashMap<(Uuid, String), Arc<tokio::sync::Mutex<()>>>>>,
}

impl CapacityLocks {
    pub async fn acquire(&self, account_id: Uuid, region: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            map.entry((account_id, region.to_string()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Entry point for the presentation layer and the worker.
///
/// Cheap to clone; every collaborator sits behind an `Arc`. No cloud client is
/// ever stored here: each workflow builds its own, bound to one account + region.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) keys: Arc<dyn KeyStore>,
    pub(crate) queue: Arc<dyn TaskQueue>,
    pub(crate) cloud: Arc<dyn ProviderFactory>,
    pub(crate) crypto: Arc<SecretsCrypto>,
    pub(crate) config: Arc<OrchestratorConfig>,
    pub(crate) capacity_locks: CapacityLocks,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        keys: Arc<dyn KeyStore>,
        queue: Arc<dyn TaskQueue>,
        cloud: Arc<dyn ProviderFactory>,
        crypto: Arc<SecretsCrypto>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            keys,
            queue,
            cloud,
            crypto,
            config: Arc::new(config),
            capacity_locks: CapacityLocks::default(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn queue(&self) -> &dyn TaskQueue {
        self.queue.as_ref()
    }

    pub fn provider_name(&self) -> &str {
        self.cloud.name()
    }

    /// Seal credentials and persist an `active` account.
    pub async fn register_account(
        &self,
        label: &str,
        credentials: CloudCredentials,
        default_region: &str,
    ) -> Result<Account> {
        if self.config.regions.image_for(default_region).is_none() {
            return Err(OrchestratorError::UnsupportedRegion(default_region.to_string()));
        }
        let stored = StoredCredentials {
            access_key_id: credentials.access_key_id,
            secret_access_key: credentials.secret_access_key.expose_secret().to_string(),
        };
        let plain = serde_json::to_vec(&stored)
            .map_err(|e| crate::crypto::SecretsError::EncryptionFailed(e.to_string()))?;
        let encrypted_credentials = self.crypto.seal(&plain)?;

        let account = self
            .store
            .insert_account(NewAccount {
                label: label.to_string(),
                encrypted_credentials,
                default_region: default_region.to_string(),
                status: AccountStatus::Active,
            })
            .await?;
        tracing::info!("[accounts] registered account {} ({})", account.id, account.label);
        Ok(account)
    }

    pub(crate) async fn load_account(&self, account_id: Uuid) -> Result<Account> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or(OrchestratorError::AccountNotFound(account_id))
    }

    /// Like [`Self::load_account`], but only `active` accounts.
    pub(crate) async fn resolve_active_account(&self, account_id: Uuid) -> Result<Account> {
        let account = self.load_account(account_id).await?;
        if !account.is_active() {
            return Err(OrchestratorError::AccountInactive(account_id));
        }
        Ok(account)
    }

    fn open_credentials(&self, account: &Account) -> Result<CloudCredentials> {
        let plain = self.crypto.open(&account.encrypted_credentials)?;
        let stored: StoredCredentials = serde_json::from_slice(&plain)
            .map_err(|e| crate::crypto::SecretsError::DecryptionFailed(e.to_string()))?;
        Ok(CloudCredentials {
            access_key_id: stored.access_key_id,
            secret_access_key: SecretString::from(stored.secret_access_key),
        })
    }

    /// Fresh client bound to `account` + `region`, never shared between tasks.
    pub(crate) fn client_for(&self, account: &Account, region: &str) -> Result<Box<dyn CloudProvider>> {
        let ctx = CloudContext {
            account_id: account.id,
            region: region.to_string(),
            credentials: self.open_credentials(account)?,
        };
        self.cloud.connect(&ctx).map_err(OrchestratorError::cloud)
    }

    /// Decrypt the stored login secret. None while the instance is still booting.
    pub async fn reveal_login_secret(&self, instance_id: Uuid) -> Result<Option<SecretString>> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound(instance_id))?;
        match instance.login_secret.as_deref() {
            Some(sealed) if !sealed.is_empty() => Ok(Some(self.crypto.open_string(sealed)?)),
            _ => Ok(None),
        }
    }

    /// Soft-delete a terminated record. The row stays in the table for audit.
    pub async fn archive(&self, instance_id: Uuid) -> Result<()> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound(instance_id))?;
        if instance.status != InstanceStatus::Terminated || !self.store.archive_instance(instance_id).await? {
            return Err(OrchestratorError::InvalidState {
                instance_id,
                status: instance.status,
                action: "archive",
            });
        }
        tracing::info!("[accounts] archived terminated instance {}", instance_id);
        Ok(())
    }
}
