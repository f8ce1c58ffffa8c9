use chrono::{DateTime, Utc};
use rand::Rng;
use rdp_common::bus::normalize_name_prefix;
use rdp_common::{Account, Instance};
use rdp_providers::inventory::{LaunchRequest, NetworkRuleSpec};
use rdp_providers::CloudProvider;
use serde_json::json;
use uuid::Uuid;

use crate::error::{OrchestratorError, ProvisionStep, Result};
use crate::logger::{self, ActionSpan};
use crate::queue::Task;
use crate::services::Orchestrator;
use crate::store::NewInstance;

/// `{prefix}-{unix_seconds}-{4 hex}`; the suffix keeps concurrent tasks with the same prefix apart.
pub fn derive_identifier(prefix: &str, now: DateTime<Utc>) -> String {
    let suffix: u16 = rand::thread_rng().gen();
    format!("{}-{}-{:04x}", prefix, now.timestamp(), suffix)
}

pub fn network_rule_name(identifier: &str) -> String {
    format!("rdp-sg-{}", identifier)
}

pub fn key_name(identifier: &str) -> String {
    format!("key-{}", identifier)
}

/// Cloud resources created so far, in creation order.
#[derive(Default)]
struct Created {
    network_rule_id: Option<String>,
    key: Option<(String, String)>,
    key_stored: bool,
    cloud_instance_id: Option<String>,
}

impl Orchestrator {
    /// Provision one instance and schedule its first boot-secret poll.
    pub async fn request_instance(
        &self,
        account_id: Uuid,
        region: &str,
        name_prefix: Option<&str>,
    ) -> Result<Instance> {
        let prefix = normalize_name_prefix(name_prefix)?;
        self.request_labelled(account_id, region, &prefix).await
    }

    /// [`Self::request_instance`] with a prefix that was validated when its task was queued.
    pub(crate) async fn request_labelled(
        &self,
        account_id: Uuid,
        region: &str,
        prefix: &str,
    ) -> Result<Instance> {
        let instance = self.provision_labelled(account_id, region, prefix).await?;
        self.queue
            .push(
                Task::PollBootSecret {
                    instance_id: instance.id,
                    attempt: 1,
                },
                self.config.polling.initial_delay,
            )
            .await?;
        tracing::info!(
            "[provisioning] instance {} scheduled for boot-secret polling in {}s",
            instance.id,
            self.config.polling.initial_delay.as_secs()
        );
        Ok(instance)
    }

    /// Queue a provisioning task without waiting for it.
    pub async fn enqueue_provision(
        &self,
        account_id: Uuid,
        region: &str,
        name_prefix: Option<&str>,
    ) -> Result<Uuid> {
        if self.config.regions.image_for(region).is_none() {
            return Err(OrchestratorError::UnsupportedRegion(region.to_string()));
        }
        let prefix = normalize_name_prefix(name_prefix)?;
        self.push_provision_task(account_id, region, prefix).await
    }

    pub(crate) async fn push_provision_task(
        &self,
        account_id: Uuid,
        region: &str,
        name_prefix: String,
    ) -> Result<Uuid> {
        let task_id = self
            .queue
            .push(
                Task::Provision {
                    account_id,
                    region: region.to_string(),
                    name_prefix,
                },
                std::time::Duration::ZERO,
            )
            .await?;
        Ok(task_id)
    }

    /// Stand up one instance: network rule, key material, launch, `pending` record.
    ///
    /// The caller schedules polling (see [`Self::request_instance`]). On failure every
    /// resource created so far is removed best-effort and no record is written.
    pub async fn provision(
        &self,
        account_id: Uuid,
        region: &str,
        name_prefix: Option<&str>,
    ) -> Result<Instance> {
        if self.config.regions.image_for(region).is_none() {
            return Err(OrchestratorError::UnsupportedRegion(region.to_string()));
        }
        let prefix = normalize_name_prefix(name_prefix)?;
        self.provision_labelled(account_id, region, &prefix).await
    }

    async fn provision_labelled(
        &self,
        account_id: Uuid,
        region: &str,
        prefix: &str,
    ) -> Result<Instance> {
        let image_id = self
            .config
            .regions
            .image_for(region)
            .ok_or_else(|| OrchestratorError::UnsupportedRegion(region.to_string()))?
            .to_string();
        let account = self.resolve_active_account(account_id).await?;

        let _guard = self.capacity_locks.acquire(account.id, region).await;
        let cap = self.config.capacity_per_region;
        let active = self.store.count_active_instances(account.id, region).await?;
        if active >= cap {
            tracing::warn!(
                "[provisioning] account {} region {} at capacity ({}/{})",
                account.id,
                region,
                active,
                cap
            );
            return Err(OrchestratorError::CapacityExceeded { available: 0 });
        }

        let client = self
            .client_for(&account, region)
            .map_err(|e| OrchestratorError::provisioning(ProvisionStep::Connect, e))?;

        let identifier = derive_identifier(prefix, Utc::now());
        let span = ActionSpan::begin(
            self.store.as_ref(),
            logger::EXECUTE_CREATE,
            None,
            json!({
                "account_id": account.id,
                "region": region,
                "identifier": identifier,
                "image_id": image_id,
            }),
        )
        .await;

        let mut created = Created::default();
        match self
            .run_provision_steps(client.as_ref(), &account, region, &image_id, &identifier, &mut created)
            .await
        {
            Ok(instance) => {
                span.success(
                    self.store.as_ref(),
                    Some(json!({
                        "instance_id": instance.id,
                        "cloud_instance_id": instance.cloud_instance_id,
                    })),
                )
                .await;
                tracing::info!(
                    "[provisioning] instance {} ({}) launched in {} for account {}",
                    instance.id,
                    instance.cloud_instance_id,
                    region,
                    account.id
                );
                Ok(instance)
            }
            Err(err) => {
                tracing::error!("[provisioning] {} failed: {}", identifier, err);
                self.rollback(client.as_ref(), &identifier, created).await;
                span.failed(self.store.as_ref(), &err.to_string(), None).await;
                Err(err)
            }
        }
    }

    async fn run_provision_steps(
        &self,
        client: &dyn CloudProvider,
        account: &Account,
        region: &str,
        image_id: &str,
        identifier: &str,
        created: &mut Created,
    ) -> Result<Instance> {
        let store = self.store.as_ref();

        // 1. network rule
        let rule_spec = NetworkRuleSpec {
            name: network_rule_name(identifier),
            description: "RDP Access".to_string(),
            protocol: "tcp".to_string(),
            port: self.config.rdp_port,
            cidr: self.config.allowed_cidr.clone(),
        };
        let span = ActionSpan::begin(
            store,
            logger::PROVIDER_CREATE_NETWORK_RULE,
            None,
            json!({"name": rule_spec.name, "region": region}),
        )
        .await;
        let rule_id = match client.create_network_rule(&rule_spec).await {
            Ok(id) => {
                span.success(store, Some(json!({"network_rule_id": id}))).await;
                id
            }
            Err(e) => {
                span.failed(store, &e.to_string(), None).await;
                return Err(OrchestratorError::provisioning(ProvisionStep::NetworkRule, e));
            }
        };
        created.network_rule_id = Some(rule_id.clone());

        // 2. key material, plaintext goes straight to the key store
        let key_name = key_name(identifier);
        let span = ActionSpan::begin(store, logger::PROVIDER_CREATE_KEY, None, json!({"key_name": key_name})).await;
        let material = match client.create_key_material(&key_name).await {
            Ok(m) => {
                span.success(store, Some(json!({"key_id": m.key_id}))).await;
                m
            }
            Err(e) => {
                span.failed(store, &e.to_string(), None).await;
                return Err(OrchestratorError::provisioning(ProvisionStep::KeyMaterial, e));
            }
        };
        created.key = Some((material.key_id.clone(), material.key_name.clone()));
        self.keys
            .put(&material.key_name, &material.private_key_pem)
            .await
            .map_err(|e| OrchestratorError::provisioning(ProvisionStep::StoreKey, e))?;
        created.key_stored = true;
        let key_id = material.key_id.clone();
        drop(material);

        // 3. launch
        let request = LaunchRequest {
            image_id: image_id.to_string(),
            instance_size: self.config.instance_size.clone(),
            key_name: key_name.clone(),
            network_rule_id: rule_id.clone(),
            tags: vec![("Name".to_string(), key_name.clone())],
        };
        let span = ActionSpan::begin(
            store,
            logger::PROVIDER_LAUNCH,
            None,
            json!({"image_id": request.image_id, "instance_size": request.instance_size, "region": region}),
        )
        .await;
        let cloud_instance_id = match client.launch_instance(&request).await {
            Ok(id) => {
                span.success(store, Some(json!({"cloud_instance_id": id}))).await;
                id
            }
            Err(e) => {
                span.failed(store, &e.to_string(), None).await;
                return Err(OrchestratorError::provisioning(ProvisionStep::Launch, e));
            }
        };
        created.cloud_instance_id = Some(cloud_instance_id.clone());

        // 4. record
        self.store
            .insert_instance(NewInstance {
                account_id: account.id,
                region: region.to_string(),
                cloud_instance_id,
                network_rule_id: rule_id,
                key_id,
                key_name,
                public_address: None,
                username: self.config.username.clone(),
            })
            .await
            .map_err(|e| OrchestratorError::provisioning(ProvisionStep::Persist, e))
    }

    /// Compensating cleanup in reverse creation order. Failures are logged, never raised.
    async fn rollback(&self, client: &dyn CloudProvider, identifier: &str, created: Created) {
        let mut cleaned: Vec<&str> = Vec::new();
        let mut leaked: Vec<String> = Vec::new();

        if let Some(id) = &created.cloud_instance_id {
            match client.terminate_instance(id).await {
                Ok(()) => cleaned.push("instance"),
                Err(e) => leaked.push(format!("instance {}: {}", id, e)),
            }
        }
        if let Some((key_id, key_name)) = &created.key {
            match client.delete_key_material(key_id).await {
                Ok(()) => cleaned.push("key_material"),
                Err(e) if e.is_not_found() => cleaned.push("key_material"),
                Err(e) => leaked.push(format!("key {}: {}", key_id, e)),
            }
            if created.key_stored {
                match self.keys.delete(key_name).await {
                    Ok(()) => cleaned.push("key_store"),
                    Err(e) => leaked.push(format!("key store {}: {}", key_name, e)),
                }
            }
        }
        if let Some(rule_id) = &created.network_rule_id {
            match client.delete_network_rule(rule_id).await {
                Ok(()) => cleaned.push("network_rule"),
                Err(e) => leaked.push(format!("network rule {}: {}", rule_id, e)),
            }
        }

        if cleaned.is_empty() && leaked.is_empty() {
            return;
        }
        for item in &leaked {
            tracing::warn!("[provisioning] rollback of {} left {}", identifier, item);
        }
        logger::log_quick(
            self.store.as_ref(),
            logger::PROVISION_ROLLBACK,
            None,
            json!({"identifier": identifier, "cleaned": cleaned, "leaked": leaked}),
        )
        .await;
    }
}
