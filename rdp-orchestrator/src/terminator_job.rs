use std::time::Duration;

use rdp_common::Instance;
use rdp_providers::{CloudProvider, ProviderError};
use serde_json::json;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::logger::{self, ActionSpan};
use crate::queue::Task;
use crate::services::Orchestrator;
use crate::state_machine;

impl Orchestrator {
    /// Queue a termination for the worker.
    pub async fn request_termination(&self, instance_id: Uuid) -> Result<Uuid> {
        if self.store.get_instance(instance_id).await?.is_none() {
            return Err(OrchestratorError::InstanceNotFound(instance_id));
        }
        Ok(self
            .queue
            .push(Task::Terminate { instance_id }, Duration::ZERO)
            .await?)
    }

    /// Tear down cloud resources, then mark the record `terminated`.
    ///
    /// Order: instance, key material (cloud + key store), status, network rule.
    /// Returns `Ok(false)` when the record was already terminated. Any failure before
    /// the status write leaves the record untouched so the call can be retried; the
    /// network rule step is best-effort because the rule stays referenced until the
    /// instance has fully shut down.
    pub async fn terminate(&self, instance_id: Uuid) -> Result<bool> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound(instance_id))?;
        if instance.status.is_terminated() {
            tracing::info!("[job-terminator] instance {} already terminated", instance_id);
            return Ok(false);
        }

        let store = self.store.as_ref();
        let span = ActionSpan::begin(
            store,
            logger::EXECUTE_TERMINATE,
            Some(instance.id),
            json!({
                "cloud_instance_id": instance.cloud_instance_id,
                "region": instance.region,
                "from_status": instance.status.as_str(),
            }),
        )
        .await;

        let released = match self.load_account(instance.account_id).await {
            Ok(account) => match self.client_for(&account, &instance.region) {
                Ok(client) => self
                    .release_instance_resources(&instance, client.as_ref())
                    .await
                    .map(|()| client),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let client = match released {
            Ok(client) => client,
            Err(e) => {
                tracing::error!("[job-terminator] instance {} termination failed: {}", instance.id, e);
                span.failed(store, &e.to_string(), None).await;
                return Err(e);
            }
        };

        let prev = state_machine::mark_terminated(store, instance.id, "explicit termination").await?;
        if prev.is_none() {
            tracing::info!(
                "[job-terminator] instance {} was terminated concurrently",
                instance.id
            );
            span.success(store, Some(json!({"already_terminated": true}))).await;
            return Ok(false);
        }

        let rule_removed = self
            .delete_network_rule_best_effort(&instance, client.as_ref())
            .await;
        span.success(store, Some(json!({"network_rule_removed": rule_removed}))).await;
        tracing::info!("[job-terminator] instance {} terminated", instance.id);
        Ok(true)
    }

    async fn release_instance_resources(
        &self,
        instance: &Instance,
        client: &dyn CloudProvider,
    ) -> Result<()> {
        let store = self.store.as_ref();

        let span = ActionSpan::begin(
            store,
            logger::PROVIDER_TERMINATE,
            Some(instance.id),
            json!({"cloud_instance_id": instance.cloud_instance_id}),
        )
        .await;
        match client.terminate_instance(&instance.cloud_instance_id).await {
            Ok(()) => span.success(store, None).await,
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    "[job-terminator] cloud instance {} already gone",
                    instance.cloud_instance_id
                );
                span.success(store, Some(json!({"already_gone": true}))).await;
            }
            Err(e) => {
                span.failed(store, &e.to_string(), None).await;
                return Err(OrchestratorError::cloud(e));
            }
        }

        match client.delete_key_material(&instance.key_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::warn!("[job-terminator] key material {} already gone", instance.key_id)
            }
            Err(e) => return Err(OrchestratorError::cloud(e)),
        }
        self.keys.delete(&instance.key_name).await?;
        Ok(())
    }

    async fn delete_network_rule_best_effort(
        &self,
        instance: &Instance,
        client: &dyn CloudProvider,
    ) -> bool {
        match client.delete_network_rule(&instance.network_rule_id).await {
            Ok(()) => true,
            Err(ProviderError::ResourceInUse(_)) => {
                tracing::warn!(
                    "[job-terminator] network rule {} still in use by {}, leaving it for later",
                    instance.network_rule_id,
                    instance.cloud_instance_id
                );
                logger::log_quick(
                    self.store.as_ref(),
                    logger::NETWORK_RULE_CLEANUP_PENDING,
                    Some(instance.id),
                    json!({"network_rule_id": instance.network_rule_id, "reason": "resource_in_use"}),
                )
                .await;
                false
            }
            Err(ProviderError::NotFound(_)) => {
                tracing::warn!(
                    "[job-terminator] network rule {} already removed",
                    instance.network_rule_id
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    "[job-terminator] network rule {} cleanup failed: {}",
                    instance.network_rule_id,
                    e
                );
                logger::log_quick(
                    self.store.as_ref(),
                    logger::NETWORK_RULE_CLEANUP_PENDING,
                    Some(instance.id),
                    json!({"network_rule_id": instance.network_rule_id, "reason": e.to_string()}),
                )
                .await;
                false
            }
        }
    }
}
