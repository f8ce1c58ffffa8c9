use chrono::Utc;
use rdp_common::InstanceStatus;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::logger::{self, ActionSpan};
use crate::queue::Task;
use crate::services::Orchestrator;
use crate::state_machine;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub checked: usize,
    pub status_updated: usize,
    pub address_updated: usize,
    /// Local records the describe call did not return.
    pub missing: usize,
    /// Records the cloud reported terminated, handed to the terminate workflow.
    pub terminations_queued: usize,
    pub describe_calls: usize,
}

impl SyncReport {
    fn absorb(&mut self, other: &SyncReport) {
        self.checked += other.checked;
        self.status_updated += other.status_updated;
        self.address_updated += other.address_updated;
        self.missing += other.missing;
        self.terminations_queued += other.terminations_queued;
        self.describe_calls += other.describe_calls;
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncSummary {
    pub pairs: usize,
    pub failures: usize,
    pub totals: SyncReport,
}

impl Orchestrator {
    /// Reconcile every non-terminated record of one account + region with a single
    /// batched describe call. No cloud call at all when there is nothing to check.
    pub async fn sync(&self, account_id: Uuid, region: &str) -> Result<SyncReport> {
        let account = self.load_account(account_id).await?;
        let instances = self.store.list_active_instances(account.id, region).await?;
        let mut report = SyncReport::default();
        if instances.is_empty() {
            tracing::debug!("[sync] account {} region {}: nothing to check", account.id, region);
            return Ok(report);
        }

        let store = self.store.as_ref();
        let span = ActionSpan::begin(
            store,
            logger::STATUS_SYNC,
            None,
            json!({"account_id": account.id, "region": region, "instances": instances.len()}),
        )
        .await;

        let client = match self.client_for(&account, region) {
            Ok(c) => c,
            Err(e) => {
                span.failed(store, &e.to_string(), None).await;
                return Err(e);
            }
        };
        let ids: Vec<String> = instances.iter().map(|i| i.cloud_instance_id.clone()).collect();
        report.describe_calls += 1;
        let described = match client.describe_instances(&ids).await {
            Ok(d) => d,
            Err(e) => {
                span.failed(store, &e.to_string(), None).await;
                return Err(OrchestratorError::cloud(e));
            }
        };

        for instance in &instances {
            report.checked += 1;
            let Some(desc) = described.get(&instance.cloud_instance_id) else {
                report.missing += 1;
                tracing::warn!(
                    "[sync] instance {} ({}) not returned by provider, leaving {} unchanged",
                    instance.id,
                    instance.cloud_instance_id,
                    instance.status
                );
                continue;
            };

            if let Some(addr) = desc.public_address.as_deref() {
                if instance.public_address.as_deref() != Some(addr)
                    && self.store.set_public_address(instance.id, addr).await?
                {
                    report.address_updated += 1;
                }
            }

            let Some(cloud_status) = InstanceStatus::from_cloud_state(&desc.state) else {
                tracing::debug!(
                    "[sync] instance {}: untracked cloud state '{}'",
                    instance.id,
                    desc.state
                );
                continue;
            };
            if cloud_status == InstanceStatus::Terminated {
                // Key material and the network rule still exist; only the terminate
                // workflow may move the record to `terminated`.
                self.queue
                    .push(Task::Terminate { instance_id: instance.id }, std::time::Duration::ZERO)
                    .await?;
                logger::log_quick(
                    store,
                    logger::CLOUD_TERMINATED,
                    Some(instance.id),
                    json!({"cloud_instance_id": instance.cloud_instance_id, "from_status": instance.status.as_str()}),
                )
                .await;
                tracing::warn!(
                    "[sync] instance {} terminated outside the orchestrator, cleanup queued",
                    instance.id
                );
                report.terminations_queued += 1;
                continue;
            }
            if let Some(target) = state_machine::sync_target(instance.status, cloud_status) {
                let reason = format!("cloud reported {}", desc.state);
                if state_machine::transition(store, instance.id, &[instance.status], target, &reason)
                    .await?
                    .is_some()
                {
                    report.status_updated += 1;
                }
            }
        }

        self.store.touch_account(account.id, Utc::now()).await?;
        tracing::info!(
            "[sync] account {} region {}: checked={} updated={} missing={} terminating={}",
            account.id,
            region,
            report.checked,
            report.status_updated,
            report.missing,
            report.terminations_queued
        );
        span.success(store, Some(json!({"report": report}))).await;
        Ok(report)
    }

    /// Every known account in every configured region. One pair failing does not stop the rest.
    pub async fn sync_all(&self) -> Result<SyncSummary> {
        let accounts = self.store.list_accounts().await?;
        let regions: Vec<String> = self.config.regions.regions().map(str::to_string).collect();
        let mut summary = SyncSummary::default();

        for account in &accounts {
            for region in &regions {
                summary.pairs += 1;
                match self.sync(account.id, region).await {
                    Ok(report) => summary.totals.absorb(&report),
                    Err(e) => {
                        summary.failures += 1;
                        tracing::error!("[sync] account {} region {} failed: {}", account.id, region, e);
                    }
                }
            }
        }
        Ok(summary)
    }

    /// One account across every configured region.
    pub async fn sync_account(&self, account_id: Uuid) -> Result<SyncReport> {
        let mut totals = SyncReport::default();
        let regions: Vec<String> = self.config.regions.regions().map(str::to_string).collect();
        for region in &regions {
            totals.absorb(&self.sync(account_id, region).await?);
        }
        Ok(totals)
    }
}
