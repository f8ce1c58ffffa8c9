//! Boot-secret / address polling.
//!
//! One attempt runs per queued `PollBootSecret` task; a retry is a new task pushed
//! with the retry delay, so at most one attempt per instance is ever in flight and
//! no worker sleeps between attempts.

use std::time::Duration;

use rdp_common::InstanceStatus;
use serde_json::json;
use uuid::Uuid;

use crate::crypto;
use crate::error::{OrchestratorError, Result};
use crate::logger::{self, ActionSpan};
use crate::queue::Task;
use crate::services::Orchestrator;
use crate::state_machine;

/// Result of a single polling attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Secret stored and status is now `running`.
    Ready { address: String },
    NotYetAvailable { reason: String },
    Failed { reason: String, retryable: bool },
    /// Record is gone or no longer `pending` (terminated, failed, already ready).
    Skipped { status: Option<InstanceStatus> },
}

/// What the scheduler did with an attempt's outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollDecision {
    Completed,
    Rescheduled { next_attempt: u32, delay: Duration },
    MarkedFailed { reason: String },
    Stopped,
}

fn failed(err: OrchestratorError) -> PollOutcome {
    let retryable = !matches!(err, OrchestratorError::KeyMaterialMissing(_));
    PollOutcome::Failed {
        reason: err.to_string(),
        retryable,
    }
}

impl Orchestrator {
    /// Run one attempt against the instance's own account and region.
    pub async fn poll_attempt(&self, instance_id: Uuid) -> PollOutcome {
        let instance = match self.store.get_instance(instance_id).await {
            Ok(Some(i)) => i,
            Ok(None) => return PollOutcome::Skipped { status: None },
            Err(e) => return failed(e.into()),
        };
        if instance.status != InstanceStatus::Pending {
            return PollOutcome::Skipped {
                status: Some(instance.status),
            };
        }

        let account = match self.load_account(instance.account_id).await {
            Ok(a) => a,
            Err(e) => return failed(e),
        };
        let client = match self.client_for(&account, &instance.region) {
            Ok(c) => c,
            Err(e) => return failed(e),
        };

        let mut address = instance.public_address.clone();
        if address.is_none() {
            match client
                .describe_instances(std::slice::from_ref(&instance.cloud_instance_id))
                .await
            {
                Ok(found) => {
                    let assigned = found
                        .get(&instance.cloud_instance_id)
                        .and_then(|d| d.public_address.clone());
                    if let Some(addr) = assigned {
                        if let Err(e) = self.store.set_public_address(instance.id, &addr).await {
                            return failed(e.into());
                        }
                        tracing::info!("[job-polling] instance {} got address {}", instance.id, addr);
                        address = Some(addr);
                    }
                }
                Err(e) => return failed(OrchestratorError::cloud(e)),
            }
        }

        let private_key = match self.keys.get(&instance.key_name).await {
            Ok(Some(pem)) => pem,
            Ok(None) => return failed(OrchestratorError::KeyMaterialMissing(instance.key_name.clone())),
            Err(e) => return failed(e.into()),
        };

        let Some(address) = address else {
            return PollOutcome::NotYetAvailable {
                reason: "public address not assigned yet".to_string(),
            };
        };

        let encoded = match client.fetch_boot_secret(&instance.cloud_instance_id).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                return PollOutcome::NotYetAvailable {
                    reason: "boot secret not available yet".to_string(),
                }
            }
            Err(e) => return failed(OrchestratorError::cloud(e)),
        };

        let sealed = match crypto::decrypt_boot_secret(&private_key, &encoded)
            .and_then(|secret| self.crypto.seal_str(&secret))
        {
            Ok(sealed) => sealed,
            Err(e) => return failed(e.into()),
        };

        match state_machine::pending_to_running(self.store.as_ref(), instance.id, &address, &sealed).await {
            Ok(true) => PollOutcome::Ready { address },
            // Terminated or failed while we were talking to the cloud.
            Ok(false) => PollOutcome::Skipped {
                status: self
                    .store
                    .get_instance(instance.id)
                    .await
                    .ok()
                    .flatten()
                    .map(|i| i.status),
            },
            Err(e) => failed(e.into()),
        }
    }

    /// Execute attempt `attempt` (1-based) and schedule the follow-up, if any.
    pub async fn run_poll_task(&self, instance_id: Uuid, attempt: u32) -> Result<PollDecision> {
        let max_attempts = self.config.polling.max_attempts;
        let store = self.store.as_ref();
        let span = ActionSpan::begin(
            store,
            logger::POLL_BOOT_SECRET,
            Some(instance_id),
            json!({"attempt": attempt, "max_attempts": max_attempts}),
        )
        .await;

        let outcome = self.poll_attempt(instance_id).await;
        let (reason, retryable) = match outcome {
            PollOutcome::Ready { address } => {
                tracing::info!(
                    "[job-polling] instance {} ready at {} (attempt {}/{})",
                    instance_id,
                    address,
                    attempt,
                    max_attempts
                );
                span.success(store, Some(json!({"outcome": "ready"}))).await;
                return Ok(PollDecision::Completed);
            }
            PollOutcome::Skipped { status } => {
                tracing::info!(
                    "[job-polling] instance {} no longer pending ({:?}), stopping",
                    instance_id,
                    status
                );
                span.success(store, Some(json!({"outcome": "skipped"}))).await;
                return Ok(PollDecision::Stopped);
            }
            PollOutcome::NotYetAvailable { reason } => (reason, true),
            PollOutcome::Failed { reason, retryable } => {
                tracing::warn!(
                    "[job-polling] instance {} attempt {}/{} failed: {}",
                    instance_id,
                    attempt,
                    max_attempts,
                    reason
                );
                (reason, retryable)
            }
        };

        if retryable && attempt < max_attempts {
            let delay = self.config.polling.retry_delay;
            let next_attempt = attempt + 1;
            let pushed = self
                .queue
                .push(
                    Task::PollBootSecret {
                        instance_id,
                        attempt: next_attempt,
                    },
                    delay,
                )
                .await;
            if let Err(e) = pushed {
                // Without a follow-up task nothing would ever poll this record again.
                let final_reason = format!("could not schedule poll attempt {}: {}", next_attempt, e);
                state_machine::pending_to_failed(store, instance_id, &final_reason).await?;
                tracing::error!("[job-polling] instance {} marked failed: {}", instance_id, final_reason);
                span.failed(store, &final_reason, Some(json!({"outcome": "failed"}))).await;
                return Ok(PollDecision::MarkedFailed { reason: final_reason });
            }
            tracing::debug!(
                "[job-polling] instance {}: {}, retry {} in {}s",
                instance_id,
                reason,
                next_attempt,
                delay.as_secs()
            );
            span.success(store, Some(json!({"outcome": "rescheduled", "reason": reason}))).await;
            return Ok(PollDecision::Rescheduled { next_attempt, delay });
        }

        let final_reason = if retryable {
            format!("boot secret polling exhausted after {} attempt(s): {}", attempt, reason)
        } else {
            reason
        };
        state_machine::pending_to_failed(store, instance_id, &final_reason).await?;
        tracing::error!("[job-polling] instance {} marked failed: {}", instance_id, final_reason);
        span.failed(store, &final_reason, Some(json!({"outcome": "failed"}))).await;
        Ok(PollDecision::MarkedFailed { reason: final_reason })
    }
}
