use rdp_common::bus::normalize_name_prefix;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::services::Orchestrator;

/// Free capacity of one (account, region) pair at planning time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventorySlot {
    pub account_id: Uuid,
    pub account_label: String,
    pub region: String,
    pub free: u32,
}

/// One planned provisioning task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub account_id: Uuid,
    pub region: String,
    pub label: String,
}

/// Fill slots in inventory order until `requested` is reached.
/// Fails before producing anything when the request exceeds total free capacity.
pub fn plan_allocation(
    inventory: &[InventorySlot],
    requested: u32,
    prefix: &str,
) -> Result<Vec<Assignment>> {
    let available: u32 = inventory.iter().map(|s| s.free).sum();
    if requested > available {
        return Err(OrchestratorError::CapacityExceeded { available });
    }

    let mut plan = Vec::with_capacity(requested as usize);
    'slots: for slot in inventory {
        for _ in 0..slot.free {
            if plan.len() as u32 == requested {
                break 'slots;
            }
            plan.push(Assignment {
                account_id: slot.account_id,
                region: slot.region.clone(),
                label: format!("{}-{}", prefix, plan.len() + 1),
            });
        }
    }
    Ok(plan)
}

impl Orchestrator {
    /// Free slots per active account x configured region, in account-then-region order.
    /// Pairs with no free slot are omitted.
    pub async fn compute_inventory(&self) -> Result<Vec<InventorySlot>> {
        let cap = self.config.capacity_per_region;
        let counts = self.store.active_instance_counts().await?;
        let accounts = self.store.list_accounts().await?;

        let mut inventory = Vec::new();
        for account in accounts.iter().filter(|a| a.is_active()) {
            for region in self.config.regions.regions() {
                let used = counts
                    .get(&(account.id, region.to_string()))
                    .copied()
                    .unwrap_or(0);
                let free = cap.saturating_sub(used);
                if free > 0 {
                    inventory.push(InventorySlot {
                        account_id: account.id,
                        account_label: account.label.clone(),
                        region: region.to_string(),
                        free,
                    });
                }
            }
        }
        Ok(inventory)
    }

    /// Plan a bulk request and dispatch one provisioning task per slot.
    /// Does not wait for the tasks; each one re-checks the cap when it runs.
    pub async fn allocate(&self, requested: u32, name_prefix: Option<&str>) -> Result<Vec<Assignment>> {
        let prefix = normalize_name_prefix(name_prefix)?;
        let inventory = self.compute_inventory().await?;
        let plan = match plan_allocation(&inventory, requested, &prefix) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!("[allocator] rejected request for {}: {}", requested, e);
                return Err(e);
            }
        };

        for (dispatched, assignment) in plan.iter().enumerate() {
            if let Err(e) = self
                .push_provision_task(assignment.account_id, &assignment.region, assignment.label.clone())
                .await
            {
                tracing::error!(
                    "[allocator] dispatch stopped after {}/{} task(s): {}",
                    dispatched,
                    plan.len(),
                    e
                );
                return Err(e);
            }
        }
        tracing::info!(
            "[allocator] dispatched {} provisioning task(s) across {} slot(s)",
            plan.len(),
            inventory.len()
        );
        Ok(plan)
    }
}
