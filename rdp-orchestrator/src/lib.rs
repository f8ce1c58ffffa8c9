//! Lifecycle orchestrator for short-lived remote-desktop VMs: capacity allocation,
//! provisioning, boot-secret polling, status sync and teardown.

pub mod allocator;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod logger;
pub mod migrations;
pub mod polling_job;
pub mod provider_manager;
pub mod provisioning_job;
pub mod queue;
pub mod reconciliation;
pub mod recovery_job;
pub mod services;
pub mod state_machine;
pub mod store;
pub mod sync_job;
pub mod terminator_job;
pub mod worker;

pub use allocator::{Assignment, InventorySlot};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, ProvisionStep};
pub use polling_job::{PollDecision, PollOutcome};
pub use reconciliation::{SyncReport, SyncSummary};
pub use services::Orchestrator;
