use rdp_common::bus::PrefixError;
use rdp_common::InstanceStatus;
use rdp_providers::ProviderError;
use uuid::Uuid;

use crate::crypto::SecretsError;
use crate::keystore::KeyStoreError;
use crate::queue::QueueError;
use crate::store::StoreError;

/// Ordered steps of the provisioning workflow, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    Connect,
    NetworkRule,
    KeyMaterial,
    StoreKey,
    Launch,
    Persist,
}

impl ProvisionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStep::Connect => "connect",
            ProvisionStep::NetworkRule => "create_network_rule",
            ProvisionStep::KeyMaterial => "create_key_material",
            ProvisionStep::StoreKey => "store_key_material",
            ProvisionStep::Launch => "launch_instance",
            ProvisionStep::Persist => "persist_record",
        }
    }
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced to callers of the orchestrator entry points.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("region '{0}' has no configured base image")]
    UnsupportedRegion(String),

    #[error(transparent)]
    InvalidNamePrefix(#[from] PrefixError),

    #[error("capacity exceeded: only {available} slot(s) available")]
    CapacityExceeded { available: u32 },

    #[error("key material '{0}' not found in key store")]
    KeyMaterialMissing(String),

    #[error("transient cloud error: {0}")]
    TransientCloud(#[source] ProviderError),

    #[error("provisioning failed at step {step}: {source}")]
    Provisioning {
        step: ProvisionStep,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("cloud error: {0}")]
    Cloud(#[source] ProviderError),

    #[error("account {0} not found")]
    AccountNotFound(Uuid),

    #[error("account {0} is not active")]
    AccountInactive(Uuid),

    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("instance {instance_id} is {status}, cannot {action}")]
    InvalidState {
        instance_id: Uuid,
        status: InstanceStatus,
        action: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Secrets(#[from] SecretsError),
}

impl OrchestratorError {
    /// Classify a provider error outside the provisioning workflow.
    pub fn cloud(err: ProviderError) -> Self {
        if err.is_transient() {
            OrchestratorError::TransientCloud(err)
        } else {
            OrchestratorError::Cloud(err)
        }
    }

    pub fn provisioning<E>(step: ProvisionStep, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        OrchestratorError::Provisioning {
            step,
            source: Box::new(err),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::TransientCloud(_) => true,
            OrchestratorError::Cloud(_) => false,
            OrchestratorError::Store(_) | OrchestratorError::Queue(_) => true,
            OrchestratorError::Provisioning { .. }
            | OrchestratorError::UnsupportedRegion(_)
            | OrchestratorError::InvalidNamePrefix(_)
            | OrchestratorError::CapacityExceeded { .. }
            | OrchestratorError::KeyMaterialMissing(_)
            | OrchestratorError::AccountNotFound(_)
            | OrchestratorError::AccountInactive(_)
            | OrchestratorError::InstanceNotFound(_)
            | OrchestratorError::InvalidState { .. }
            | OrchestratorError::KeyStore(_)
            | OrchestratorError::Secrets(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
