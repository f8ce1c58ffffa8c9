use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::SecretString;
use uuid::Uuid;

/// Error classes a cloud client can report.
///
/// `ResourceInUse` is the anticipated failure when deleting a network rule that an
/// instance in `shutting-down` still references.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("request throttled by provider: {0}")]
    Throttled(String),
    #[error("resource {0} is still in use")]
    ResourceInUse(String),
    #[error("resource {0} not found")]
    NotFound(String),
    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),
    #[error("provider API error: {0}")]
    Api(String),
}

impl ProviderError {
    /// Rate limits and dependency violations clear up by themselves.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Throttled(_) | ProviderError::ResourceInUse(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// Account credentials handed to a provider when a client is built.
pub struct CloudCredentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
}

impl std::fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("access_key_id", &"[REDACTED]")
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Everything a client needs to talk to one account in one region.
/// Built fresh for every workflow run; never stored on a shared object.
#[derive(Debug)]
pub struct CloudContext {
    pub account_id: Uuid,
    pub region: String,
    pub credentials: CloudCredentials,
}

/// A cloud client bound to a single account + region.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn region(&self) -> &str;

    async fn create_network_rule(
        &self,
        spec: &inventory::NetworkRuleSpec,
    ) -> Result<String, ProviderError>;

    async fn create_key_material(
        &self,
        key_name: &str,
    ) -> Result<inventory::KeyMaterial, ProviderError>;

    async fn launch_instance(
        &self,
        request: &inventory::LaunchRequest,
    ) -> Result<String, ProviderError>;

    /// Batched describe: one provider call for any number of ids.
    /// Unknown ids are simply absent from the result.
    async fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<HashMap<String, inventory::InstanceDescription>, ProviderError>;

    /// Returns the base64-encoded, key-encrypted boot secret, or None while the
    /// guest OS has not produced it yet.
    async fn fetch_boot_secret(&self, instance_id: &str) -> Result<Option<String>, ProviderError>;

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), ProviderError>;

    async fn delete_key_material(&self, key_id: &str) -> Result<(), ProviderError>;

    async fn delete_network_rule(&self, rule_id: &str) -> Result<(), ProviderError>;
}

/// Builds account/region scoped clients.
pub trait ProviderFactory: Send + Sync {
    fn name(&self) -> &str;

    fn connect(&self, ctx: &CloudContext) -> Result<Box<dyn CloudProvider>, ProviderError>;
}

pub mod inventory {
    use chrono::{DateTime, Utc};
    use secrecy::SecretString;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct NetworkRuleSpec {
        pub name: String,
        pub description: String,
        pub protocol: String,
        pub port: u16,
        pub cidr: String,
    }

    #[derive(Debug)]
    pub struct KeyMaterial {
        pub key_id: String,
        pub key_name: String,
        /// PEM-encoded private key. Must be handed to the key store and dropped.
        pub private_key_pem: SecretString,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct LaunchRequest {
        pub image_id: String,
        pub instance_size: String,
        pub key_name: String,
        pub network_rule_id: String,
        pub tags: Vec<(String, String)>,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct InstanceDescription {
        pub instance_id: String,
        pub state: String,
        pub public_address: Option<String>,
        pub launch_time: Option<DateTime<Utc>>,
    }
}

#[cfg(any(test, feature = "mock"))]
pub mod mock;
