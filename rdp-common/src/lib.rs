use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod bus;

// --- Errors ---

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown instance status '{0}'")]
    UnknownInstanceStatus(String),
    #[error("unknown account status '{0}'")]
    UnknownAccountStatus(String),
}

// --- Enums ---

/// Lifecycle of a remote-desktop instance.
///
/// `Running` is the "ready" state: the boot secret and the public address are
/// both known. The cloud-mirrored states (`Stopping`, `Stopped`, `ShuttingDown`)
/// are only ever written by the status synchronizer.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    Pending,      // Launched, waiting for boot secret + address
    Running,      // Secret and address retrieved (a.k.a. ready)
    Stopping,     // Mirrored from cloud
    Stopped,      // Mirrored from cloud
    ShuttingDown, // Mirrored from cloud
    Terminated,   // Cloud resources released
    Failed,       // Polling exhausted or non-retryable error
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::ShuttingDown => "shutting-down",
            InstanceStatus::Terminated => "terminated",
            InstanceStatus::Failed => "failed",
        }
    }

    /// Parse a stored status. `ready` is accepted as an alias of `running`.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(InstanceStatus::Pending),
            "running" | "ready" => Ok(InstanceStatus::Running),
            "stopping" => Ok(InstanceStatus::Stopping),
            "stopped" => Ok(InstanceStatus::Stopped),
            "shutting-down" | "shutting_down" => Ok(InstanceStatus::ShuttingDown),
            "terminated" => Ok(InstanceStatus::Terminated),
            "failed" => Ok(InstanceStatus::Failed),
            other => Err(ParseError::UnknownInstanceStatus(other.to_string())),
        }
    }

    /// Map a cloud-reported instance state name onto a local status.
    /// Returns None for states we do not track (e.g. provider-specific extras).
    pub fn from_cloud_state(state: &str) -> Option<Self> {
        match state.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(InstanceStatus::Pending),
            "running" => Some(InstanceStatus::Running),
            "stopping" => Some(InstanceStatus::Stopping),
            "stopped" => Some(InstanceStatus::Stopped),
            "shutting-down" => Some(InstanceStatus::ShuttingDown),
            "terminated" => Some(InstanceStatus::Terminated),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, InstanceStatus::Terminated)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Suspended,
    Invalid,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Invalid => "invalid",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(AccountStatus::Active),
            "suspended" => Ok(AccountStatus::Suspended),
            "invalid" => Ok(AccountStatus::Invalid),
            other => Err(ParseError::UnknownAccountStatus(other.to_string())),
        }
    }
}

// --- Entities ---

/// A cloud account managed by the operator.
///
/// Credentials are kept encrypted (see the orchestrator's secrets module) and
/// are never serialized.
#[derive(Serialize, Deserialize, Clone)]
pub struct Account {
    pub id: Uuid,
    pub label: String,
    #[serde(skip)]
    pub encrypted_credentials: Vec<u8>,
    pub default_region: String,
    pub status: AccountStatus,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active && self.deleted_at.is_none()
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("encrypted_credentials", &"[REDACTED]")
            .field("default_region", &self.default_region)
            .field("status", &self.status)
            .field("deleted_at", &self.deleted_at)
            .finish()
    }
}

/// One provisioned remote-desktop VM and the cloud resources tied to it.
#[derive(Serialize, Deserialize, Clone)]
pub struct Instance {
    pub id: Uuid,
    pub account_id: Uuid,
    pub region: String,
    pub cloud_instance_id: String,
    pub network_rule_id: String,
    pub key_id: String,
    pub key_name: String,
    pub public_address: Option<String>,
    pub username: String,
    /// AES-GCM sealed login secret; None until the polling loop retrieves it.
    #[serde(skip)]
    pub login_secret: Option<Vec<u8>>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn has_login_secret(&self) -> bool {
        self.login_secret.as_ref().is_some_and(|s| !s.is_empty())
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("account_id", &self.account_id)
            .field("region", &self.region)
            .field("cloud_instance_id", &self.cloud_instance_id)
            .field("network_rule_id", &self.network_rule_id)
            .field("key_name", &self.key_name)
            .field("public_address", &self.public_address)
            .field("login_secret", &self.login_secret.as_ref().map(|_| "[REDACTED]"))
            .field("status", &self.status)
            .finish()
    }
}

/// Audit entry written by the orchestrator workflows (two-phase: in_progress -> success/failed).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ActionLog {
    pub id: Uuid,
    pub action_type: String,
    pub status: String,
    pub instance_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
