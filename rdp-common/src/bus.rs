use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Channels / Queues
// -----------------------------------------------------------------------------

pub const CHANNEL_ORCHESTRATOR_COMMANDS: &str = "orchestrator_events";
pub const QUEUE_ORCHESTRATOR_TASKS: &str = "orchestrator:tasks";

pub const DEFAULT_NAME_PREFIX: &str = "rdp";
pub const MAX_NAME_PREFIX_LEN: usize = 20;

// -----------------------------------------------------------------------------
// Commands (CMD:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CommandType {
    #[serde(rename = "CMD:PROVISION")]
    Provision,
    #[serde(rename = "CMD:BULK_PROVISION")]
    BulkProvision,
    #[serde(rename = "CMD:TERMINATE")]
    Terminate,
    #[serde(rename = "CMD:SYNC")]
    Sync,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Provision => "CMD:PROVISION",
            CommandType::BulkProvision => "CMD:BULK_PROVISION",
            CommandType::Terminate => "CMD:TERMINATE",
            CommandType::Sync => "CMD:SYNC",
        }
    }
}

/// A command published by the presentation layer on [`CHANNEL_ORCHESTRATOR_COMMANDS`].
///
/// Wire shape is a flat JSON object tagged by `type`, e.g.
/// `{"type":"CMD:TERMINATE","instance_id":"..."}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "CMD:PROVISION")]
    Provision {
        account_id: Uuid,
        region: String,
        #[serde(default)]
        name_prefix: Option<String>,
    },
    #[serde(rename = "CMD:BULK_PROVISION")]
    BulkProvision {
        count: u32,
        #[serde(default)]
        prefix: Option<String>,
    },
    #[serde(rename = "CMD:TERMINATE")]
    Terminate { instance_id: Uuid },
    #[serde(rename = "CMD:SYNC")]
    Sync {
        #[serde(default)]
        account_id: Option<Uuid>,
        #[serde(default)]
        region: Option<String>,
    },
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Provision { .. } => CommandType::Provision,
            Command::BulkProvision { .. } => CommandType::BulkProvision,
            Command::Terminate { .. } => CommandType::Terminate,
            Command::Sync { .. } => CommandType::Sync,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PrefixError {
    #[error("name prefix '{0}' is longer than 20 characters")]
    TooLong(String),
    #[error("name prefix '{0}' may only contain letters, digits, '-' and '_'")]
    InvalidCharacters(String),
}

/// Normalize and validate an optional, user-supplied name prefix.
///
/// Blank input falls back to [`DEFAULT_NAME_PREFIX`]. The prefix ends up in key and
/// network-rule names, so it is checked before any of those exist.
pub fn normalize_name_prefix(prefix: Option<&str>) -> Result<String, PrefixError> {
    let prefix = prefix
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_NAME_PREFIX);
    if prefix.chars().count() > MAX_NAME_PREFIX_LEN {
        return Err(PrefixError::TooLong(prefix.to_string()));
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PrefixError::InvalidCharacters(prefix.to_string()));
    }
    Ok(prefix.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format_is_flat_and_tagged() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"CMD:TERMINATE","instance_id":"{}"}}"#, id);
        let cmd: Command = serde_json::from_str(&raw).unwrap();
        assert_eq!(cmd, Command::Terminate { instance_id: id });
        assert_eq!(cmd.command_type().as_str(), "CMD:TERMINATE");
    }

    #[test]
    fn optional_fields_default_to_none() {
        let cmd: Command = serde_json::from_str(r#"{"type":"CMD:BULK_PROVISION","count":3}"#).unwrap();
        assert_eq!(
            cmd,
            Command::BulkProvision {
                count: 3,
                prefix: None
            }
        );
        let cmd: Command = serde_json::from_str(r#"{"type":"CMD:SYNC"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Sync {
                account_id: None,
                region: None
            }
        );
    }

    #[test]
    fn prefix_defaults() {
        assert_eq!(normalize_name_prefix(None).unwrap(), "rdp");
        assert_eq!(normalize_name_prefix(Some("  ")).unwrap(), "rdp");
        assert_eq!(normalize_name_prefix(Some(" team_01 ")).unwrap(), "team_01");
    }

    #[test]
    fn prefix_length_and_charset_are_enforced() {
        assert!(normalize_name_prefix(Some(&"a".repeat(20))).is_ok());
        assert!(matches!(
            normalize_name_prefix(Some(&"a".repeat(21))),
            Err(PrefixError::TooLong(_))
        ));
        assert!(matches!(
            normalize_name_prefix(Some("lab/../etc")),
            Err(PrefixError::InvalidCharacters(_))
        ));
        assert!(matches!(
            normalize_name_prefix(Some("my lab")),
            Err(PrefixError::InvalidCharacters(_))
        ));
    }
}
