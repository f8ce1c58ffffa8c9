use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdp_common::{Account, AccountStatus, ActionLog, Instance, InstanceStatus};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use super::{ActionLogCompletion, NewAccount, NewInstance, Store, StoreError};

const ACCOUNT_COLUMNS: &str = "id, label, encrypted_credentials, default_region, status, \
     last_ping_at, created_at, updated_at, deleted_at";

const INSTANCE_COLUMNS: &str = "id, account_id, region, cloud_instance_id, network_rule_id, \
     key_id, key_name, public_address, username, login_secret, status, \
     created_at, updated_at, deleted_at";

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    label: String,
    encrypted_credentials: Vec<u8>,
    default_region: String,
    status: String,
    last_ping_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<AccountRow> for Account {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let status = AccountStatus::parse(&row.status).map_err(|e| StoreError::Corrupt {
            id: row.id,
            reason: e.to_string(),
        })?;
        Ok(Account {
            id: row.id,
            label: row.label,
            encrypted_credentials: row.encrypted_credentials,
            default_region: row.default_region,
            status,
            last_ping_at: row.last_ping_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: Uuid,
    account_id: Uuid,
    region: String,
    cloud_instance_id: String,
    network_rule_id: String,
    key_id: String,
    key_name: String,
    public_address: Option<String>,
    username: String,
    login_secret: Option<Vec<u8>>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        let status = InstanceStatus::parse(&row.status).map_err(|e| StoreError::Corrupt {
            id: row.id,
            reason: e.to_string(),
        })?;
        Ok(Instance {
            id: row.id,
            account_id: row.account_id,
            region: row.region,
            cloud_instance_id: row.cloud_instance_id,
            network_rule_id: row.network_rule_id,
            key_id: row.key_id,
            key_name: row.key_name,
            public_address: row.public_address,
            username: row.username,
            login_secret: row.login_secret,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ActionLogRow {
    id: Uuid,
    action_type: String,
    status: String,
    instance_id: Option<Uuid>,
    error_message: Option<String>,
    metadata: Option<serde_json::Value>,
    duration_ms: Option<i64>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<ActionLogRow> for ActionLog {
    fn from(row: ActionLogRow) -> Self {
        ActionLog {
            id: row.id,
            action_type: row.action_type,
            status: row.status,
            instance_id: row.instance_id,
            error_message: row.error_message,
            metadata: row.metadata,
            duration_ms: row.duration_ms,
            created_at: row.created_at,
            completed_at: row.completed_at,
        }
    }
}

/// PostgreSQL-backed [`Store`]. Uses runtime queries only (no DATABASE_URL at build time).
#[derive(Clone)]
pub struct PgStore {
    db: Pool<Postgres>,
}

impl PgStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { db })
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.db
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        let row: AccountRow = sqlx::query_as(&format!(
            "INSERT INTO rdp_accounts (id, label, encrypted_credentials, default_region, status)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&account.label)
        .bind(&account.encrypted_credentials)
        .bind(&account.default_region)
        .bind(account.status.as_str())
        .fetch_one(&self.db)
        .await?;
        row.try_into()
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM rdp_accounts WHERE id = $1 AND deleted_at IS NULL",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(Account::try_from).transpose()
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM rdp_accounts WHERE deleted_at IS NULL ORDER BY created_at ASC, id ASC",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(Account::try_from).collect()
    }

    async fn touch_account(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE rdp_accounts SET last_ping_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_instance(&self, instance: NewInstance) -> Result<Instance, StoreError> {
        let row: InstanceRow = sqlx::query_as(&format!(
            "INSERT INTO rdp_instances
               (id, account_id, region, cloud_instance_id, network_rule_id, key_id, key_name,
                public_address, username, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending')
             RETURNING {}",
            INSTANCE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(instance.account_id)
        .bind(&instance.region)
        .bind(&instance.cloud_instance_id)
        .bind(&instance.network_rule_id)
        .bind(&instance.key_id)
        .bind(&instance.key_name)
        .bind(&instance.public_address)
        .bind(&instance.username)
        .fetch_one(&self.db)
        .await?;
        row.try_into()
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>, StoreError> {
        let row: Option<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM rdp_instances WHERE id = $1 AND deleted_at IS NULL",
            INSTANCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(Instance::try_from).transpose()
    }

    async fn list_active_instances(
        &self,
        account_id: Uuid,
        region: &str,
    ) -> Result<Vec<Instance>, StoreError> {
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM rdp_instances
             WHERE account_id = $1 AND region = $2
               AND status <> 'terminated' AND deleted_at IS NULL
             ORDER BY created_at ASC",
            INSTANCE_COLUMNS
        ))
        .bind(account_id)
        .bind(region)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(Instance::try_from).collect()
    }

    async fn count_active_instances(&self, account_id: Uuid, region: &str) -> Result<u32, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rdp_instances
             WHERE account_id = $1 AND region = $2
               AND status <> 'terminated' AND deleted_at IS NULL",
        )
        .bind(account_id)
        .bind(region)
        .fetch_one(&self.db)
        .await?;
        Ok(count.max(0) as u32)
    }

    async fn list_stale_pending(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Instance>, StoreError> {
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM rdp_instances
             WHERE status = 'pending' AND created_at < $1 AND deleted_at IS NULL
             ORDER BY created_at ASC
             LIMIT $2",
            INSTANCE_COLUMNS
        ))
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(Instance::try_from).collect()
    }

    async fn active_instance_counts(&self) -> Result<HashMap<(Uuid, String), u32>, StoreError> {
        let rows: Vec<(Uuid, String, i64)> = sqlx::query_as(
            "SELECT account_id, region, COUNT(*) FROM rdp_instances
             WHERE status <> 'terminated' AND deleted_at IS NULL
             GROUP BY account_id, region",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(account_id, region, n)| ((account_id, region), n.max(0) as u32))
            .collect())
    }

    async fn set_public_address(&self, id: Uuid, address: &str) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE rdp_instances SET public_address = $2, updated_at = NOW()
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(address)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn complete_boot(
        &self,
        id: Uuid,
        address: &str,
        sealed_secret: &[u8],
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE rdp_instances
             SET public_address = $2, login_secret = $3, status = 'running', updated_at = NOW()
             WHERE id = $1 AND status = 'pending' AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(address)
        .bind(sealed_secret)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<Option<InstanceStatus>, StoreError> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let prev: Option<String> = sqlx::query_scalar(
            "WITH prev AS (
                SELECT id, status FROM rdp_instances
                WHERE id = $1 AND deleted_at IS NULL
                FOR UPDATE
             )
             UPDATE rdp_instances i
             SET status = $2, updated_at = NOW()
             FROM prev
             WHERE i.id = prev.id AND prev.status = ANY($3)
             RETURNING prev.status",
        )
        .bind(id)
        .bind(to.as_str())
        .bind(&from)
        .fetch_optional(&self.db)
        .await?;

        prev.map(|raw| {
            InstanceStatus::parse(&raw).map_err(|e| StoreError::Corrupt {
                id,
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    async fn archive_instance(&self, id: Uuid) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE rdp_instances SET deleted_at = NOW()
             WHERE id = $1 AND status = 'terminated' AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn insert_action_log(&self, log: ActionLog) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO action_logs
             (id, action_type, component, status, instance_id, error_message, metadata, created_at)
             VALUES ($1, $2, 'orchestrator', $3, $4, $5, $6, $7)",
        )
        .bind(log.id)
        .bind(&log.action_type)
        .bind(&log.status)
        .bind(log.instance_id)
        .bind(&log.error_message)
        .bind(&log.metadata)
        .bind(log.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn complete_action_log(
        &self,
        id: Uuid,
        completion: ActionLogCompletion,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE action_logs
             SET status = $2, duration_ms = $3, error_message = $4,
                 metadata = COALESCE($5, metadata), completed_at = $6
             WHERE id = $1",
        )
        .bind(id)
        .bind(&completion.status)
        .bind(completion.duration_ms)
        .bind(&completion.error_message)
        .bind(&completion.metadata)
        .bind(completion.completed_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_action_logs(&self, instance_id: Option<Uuid>) -> Result<Vec<ActionLog>, StoreError> {
        let rows: Vec<ActionLogRow> = sqlx::query_as(
            "SELECT id, action_type, status, instance_id, error_message, metadata, duration_ms,
                    created_at, completed_at
             FROM action_logs
             WHERE ($1::uuid IS NULL OR instance_id = $1)
             ORDER BY created_at ASC",
        )
        .bind(instance_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(ActionLog::from).collect())
    }
}
