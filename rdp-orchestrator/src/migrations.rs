use sqlx::{Pool, Postgres};

/// Idempotent inline schema, applied at startup.
const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS rdp_accounts (
        id UUID PRIMARY KEY,
        label VARCHAR(255) NOT NULL,
        encrypted_credentials BYTEA NOT NULL,
        default_region VARCHAR(64) NOT NULL,
        status VARCHAR(32) NOT NULL DEFAULT 'active',
        last_ping_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at TIMESTAMPTZ
    );
    CREATE TABLE IF NOT EXISTS rdp_instances (
        id UUID PRIMARY KEY,
        account_id UUID NOT NULL REFERENCES rdp_accounts(id),
        region VARCHAR(64) NOT NULL,
        cloud_instance_id VARCHAR(255) NOT NULL,
        network_rule_id VARCHAR(255) NOT NULL,
        key_id VARCHAR(255) NOT NULL,
        key_name VARCHAR(255) NOT NULL,
        public_address VARCHAR(64),
        username VARCHAR(64) NOT NULL DEFAULT 'Administrator',
        login_secret BYTEA,
        status VARCHAR(32) NOT NULL DEFAULT 'pending',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at TIMESTAMPTZ
    );
    CREATE INDEX IF NOT EXISTS idx_rdp_instances_capacity
        ON rdp_instances (account_id, region)
        WHERE status <> 'terminated' AND deleted_at IS NULL;
    CREATE TABLE IF NOT EXISTS action_logs (
        id UUID PRIMARY KEY,
        action_type VARCHAR(64) NOT NULL,
        component VARCHAR(32) NOT NULL DEFAULT 'orchestrator',
        status VARCHAR(32) NOT NULL,
        instance_id UUID,
        error_message TEXT,
        metadata JSONB,
        duration_ms BIGINT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        completed_at TIMESTAMPTZ
    );
    CREATE INDEX IF NOT EXISTS idx_action_logs_instance ON action_logs (instance_id, created_at)
"#;

pub async fn run_inline_migrations(pool: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    tracing::info!("[migrations] applying inline schema");
    for statement in SCHEMA_SQL.split(';') {
        let stmt = statement.trim();
        if !stmt.is_empty() {
            sqlx::query(stmt).execute(pool).await?;
        }
    }
    tracing::info!("[migrations] schema ready");
    Ok(())
}
