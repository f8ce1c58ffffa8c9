use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use rdp_common::bus::QUEUE_ORCHESTRATOR_TASKS;
use rdp_orchestrator::config::{OrchestratorConfig, ServiceSettings};
use rdp_orchestrator::crypto::SecretsCrypto;
use rdp_orchestrator::keystore::{FsKeyStore, KeyStore};
use rdp_orchestrator::provider_manager::ProviderManager;
use rdp_orchestrator::queue::{RedisTaskQueue, TaskQueue};
use rdp_orchestrator::store::{MemoryStore, PgStore, Store};
use rdp_orchestrator::{commands, migrations, recovery_job, sync_job, worker, Orchestrator};
use rdp_providers::CloudCredentials;
use secrecy::SecretString;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = ServiceSettings::from_env()?;
    let config = OrchestratorConfig::from_env()?;
    tracing::info!("[main] starting with {:?}", settings);

    let crypto = Arc::new(SecretsCrypto::new(settings.master_key).context("invalid SECRETS_MASTER_KEY")?);

    let store: Arc<dyn Store> = if settings.database_url == "memory" {
        tracing::warn!("[main] DATABASE_URL=memory, records will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let pg = PgStore::connect(&settings.database_url)
            .await
            .context("failed to connect to Postgres")?;
        migrations::run_inline_migrations(pg.pool())
            .await
            .context("failed to run migrations")?;
        tracing::info!("[main] connected to database");
        Arc::new(pg)
    };

    let keys: Arc<dyn KeyStore> = Arc::new(
        FsKeyStore::open(&config.key_store_dir, crypto.clone())
            .await
            .with_context(|| format!("failed to open key store at {}", config.key_store_dir.display()))?,
    );

    let redis_client = redis::Client::open(settings.redis_url.clone()).context("invalid REDIS_URL")?;
    let queue: Arc<dyn TaskQueue> = Arc::new(RedisTaskQueue::new(redis_client.clone(), QUEUE_ORCHESTRATOR_TASKS));

    let cloud = ProviderManager::get_factory(&settings.provider)
        .ok_or_else(|| anyhow!("provider '{}' is not compiled into this binary", settings.provider))?;
    tracing::info!("[main] using provider '{}'", cloud.name());

    let sync_interval = config.sync_interval;
    let recovery_interval = config.recovery_interval;
    let orch = Orchestrator::new(store, keys, queue, cloud, crypto, config);

    maybe_seed_account(&orch).await;

    tokio::spawn(worker::run(orch.clone()));

    if let Some(every) = sync_interval {
        tokio::spawn(sync_job::run(orch.clone(), every));
    } else {
        tracing::info!("[main] periodic sync disabled");
    }
    if let Some(every) = recovery_interval {
        tokio::spawn(recovery_job::run(orch.clone(), every));
    }

    let orch_commands = orch.clone();
    tokio::spawn(async move {
        if let Err(e) = commands::listen(orch_commands, redis_client).await {
            tracing::error!("[main] command listener stopped: {:#}", e);
        }
    });

    // Admin API: internal health/debug only
    let app = Router::new()
        .route("/", get(root))
        .route("/admin/status", get(get_status))
        .route("/admin/inventory", get(get_inventory))
        .with_state(orch);

    let listener = tokio::net::TcpListener::bind(settings.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen_addr))?;
    tracing::info!("[main] orchestrator listening on {}", settings.listen_addr);
    axum::serve(listener, app).await.context("admin server failed")?;
    Ok(())
}

/// Register one account from env when the store has none (local dev, staging bring-up).
async fn maybe_seed_account(orch: &Orchestrator) {
    let (Ok(access_key_id), Ok(secret)) = (
        std::env::var("RDP_SEED_ACCESS_KEY_ID"),
        std::env::var("RDP_SEED_SECRET_ACCESS_KEY"),
    ) else {
        return;
    };
    match orch.store().list_accounts().await {
        Ok(accounts) if !accounts.is_empty() => return,
        Ok(_) => {}
        Err(e) => {
            tracing::warn!("[main] account seeding skipped: {}", e);
            return;
        }
    }
    let label = std::env::var("RDP_SEED_ACCOUNT_LABEL").unwrap_or_else(|_| "default".to_string());
    let region = std::env::var("RDP_SEED_DEFAULT_REGION").unwrap_or_else(|_| "us-east-1".to_string());
    let credentials = CloudCredentials {
        access_key_id: access_key_id.trim().to_string(),
        secret_access_key: SecretString::from(secret.trim().to_string()),
    };
    match orch.register_account(&label, credentials, &region).await {
        Ok(account) => tracing::info!("[main] seeded account {} ({})", account.id, account.label),
        Err(e) => tracing::warn!("[main] account seeding failed: {}", e),
    }
}

async fn root() -> &'static str {
    "RDP Orchestrator Online"
}

async fn get_status(State(orch): State<Orchestrator>) -> impl IntoResponse {
    let counts = match orch.store().active_instance_counts().await {
        Ok(c) => c,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "store_error", "message": e.to_string()})),
            )
                .into_response()
        }
    };
    let queued = orch.queue().len().await.ok();
    let active: u32 = counts.values().sum();
    Json(json!({
        "active_instances": active,
        "queued_tasks": queued,
        "provider": orch.provider_name(),
    }))
    .into_response()
}

async fn get_inventory(State(orch): State<Orchestrator>) -> impl IntoResponse {
    match orch.compute_inventory().await {
        Ok(inventory) => {
            let total: u32 = inventory.iter().map(|s| s.free).sum();
            Json(json!({
                "capacity_per_region": orch.config().capacity_per_region,
                "total_free": total,
                "slots": inventory,
            }))
            .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "inventory_error", "message": e.to_string()})),
        )
            .into_response(),
    }
}
