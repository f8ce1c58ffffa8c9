//! CMD:* handling for the Redis command channel.
//!
//! Pub/sub is not durable, so commands only plan or enqueue work; the task queue
//! carries it from there.

use futures_util::StreamExt;
use rdp_common::bus::{Command, CHANNEL_ORCHESTRATOR_COMMANDS};

use crate::error::Result;
use crate::services::Orchestrator;

pub async fn handle_command(orch: &Orchestrator, cmd: Command) -> Result<()> {
    match cmd {
        Command::Provision {
            account_id,
            region,
            name_prefix,
        } => {
            let task_id = orch
                .enqueue_provision(account_id, &region, name_prefix.as_deref())
                .await?;
            tracing::info!("[commands] provision queued as task {}", task_id);
        }
        Command::BulkProvision { count, prefix } => {
            let plan = orch.allocate(count, prefix.as_deref()).await?;
            tracing::info!("[commands] bulk provision dispatched {} task(s)", plan.len());
        }
        Command::Terminate { instance_id } => {
            let task_id = orch.request_termination(instance_id).await?;
            tracing::info!("[commands] termination of {} queued as task {}", instance_id, task_id);
        }
        Command::Sync { account_id, region } => match (account_id, region) {
            (Some(account_id), Some(region)) => {
                orch.sync(account_id, &region).await?;
            }
            (Some(account_id), None) => {
                orch.sync_account(account_id).await?;
            }
            (None, Some(region)) => {
                for account in orch.store().list_accounts().await? {
                    if let Err(e) = orch.sync(account.id, &region).await {
                        tracing::error!("[commands] sync {} {} failed: {}", account.id, region, e);
                    }
                }
            }
            (None, None) => {
                orch.sync_all().await?;
            }
        },
    }
    Ok(())
}

/// Subscribe to the command channel and handle each message on its own task.
pub async fn listen(orch: Orchestrator, redis_client: redis::Client) -> anyhow::Result<()> {
    let mut pubsub = redis_client.get_async_pubsub().await?;
    pubsub.subscribe(CHANNEL_ORCHESTRATOR_COMMANDS).await?;
    tracing::info!(
        "[commands] listening on Redis channel '{}'",
        CHANNEL_ORCHESTRATOR_COMMANDS
    );

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("[commands] unreadable payload: {}", e);
                continue;
            }
        };
        let cmd: Command = match serde_json::from_str(&payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!("[commands] ignoring unknown or malformed command: {}", e);
                continue;
            }
        };
        tracing::info!("[commands] received {}", cmd.command_type().as_str());
        let orch = orch.clone();
        tokio::spawn(async move {
            let kind = cmd.command_type();
            if let Err(e) = handle_command(&orch, cmd).await {
                tracing::error!("[commands] {} failed: {}", kind.as_str(), e);
            }
        });
    }
    Ok(())
}
