mod common;

use common::TestEnv;
use rdp_common::bus::Command;
use rdp_common::InstanceStatus;
use rdp_orchestrator::commands::handle_command;
use rdp_orchestrator::queue::Task;
use rdp_orchestrator::OrchestratorError;

#[tokio::test]
async fn provision_command_only_enqueues() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;

    let cmd: Command = serde_json::from_value(serde_json::json!({
        "type": "CMD:PROVISION",
        "account_id": account.id,
        "region": "us-east-2",
    }))
    .unwrap();
    handle_command(&env.orch, cmd).await.unwrap();

    assert!(env.cloud.calls().is_empty());
    assert_eq!(
        env.queue.pending().await,
        vec![Task::Provision {
            account_id: account.id,
            region: "us-east-2".into(),
            name_prefix: "rdp".into(),
        }]
    );
}

#[tokio::test]
async fn bulk_command_is_all_or_nothing() {
    let env = TestEnv::new();
    env.account("alpha").await;

    let err = handle_command(
        &env.orch,
        Command::BulkProvision {
            count: 9,
            prefix: None,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OrchestratorError::CapacityExceeded { available: 8 }));
    assert!(env.queue.pending().await.is_empty());

    handle_command(
        &env.orch,
        Command::BulkProvision {
            count: 8,
            prefix: Some("ws".into()),
        },
    )
    .await
    .unwrap();
    assert_eq!(env.queue.pending().await.len(), 8);

    env.run_queued().await;
    assert_eq!(env.store.all_instances().await.len(), 8);
    assert!(env
        .store
        .all_instances()
        .await
        .iter()
        .all(|i| i.key_name.starts_with("key-ws-")));
}

#[tokio::test]
async fn terminate_and_sync_commands_reach_their_workflows() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    let instance = env.orch.provision(account.id, "us-east-1", None).await.unwrap();
    env.cloud.set_instance_state(&instance.cloud_instance_id, "stopped");

    handle_command(
        &env.orch,
        Command::Sync {
            account_id: Some(account.id),
            region: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Stopped);

    handle_command(
        &env.orch,
        Command::Terminate {
            instance_id: instance.id,
        },
    )
    .await
    .unwrap();
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Stopped);
    env.run_queued().await;
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Terminated);
}
