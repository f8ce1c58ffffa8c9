mod common;

use common::{test_config, TestEnv};
use rdp_common::InstanceStatus;
use rdp_orchestrator::logger;
use rdp_orchestrator::queue::Task;
use rdp_orchestrator::store::Store;
use rdp_orchestrator::{OrchestratorConfig, PollDecision};
use rdp_providers::mock::MockOperation;
use rdp_providers::ProviderError;

async fn running_instance(env: &TestEnv, account_id: uuid::Uuid, region: &str) -> rdp_common::Instance {
    let instance = env.orch.provision(account_id, region, None).await.unwrap();
    assert_eq!(env.orch.run_poll_task(instance.id, 1).await.unwrap(), PollDecision::Completed);
    env.instance(instance.id).await
}

#[tokio::test]
async fn one_describe_call_per_account_region() {
    let env = TestEnv::with_config(OrchestratorConfig {
        capacity_per_region: 10,
        ..test_config()
    });
    let account = env.account("alpha").await;
    for _ in 0..6 {
        env.orch.provision(account.id, "us-east-1", None).await.unwrap();
    }

    let report = env.orch.sync(account.id, "us-east-1").await.unwrap();
    assert_eq!(report.checked, 6);
    assert_eq!(report.describe_calls, 1);
    assert_eq!(report.missing, 0);
    let describes = env.cloud.calls_for(MockOperation::DescribeInstances);
    assert_eq!(describes.len(), 1);
    assert_eq!(describes[0].region, "us-east-1");
}

#[tokio::test]
async fn nothing_to_check_means_no_cloud_call() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;

    let report = env.orch.sync(account.id, "us-east-2").await.unwrap();
    assert_eq!(report.checked, 0);
    assert_eq!(report.describe_calls, 0);

    let summary = env.orch.sync_all().await.unwrap();
    assert_eq!(summary.pairs, 2);
    assert_eq!(summary.failures, 0);
    assert!(env.cloud.calls().is_empty());
}

#[tokio::test]
async fn stopped_and_restarted_instances_are_mirrored() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    let instance = running_instance(&env, account.id, "us-east-1").await;

    env.cloud.set_instance_state(&instance.cloud_instance_id, "stopped");
    let report = env.orch.sync(account.id, "us-east-1").await.unwrap();
    assert_eq!(report.status_updated, 1);
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Stopped);

    env.cloud.set_instance_state(&instance.cloud_instance_id, "running");
    env.orch.sync(account.id, "us-east-1").await.unwrap();
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Running);
}

#[tokio::test]
async fn sync_does_not_promote_pending_records() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    let instance = env.orch.provision(account.id, "us-east-1", None).await.unwrap();
    env.cloud.set_instance_state(&instance.cloud_instance_id, "running");

    let report = env.orch.sync(account.id, "us-east-1").await.unwrap();
    assert_eq!(report.status_updated, 0);
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Pending);
}

#[tokio::test]
async fn cloud_side_termination_hands_over_to_teardown() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    let instance = running_instance(&env, account.id, "us-east-1").await;
    env.cloud.set_instance_state(&instance.cloud_instance_id, "terminated");

    let report = env.orch.sync(account.id, "us-east-1").await.unwrap();
    assert_eq!(report.terminations_queued, 1);
    assert_eq!(report.status_updated, 0);
    // Resources are still held, so the record is not terminated yet.
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Running);
    assert_eq!(
        env.queue.pending().await,
        vec![Task::Terminate {
            instance_id: instance.id
        }]
    );

    env.run_queued().await;
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Terminated);
    assert!(!env.keys.contains(&instance.key_name).await);
    assert!(env.cloud.key_ids().is_empty());
    assert!(env.cloud.network_rule_ids().is_empty());
    assert!(env
        .action_types(Some(instance.id))
        .await
        .iter()
        .any(|t| t == logger::CLOUD_TERMINATED));

    // Terminated records drop out of the next pass entirely.
    let report = env.orch.sync(account.id, "us-east-1").await.unwrap();
    assert_eq!(report.checked, 0);
}

#[tokio::test]
async fn records_unknown_to_the_cloud_are_left_alone() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    let seeded = env.seed_pending(account.id, "us-east-1", 1).await.remove(0);

    let report = env.orch.sync(account.id, "us-east-1").await.unwrap();
    assert_eq!(report.missing, 1);
    assert_eq!(env.instance(seeded.id).await.status, InstanceStatus::Pending);
}

#[tokio::test]
async fn changed_address_is_refreshed_and_account_touched() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    let instance = running_instance(&env, account.id, "us-east-1").await;
    env.cloud
        .set_public_address(&instance.cloud_instance_id, Some("198.51.100.42"));

    let report = env.orch.sync(account.id, "us-east-1").await.unwrap();
    assert_eq!(report.address_updated, 1);
    assert_eq!(
        env.instance(instance.id).await.public_address.as_deref(),
        Some("198.51.100.42")
    );
    let account = env.store.get_account(account.id).await.unwrap().unwrap();
    assert!(account.last_ping_at.is_some());
}

#[tokio::test]
async fn system_wide_sync_continues_past_failures() {
    let env = TestEnv::new();
    let a = env.account("a").await;
    let b = env.account("b").await;
    let ia = running_instance(&env, a.id, "us-east-1").await;
    let ib = running_instance(&env, b.id, "us-east-1").await;
    env.cloud.set_instance_state(&ia.cloud_instance_id, "stopped");
    env.cloud.set_instance_state(&ib.cloud_instance_id, "stopped");
    env.cloud.fail_next(
        MockOperation::DescribeInstances,
        ProviderError::Throttled("RequestLimitExceeded".into()),
    );

    let summary = env.orch.sync_all().await.unwrap();
    assert_eq!(summary.pairs, 4);
    assert_eq!(summary.failures, 1);
    assert_eq!(summary.totals.status_updated, 1);
    assert_eq!(env.instance(ia.id).await.status, InstanceStatus::Running);
    assert_eq!(env.instance(ib.id).await.status, InstanceStatus::Stopped);
}

#[tokio::test]
async fn describe_is_scoped_to_each_region() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    running_instance(&env, account.id, "us-east-1").await;
    running_instance(&env, account.id, "us-east-2").await;
    // Polling made its own describe calls; only count the ones sync makes.
    let before = env.cloud.calls_for(MockOperation::DescribeInstances).len();

    let report = env.orch.sync_account(account.id).await.unwrap();
    assert_eq!(report.describe_calls, 2);
    assert_eq!(report.checked, 2);
    assert_eq!(report.missing, 0);
    let regions: Vec<_> = env
        .cloud
        .calls_for(MockOperation::DescribeInstances)
        .into_iter()
        .skip(before)
        .map(|c| c.region)
        .collect();
    assert_eq!(regions, vec!["us-east-1", "us-east-2"]);
}
