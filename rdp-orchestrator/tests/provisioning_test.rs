mod common;

use std::time::Duration;

use common::TestEnv;
use rdp_common::InstanceStatus;
use rdp_orchestrator::logger;
use rdp_common::bus::PrefixError;
use rdp_orchestrator::queue::Task;
use rdp_orchestrator::store::Store;
use rdp_orchestrator::{OrchestratorError, ProvisionStep};
use rdp_providers::mock::MockOperation;
use rdp_providers::ProviderError;

#[tokio::test]
async fn provision_creates_resources_and_pending_record() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;

    let instance = env
        .orch
        .request_instance(account.id, "us-east-2", Some("team"))
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Pending);
    assert_eq!(instance.account_id, account.id);
    assert_eq!(instance.region, "us-east-2");
    assert_eq!(instance.username, "Administrator");
    assert!(instance.key_name.starts_with("key-team-"));
    assert!(!instance.has_login_secret());

    let cloud = env.cloud.instance(&instance.cloud_instance_id).expect("launched");
    assert_eq!(cloud.image_id, "ami-east2");
    assert_eq!(cloud.instance_size, "m7i-flex.large");
    assert_eq!(cloud.network_rule_id, instance.network_rule_id);
    assert_eq!(cloud.key_name, instance.key_name);
    assert!(cloud
        .tags
        .iter()
        .any(|(k, v)| k == "Name" && v == &instance.key_name));
    assert!(env.keys.contains(&instance.key_name).await);

    // First poll is scheduled after the boot delay.
    let pushed = env.queue.pushed().await;
    assert_eq!(
        pushed,
        vec![(
            Task::PollBootSecret {
                instance_id: instance.id,
                attempt: 1
            },
            Duration::from_secs(240)
        )]
    );

    let types = env.action_types(None).await;
    for expected in [
        logger::EXECUTE_CREATE,
        logger::PROVIDER_CREATE_NETWORK_RULE,
        logger::PROVIDER_CREATE_KEY,
        logger::PROVIDER_LAUNCH,
    ] {
        assert!(types.iter().any(|t| t == expected), "missing {expected}");
    }
}

#[tokio::test]
async fn every_call_is_bound_to_the_requested_account_and_region() {
    let env = TestEnv::new();
    let a = env.account("a").await;
    let b = env.account("b").await;

    env.orch.provision(a.id, "us-east-2", None).await.unwrap();
    env.orch.provision(b.id, "us-east-1", None).await.unwrap();

    let calls = env.cloud.calls();
    assert_eq!(calls.len(), 6);
    assert!(calls[..3]
        .iter()
        .all(|c| c.account_id == a.id && c.region == "us-east-2"));
    assert!(calls[3..]
        .iter()
        .all(|c| c.account_id == b.id && c.region == "us-east-1"));
}

#[tokio::test]
async fn launch_failure_rolls_back_created_resources() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    env.cloud.fail_next(
        MockOperation::LaunchInstance,
        ProviderError::Api("InsufficientInstanceCapacity".into()),
    );

    let err = env
        .orch
        .request_instance(account.id, "us-east-1", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Provisioning {
            step: ProvisionStep::Launch,
            ..
        }
    ));

    assert!(env.store.all_instances().await.is_empty());
    assert!(env.cloud.network_rule_ids().is_empty());
    assert!(env.cloud.key_ids().is_empty());
    assert!(env.keys.is_empty().await);
    assert!(env.queue.pending().await.is_empty());
    assert_eq!(env.cloud.calls_for(MockOperation::DeleteKeyMaterial).len(), 1);
    assert_eq!(env.cloud.calls_for(MockOperation::DeleteNetworkRule).len(), 1);

    let logs = env.store.list_action_logs(None).await.unwrap();
    let rollback = logs
        .iter()
        .find(|l| l.action_type == logger::PROVISION_ROLLBACK)
        .expect("rollback logged");
    let cleaned = rollback.metadata.as_ref().unwrap()["cleaned"].as_array().unwrap().len();
    assert_eq!(cleaned, 3);
    let create = logs
        .iter()
        .find(|l| l.action_type == logger::EXECUTE_CREATE)
        .unwrap();
    assert_eq!(create.status, "failed");
}

#[tokio::test]
async fn network_rule_failure_creates_nothing_else() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    env.cloud.fail_next(
        MockOperation::CreateNetworkRule,
        ProviderError::Throttled("RequestLimitExceeded".into()),
    );

    let err = env.orch.provision(account.id, "us-east-1", None).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Provisioning {
            step: ProvisionStep::NetworkRule,
            ..
        }
    ));
    assert!(env.cloud.calls_for(MockOperation::CreateKeyMaterial).is_empty());
    assert!(env.cloud.calls_for(MockOperation::LaunchInstance).is_empty());
    assert!(env.store.all_instances().await.is_empty());
    assert!(!env
        .action_types(None)
        .await
        .iter()
        .any(|t| t == logger::PROVISION_ROLLBACK));

    // The injected fault is consumed; the next attempt succeeds.
    env.orch.provision(account.id, "us-east-1", None).await.unwrap();
}

#[tokio::test]
async fn identifiers_do_not_collide_for_the_same_prefix() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;

    let first = env.orch.provision(account.id, "us-east-1", Some("same")).await.unwrap();
    let second = env.orch.provision(account.id, "us-east-1", Some("same")).await.unwrap();
    assert_ne!(first.key_name, second.key_name);
    assert_ne!(first.network_rule_id, second.network_rule_id);
}

#[tokio::test]
async fn unknown_account_is_reported() {
    let env = TestEnv::new();
    let missing = uuid::Uuid::new_v4();
    let err = env.orch.provision(missing, "us-east-1", None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AccountNotFound(id) if id == missing));
}

#[tokio::test]
async fn malformed_prefix_is_rejected_before_any_cloud_call() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;

    let err = env
        .orch
        .provision(account.id, "us-east-1", Some("lab/../etc"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidNamePrefix(PrefixError::InvalidCharacters(_))
    ));
    let err = env
        .orch
        .request_instance(account.id, "us-east-1", Some("a-very-long-classroom-name"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidNamePrefix(PrefixError::TooLong(_))));
    assert!(env
        .orch
        .enqueue_provision(account.id, "us-east-1", Some("my lab"))
        .await
        .is_err());
    assert!(env.orch.allocate(2, Some("my lab")).await.is_err());

    assert!(env.cloud.calls().is_empty());
    assert!(env.queue.pending().await.is_empty());
    assert!(env.store.all_instances().await.is_empty());
}

#[tokio::test]
async fn bulk_labels_from_a_maximal_prefix_still_provision() {
    let env = TestEnv::new();
    env.account("alpha").await;
    let prefix = "a".repeat(20);

    env.orch.allocate(2, Some(&prefix)).await.unwrap();
    env.run_queued().await;
    let instances = env.store.all_instances().await;
    assert_eq!(instances.len(), 2);
    assert!(instances
        .iter()
        .all(|i| i.key_name.starts_with(&format!("key-{}-", prefix))));
}
