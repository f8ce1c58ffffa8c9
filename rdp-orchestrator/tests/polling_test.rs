mod common;

use std::time::Duration;

use common::TestEnv;
use rdp_common::InstanceStatus;
use rdp_orchestrator::logger;
use rdp_orchestrator::keystore::KeyStore;
use rdp_orchestrator::queue::{Task, TaskQueue};
use rdp_orchestrator::{PollDecision, PollOutcome};
use rdp_providers::mock::{MockOperation, DEFAULT_MOCK_BOOT_SECRET};
use rdp_providers::ProviderError;
use secrecy::ExposeSecret;

#[tokio::test]
async fn secret_on_second_attempt_completes_the_instance() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    env.cloud.set_boot_secret_after(1);
    let instance = env.orch.provision(account.id, "us-east-1", None).await.unwrap();

    let first = env.orch.run_poll_task(instance.id, 1).await.unwrap();
    assert_eq!(
        first,
        PollDecision::Rescheduled {
            next_attempt: 2,
            delay: Duration::from_secs(60)
        }
    );
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Pending);

    let second = env.orch.run_poll_task(instance.id, 2).await.unwrap();
    assert_eq!(second, PollDecision::Completed);

    let stored = env.instance(instance.id).await;
    assert_eq!(stored.status, InstanceStatus::Running);
    assert!(stored.public_address.is_some());
    assert!(stored.has_login_secret());
    let secret = env
        .orch
        .reveal_login_secret(instance.id)
        .await
        .unwrap()
        .expect("secret stored");
    assert_eq!(secret.expose_secret(), DEFAULT_MOCK_BOOT_SECRET);

    // Only the retry was queued; nothing follows a completed poll.
    let polls: Vec<_> = env
        .queue
        .pushed()
        .await
        .into_iter()
        .filter(|(t, _)| matches!(t, Task::PollBootSecret { .. }))
        .collect();
    assert_eq!(polls.len(), 1);
}

#[tokio::test]
async fn exhausted_attempts_mark_the_instance_failed() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    env.cloud.set_boot_secret_after(u32::MAX);
    let instance = env.orch.provision(account.id, "us-east-1", None).await.unwrap();

    for attempt in 1..3 {
        let decision = env.orch.run_poll_task(instance.id, attempt).await.unwrap();
        assert!(matches!(decision, PollDecision::Rescheduled { next_attempt, .. } if next_attempt == attempt + 1));
    }
    let last = env.orch.run_poll_task(instance.id, 3).await.unwrap();
    match last {
        PollDecision::MarkedFailed { reason } => {
            assert!(reason.contains("exhausted after 3 attempt(s)"), "{reason}")
        }
        other => panic!("expected MarkedFailed, got {other:?}"),
    }
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Failed);
    assert_eq!(env.cloud.calls_for(MockOperation::FetchBootSecret).len(), 3);
}

#[tokio::test]
async fn missing_key_material_fails_without_retry() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    let instance = env.orch.provision(account.id, "us-east-1", None).await.unwrap();
    env.keys.delete(&instance.key_name).await.unwrap();

    let outcome = env.orch.poll_attempt(instance.id).await;
    assert!(matches!(outcome, PollOutcome::Failed { retryable: false, .. }));

    let decision = env.orch.run_poll_task(instance.id, 1).await.unwrap();
    match decision {
        PollDecision::MarkedFailed { reason } => assert!(reason.contains(&instance.key_name)),
        other => panic!("expected MarkedFailed, got {other:?}"),
    }
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Failed);
    assert!(env.queue.pending().await.is_empty());
    assert!(env.cloud.calls_for(MockOperation::FetchBootSecret).is_empty());
}

#[tokio::test]
async fn address_is_picked_up_before_the_secret() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    env.cloud.set_assign_public_addresses(false);
    let instance = env.orch.provision(account.id, "us-east-1", None).await.unwrap();
    assert!(instance.public_address.is_none());

    let outcome = env.orch.poll_attempt(instance.id).await;
    assert!(matches!(outcome, PollOutcome::NotYetAvailable { .. }));
    assert!(env.cloud.calls_for(MockOperation::FetchBootSecret).is_empty());

    env.cloud
        .set_public_address(&instance.cloud_instance_id, Some("198.51.100.7"));
    let outcome = env.orch.poll_attempt(instance.id).await;
    assert_eq!(
        outcome,
        PollOutcome::Ready {
            address: "198.51.100.7".into()
        }
    );
    assert_eq!(
        env.instance(instance.id).await.public_address.as_deref(),
        Some("198.51.100.7")
    );
}

#[tokio::test]
async fn transient_cloud_error_is_retried() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    let instance = env.orch.provision(account.id, "us-east-1", None).await.unwrap();
    env.cloud.fail_next(
        MockOperation::FetchBootSecret,
        ProviderError::Throttled("Rate exceeded".into()),
    );

    let decision = env.orch.run_poll_task(instance.id, 1).await.unwrap();
    assert!(matches!(decision, PollDecision::Rescheduled { next_attempt: 2, .. }));
    assert_eq!(env.orch.run_poll_task(instance.id, 2).await.unwrap(), PollDecision::Completed);
}

#[tokio::test]
async fn polling_stops_once_the_instance_is_terminated() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    let instance = env.orch.provision(account.id, "us-east-1", None).await.unwrap();
    assert!(env.orch.terminate(instance.id).await.unwrap());

    let decision = env.orch.run_poll_task(instance.id, 1).await.unwrap();
    assert_eq!(decision, PollDecision::Stopped);
    assert!(env.cloud.calls_for(MockOperation::FetchBootSecret).is_empty());
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Terminated);
}

#[tokio::test]
async fn polls_use_the_instance_region() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    let instance = env.orch.provision(account.id, "us-east-2", None).await.unwrap();

    assert_eq!(env.orch.run_poll_task(instance.id, 1).await.unwrap(), PollDecision::Completed);
    let fetches = env.cloud.calls_for(MockOperation::FetchBootSecret);
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].region, "us-east-2");
    assert_eq!(fetches[0].account_id, account.id);
}

#[tokio::test(start_paused = true)]
async fn queued_flow_respects_the_boot_delay() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    env.orch.enqueue_provision(account.id, "us-east-1", Some("e2e")).await.unwrap();

    for envelope in env.queue.claim_due(10).await.unwrap() {
        env.orch.execute(envelope.task).await.unwrap();
    }
    let instance = env.store.all_instances().await.remove(0);
    assert_eq!(instance.status, InstanceStatus::Pending);

    // Nothing is due before the initial delay.
    tokio::time::advance(Duration::from_secs(239)).await;
    assert!(env.queue.claim_due(10).await.unwrap().is_empty());

    tokio::time::advance(Duration::from_secs(1)).await;
    let due = env.queue.claim_due(10).await.unwrap();
    assert_eq!(due.len(), 1);
    for envelope in due {
        env.orch.execute(envelope.task).await.unwrap();
    }
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Running);
    assert_eq!(env.queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn failed_retry_push_marks_the_instance_failed() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    env.cloud.set_boot_secret_after(u32::MAX);
    let instance = env.orch.provision(account.id, "us-east-1", None).await.unwrap();
    env.queue.fail_next_push().await;

    let decision = env.orch.run_poll_task(instance.id, 1).await.unwrap();
    match decision {
        PollDecision::MarkedFailed { reason } => {
            assert!(reason.contains("could not schedule poll attempt 2"), "{reason}")
        }
        other => panic!("expected MarkedFailed, got {other:?}"),
    }
    assert_eq!(env.instance(instance.id).await.status, InstanceStatus::Failed);
    assert!(env.queue.pending().await.is_empty());
}

#[tokio::test]
async fn recovery_fails_pending_records_past_the_polling_deadline() {
    let env = TestEnv::new();
    let account = env.account("alpha").await;
    let stuck = env.orch.provision(account.id, "us-east-1", None).await.unwrap();
    let ready = env.orch.provision(account.id, "us-east-1", None).await.unwrap();
    assert_eq!(env.orch.run_poll_task(ready.id, 1).await.unwrap(), PollDecision::Completed);

    // 240s boot delay plus four 60s retry slots.
    let deadline = env.orch.config().polling.deadline();
    assert_eq!(deadline, Duration::from_secs(480));

    let now = chrono::Utc::now();
    assert_eq!(env.orch.recover_stuck_polls(now).await.unwrap(), 0);
    assert_eq!(env.instance(stuck.id).await.status, InstanceStatus::Pending);

    let later = now + chrono::Duration::seconds(481);
    assert_eq!(env.orch.recover_stuck_polls(later).await.unwrap(), 1);
    assert_eq!(env.instance(stuck.id).await.status, InstanceStatus::Failed);
    assert_eq!(env.instance(ready.id).await.status, InstanceStatus::Running);
    assert!(env
        .action_types(Some(stuck.id))
        .await
        .iter()
        .any(|t| t == logger::RECOVERY_STUCK_POLL));

    // A late poll for the recovered record stops without touching the cloud.
    let fetches = env.cloud.calls_for(MockOperation::FetchBootSecret).len();
    assert_eq!(env.orch.run_poll_task(stuck.id, 2).await.unwrap(), PollDecision::Stopped);
    assert_eq!(env.cloud.calls_for(MockOperation::FetchBootSecret).len(), fetches);
    assert_eq!(env.orch.recover_stuck_polls(later).await.unwrap(), 0);
}
