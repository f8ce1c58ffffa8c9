// Shared fixtures: an orchestrator wired to in-memory collaborators and the mock cloud.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rdp_common::{Account, Instance};
use rdp_orchestrator::config::{OrchestratorConfig, PollingConfig, RegionCatalog};
use rdp_orchestrator::crypto::SecretsCrypto;
use rdp_orchestrator::keystore::MemoryKeyStore;
use rdp_orchestrator::queue::{MemoryTaskQueue, Task};
use rdp_orchestrator::store::{MemoryStore, NewInstance, Store};
use rdp_orchestrator::Orchestrator;
use rdp_providers::mock::MockCloud;
use rdp_providers::CloudCredentials;
use secrecy::SecretString;
use uuid::Uuid;

pub const MASTER_KEY: &str = "test-master-key-0123456789abcdef0123456789";

pub struct TestEnv {
    pub orch: Orchestrator,
    pub store: MemoryStore,
    pub keys: MemoryKeyStore,
    pub queue: MemoryTaskQueue,
    pub cloud: MockCloud,
}

/// Two regions, cap 4, 3 polling attempts one minute apart.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        regions: RegionCatalog::parse("us-east-1=ami-east1,us-east-2=ami-east2").expect("catalog"),
        polling: PollingConfig {
            initial_delay: Duration::from_secs(240),
            max_attempts: 3,
            retry_delay: Duration::from_secs(60),
        },
        sync_interval: None,
        recovery_interval: None,
        ..OrchestratorConfig::default()
    }
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let store = MemoryStore::new();
        let keys = MemoryKeyStore::new();
        let queue = MemoryTaskQueue::new();
        let cloud = MockCloud::new();
        let crypto = Arc::new(SecretsCrypto::new(SecretString::from(MASTER_KEY.to_string())).expect("crypto"));
        let orch = Orchestrator::new(
            Arc::new(store.clone()),
            Arc::new(keys.clone()),
            Arc::new(queue.clone()),
            Arc::new(cloud.clone()),
            crypto,
            config,
        );
        Self {
            orch,
            store,
            keys,
            queue,
            cloud,
        }
    }

    pub async fn account(&self, label: &str) -> Account {
        let credentials = CloudCredentials {
            access_key_id: format!("AKIA{}", label.to_ascii_uppercase()),
            secret_access_key: SecretString::from("test-secret-access-key".to_string()),
        };
        self.orch
            .register_account(label, credentials, "us-east-1")
            .await
            .expect("register account")
    }

    /// Pending records with no cloud counterpart, for capacity math only.
    pub async fn seed_pending(&self, account_id: Uuid, region: &str, count: usize) -> Vec<Instance> {
        let mut out = Vec::with_capacity(count);
        for n in 0..count {
            let instance = self
                .store
                .insert_instance(NewInstance {
                    account_id,
                    region: region.to_string(),
                    cloud_instance_id: format!("i-seed-{}-{}", region, n),
                    network_rule_id: format!("sg-seed-{}", n),
                    key_id: format!("key-seed-{}", n),
                    key_name: format!("key-seed-{}-{}", region, n),
                    public_address: None,
                    username: "Administrator".to_string(),
                })
                .await
                .expect("seed instance");
            out.push(instance);
        }
        out
    }

    pub async fn instance(&self, id: Uuid) -> Instance {
        self.store
            .get_instance(id)
            .await
            .expect("store")
            .expect("instance exists")
    }

    /// Pop every queued task (ignoring due times) and execute it once.
    pub async fn run_queued(&self) -> Vec<Task> {
        let tasks = self.queue.take_all().await;
        for task in &tasks {
            self.orch.execute(task.clone()).await.expect("task");
        }
        tasks
    }

    pub async fn action_types(&self, instance_id: Option<Uuid>) -> Vec<String> {
        self.store
            .list_action_logs(instance_id)
            .await
            .expect("logs")
            .into_iter()
            .map(|l| l.action_type)
            .collect()
    }
}
