use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use secrecy::SecretString;

pub const DEFAULT_REGION_IMAGES: &str = "us-east-1=ami-06777e7ef7441deff,\
us-east-2=ami-013e43c5ba6d06126,\
us-west-1=ami-0bce52ac08a12d564,\
us-west-2=ami-02deb4df6847d746c";

/// Ordered region -> base image mapping. Region enumeration (inventory, system-wide sync)
/// follows the configured order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionCatalog {
    entries: Vec<(String, String)>,
}

impl RegionCatalog {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut entries: Vec<(String, String)> = Vec::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (region, image) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("expected region=image, got '{}'", pair))?;
            let (region, image) = (region.trim(), image.trim());
            if region.is_empty() || image.is_empty() {
                return Err(anyhow!("empty region or image in '{}'", pair));
            }
            if entries.iter().any(|(r, _)| r == region) {
                return Err(anyhow!("region '{}' listed twice", region));
            }
            entries.push((region.to_string(), image.to_string()));
        }
        if entries.is_empty() {
            return Err(anyhow!("no regions configured"));
        }
        Ok(Self { entries })
    }

    pub fn image_for(&self, region: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(r, _)| r == region)
            .map(|(_, image)| image.as_str())
    }

    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(r, _)| r.as_str())
    }
}

impl Default for RegionCatalog {
    fn default() -> Self {
        let entries = DEFAULT_REGION_IMAGES
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(r, i)| (r.to_string(), i.to_string()))
            .collect();
        Self { entries }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    pub initial_delay: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl PollingConfig {
    /// Latest point after creation by which a healthy loop has ended, plus one retry of slack.
    pub fn deadline(&self) -> Duration {
        self.initial_delay + self.retry_delay * self.max_attempts.saturating_add(1)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(240),
            max_attempts: 20,
            retry_delay: Duration::from_secs(60),
        }
    }
}

/// Lifecycle policy. Everything here is injectable; defaults are the production baseline.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub capacity_per_region: u32,
    pub regions: RegionCatalog,
    pub instance_size: String,
    pub rdp_port: u16,
    pub allowed_cidr: String,
    pub username: String,
    pub polling: PollingConfig,
    /// None disables the periodic system-wide sync.
    pub sync_interval: Option<Duration>,
    /// None disables the stuck-poll recovery sweep.
    pub recovery_interval: Option<Duration>,
    pub worker_poll_interval: Duration,
    pub worker_batch_size: usize,
    pub key_store_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            capacity_per_region: 4,
            regions: RegionCatalog::default(),
            instance_size: "m7i-flex.large".to_string(),
            rdp_port: 3389,
            allowed_cidr: "0.0.0.0/0".to_string(),
            username: "Administrator".to_string(),
            polling: PollingConfig::default(),
            sync_interval: Some(Duration::from_secs(300)),
            recovery_interval: Some(Duration::from_secs(60)),
            worker_poll_interval: Duration::from_millis(1000),
            worker_batch_size: 32,
            key_store_dir: PathBuf::from("./data/aws-keys"),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (env in prod, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let base = Self::default();

        let capacity_per_region = parse_or(&get, "RDP_CAPACITY_PER_REGION", base.capacity_per_region)?;
        if capacity_per_region == 0 {
            return Err(anyhow!("RDP_CAPACITY_PER_REGION must be at least 1"));
        }
        let regions = match get("RDP_REGION_IMAGES") {
            Some(raw) => RegionCatalog::parse(&raw).context("invalid RDP_REGION_IMAGES")?,
            None => base.regions,
        };
        let max_attempts = parse_or(&get, "POLL_MAX_ATTEMPTS", base.polling.max_attempts)?;
        if max_attempts == 0 {
            return Err(anyhow!("POLL_MAX_ATTEMPTS must be at least 1"));
        }
        let polling = PollingConfig {
            initial_delay: Duration::from_secs(parse_or(&get, "POLL_INITIAL_DELAY_SECS", 240u64)?),
            max_attempts,
            retry_delay: Duration::from_secs(parse_or(&get, "POLL_RETRY_DELAY_SECS", 60u64)?),
        };
        let sync_secs: u64 = parse_or(&get, "SYNC_INTERVAL_SECS", 300u64)?;
        let recovery_secs: u64 = parse_or(&get, "RECOVERY_INTERVAL_SECS", 60u64)?;
        let worker_batch_size: usize = parse_or(&get, "WORKER_BATCH_SIZE", base.worker_batch_size)?;

        Ok(Self {
            capacity_per_region,
            regions,
            instance_size: get("RDP_INSTANCE_SIZE").unwrap_or(base.instance_size),
            rdp_port: parse_or(&get, "RDP_PORT", base.rdp_port)?,
            allowed_cidr: get("RDP_ALLOWED_CIDR").unwrap_or(base.allowed_cidr),
            username: get("RDP_USERNAME").unwrap_or(base.username),
            polling,
            sync_interval: (sync_secs > 0).then(|| Duration::from_secs(sync_secs)),
            recovery_interval: (recovery_secs > 0).then(|| Duration::from_secs(recovery_secs)),
            worker_poll_interval: Duration::from_millis(parse_or(&get, "WORKER_POLL_INTERVAL_MS", 1000u64)?),
            worker_batch_size: worker_batch_size.max(1),
            key_store_dir: get("KEY_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(base.key_store_dir),
        })
    }
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}

/// Process-level settings needed by the binary only.
pub struct ServiceSettings {
    pub database_url: String,
    pub redis_url: String,
    pub master_key: SecretString,
    pub provider: String,
    pub listen_addr: SocketAddr,
}

impl std::fmt::Debug for ServiceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSettings")
            .field("database_url", &"[REDACTED]")
            .field("redis_url", &self.redis_url)
            .field("master_key", &"[REDACTED]")
            .field("provider", &self.provider)
            .field("listen_addr", &self.listen_addr)
            .finish()
    }
}

impl ServiceSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env_or_file("DATABASE_URL").context("DATABASE_URL must be set")?;
        let redis_url = env_or_file("REDIS_URL").context("REDIS_URL must be set")?;
        let master_key = env_or_file("SECRETS_MASTER_KEY").context("SECRETS_MASTER_KEY must be set")?;
        let provider = std::env::var("PROVIDER")
            .ok()
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "mock".to_string());
        let listen_addr = std::env::var("ORCHESTRATOR_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8001".to_string())
            .parse::<SocketAddr>()
            .context("invalid ORCHESTRATOR_ADDR")?;

        Ok(Self {
            database_url,
            redis_url,
            master_key: SecretString::from(master_key),
            provider,
            listen_addr,
        })
    }
}

/// Prefer `<NAME>_FILE` (Docker/K8s secret mounts), fall back to `<NAME>`.
fn env_or_file(name: &str) -> anyhow::Result<String> {
    if let Ok(path) = std::env::var(format!("{}_FILE", name)) {
        let path = path.trim();
        if !path.is_empty() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}_FILE at {}", name, path))?;
            let value = raw.trim().to_string();
            if !value.is_empty() {
                return Ok(value);
            }
        }
    }
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("{} is empty or missing", name))
}
