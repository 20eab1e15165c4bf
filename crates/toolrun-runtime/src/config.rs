//! Environment configuration, store backend selection and startup health checks.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::container::{ContainerRuntime, DockerClient, DockerClientConfig};
use crate::process::{
    BroadcastPublisher, InMemoryProcessRepository, LeaseConfig, ProcessRepository,
    SchedulerConfig, StatePublisher,
};

const ENV_KEYS: &[&str] = &[
    "TOOLRUN_STORE_BACKEND",
    "TOOLRUN_REDIS_URL",
    "TOOLRUN_KEY_PREFIX",
    "TOOLRUN_DOCKER_URL",
    "TOOLRUN_DOCKER_API_VERSION",
    "TOOLRUN_MAX_RUNNING",
    "TOOLRUN_MAX_WAITING",
    "TOOLRUN_MAX_RUNNING_TIME_SECS",
    "TOOLRUN_FINALIZE_DELAY_MS",
    "TOOLRUN_LOCK_TTL_MS",
    "TOOLRUN_LOCK_RETRIES",
    "TOOLRUN_REMOVE_FINISHED_CONTAINERS",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub backend: StoreBackend,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub docker_url: String,
    pub docker_api_version: Option<String>,
    pub max_running: usize,
    pub max_waiting: usize,
    /// Lifetime after which a started container is removed regardless of state.
    pub max_running_time: Duration,
    pub finalize_delay: Duration,
    pub lock_ttl: Duration,
    pub lock_retries: u32,
    pub remove_finished_containers: bool,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, String> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, String> {
        let backend_raw = text(envs, "TOOLRUN_STORE_BACKEND")
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_else(|| "memory".to_string());
        let backend = match backend_raw.as_str() {
            "memory" => StoreBackend::Memory,
            "redis" => StoreBackend::Redis,
            other => {
                return Err(format!(
                    "invalid TOOLRUN_STORE_BACKEND='{}'. expected one of: memory, redis",
                    other
                ));
            }
        };

        let redis_url = text(envs, "TOOLRUN_REDIS_URL");
        if backend == StoreBackend::Redis && redis_url.is_none() {
            return Err("TOOLRUN_STORE_BACKEND=redis requires TOOLRUN_REDIS_URL".to_string());
        }

        let max_running: usize = number(envs, "TOOLRUN_MAX_RUNNING", 4)?;
        if max_running == 0 {
            return Err("TOOLRUN_MAX_RUNNING must be at least 1".to_string());
        }

        Ok(Self {
            backend,
            redis_url,
            key_prefix: text(envs, "TOOLRUN_KEY_PREFIX").unwrap_or_else(|| "toolrun".to_string()),
            docker_url: text(envs, "TOOLRUN_DOCKER_URL")
                .unwrap_or_else(|| DockerClientConfig::default().base_url),
            docker_api_version: text(envs, "TOOLRUN_DOCKER_API_VERSION"),
            max_running,
            max_waiting: number(envs, "TOOLRUN_MAX_WAITING", 100)?,
            max_running_time: Duration::from_secs(number(
                envs,
                "TOOLRUN_MAX_RUNNING_TIME_SECS",
                4 * 60 * 60,
            )?),
            finalize_delay: Duration::from_millis(number(envs, "TOOLRUN_FINALIZE_DELAY_MS", 5000)?),
            lock_ttl: Duration::from_millis(number(envs, "TOOLRUN_LOCK_TTL_MS", 100)?),
            lock_retries: number(envs, "TOOLRUN_LOCK_RETRIES", 20)?,
            remove_finished_containers: envs
                .get("TOOLRUN_REMOVE_FINISHED_CONTAINERS")
                .map(|v| parse_bool(v))
                .unwrap_or(true),
        })
    }

    pub fn docker_client_config(&self) -> DockerClientConfig {
        DockerClientConfig {
            base_url: self.docker_url.clone(),
            api_version: self.docker_api_version.clone(),
            max_running_time: self.max_running_time,
            ..DockerClientConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_running: self.max_running,
            max_waiting: self.max_waiting,
            finalize_delay: self.finalize_delay,
            remove_finished_containers: self.remove_finished_containers,
            lease: LeaseConfig {
                lock_ttl: self.lock_ttl,
                max_attempts: self.lock_retries.max(1),
                ..LeaseConfig::default()
            },
        }
    }

    /// Store and publisher for the selected backend.
    pub async fn build_store(
        &self,
    ) -> Result<(Arc<dyn ProcessRepository>, Arc<dyn StatePublisher>), String> {
        match self.backend {
            StoreBackend::Memory => {
                let repository: Arc<dyn ProcessRepository> =
                    Arc::new(InMemoryProcessRepository::new());
                let publisher: Arc<dyn StatePublisher> = Arc::new(BroadcastPublisher::default());
                Ok((repository, publisher))
            }
            StoreBackend::Redis => self.build_redis_store().await,
        }
    }

    #[cfg(feature = "redis-store")]
    async fn build_redis_store(
        &self,
    ) -> Result<(Arc<dyn ProcessRepository>, Arc<dyn StatePublisher>), String> {
        use crate::process::{RedisProcessRepository, RedisPublisher, STATE_CHANNEL};

        let url = self
            .redis_url
            .as_deref()
            .ok_or_else(|| "redis url is missing".to_string())?;
        let repository = RedisProcessRepository::connect(url, self.key_prefix.clone())
            .await
            .map_err(|e| format!("failed to connect redis url '{}': {}", url, e))?;
        let publisher: Arc<dyn StatePublisher> = Arc::new(RedisPublisher::new(
            repository.connection(),
            format!("{}:{}", self.key_prefix, STATE_CHANNEL),
        ));
        let repository: Arc<dyn ProcessRepository> = Arc::new(repository);
        Ok((repository, publisher))
    }

    #[cfg(not(feature = "redis-store"))]
    async fn build_redis_store(
        &self,
    ) -> Result<(Arc<dyn ProcessRepository>, Arc<dyn StatePublisher>), String> {
        Err(
            "TOOLRUN_STORE_BACKEND=redis requires feature 'redis-store'. Rebuild with --features \"redis-store\"."
                .to_string(),
        )
    }

    /// Ping the container engine and the configured store.
    pub async fn startup_health_check(&self) -> Result<(), String> {
        let client = DockerClient::new(self.docker_client_config())
            .map_err(|e| format!("failed to build docker client: {}", e))?;
        client.ping().await.map_err(|e| {
            format!(
                "container engine health check failed for TOOLRUN_DOCKER_URL='{}': {}",
                self.docker_url, e
            )
        })?;
        let (repository, _) = self.build_store().await?;
        repository
            .ping()
            .await
            .map_err(|e| format!("process store health check failed: {}", e))
    }
}

fn text(envs: &HashMap<String, String>, key: &str) -> Option<String> {
    envs.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn number<T>(envs: &HashMap<String, String>, key: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match text(envs, key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| format!("invalid {}='{}': {}", key, raw, e)),
        None => Ok(default),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
