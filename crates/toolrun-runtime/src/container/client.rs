//! Container engine adapter over the Docker-compatible HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::timers::DeferredTasks;

use super::error::{RuntimeError, RuntimeOperation};
use super::images::select_images;
use super::models::{
    ContainerInfo, ContainerSpec, CreateContainerResponse, ImageInfo, ImageListOptions,
    ImageSummary,
};

/// Default safety-net lifetime for started containers.
pub const DEFAULT_MAX_RUNNING_TIME: Duration = Duration::from_secs(4 * 60 * 60);

/// Client-side view of the container engine used by the scheduler.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Start a container. Implementations also arm a deferred removal after
    /// the configured maximum running time.
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Graceful stop (SIGTERM, then the engine's own grace period).
    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Kill first when running, paused or restarting, then remove.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;

    async fn list_images(&self, options: &ImageListOptions)
        -> Result<Vec<ImageSummary>, RuntimeError>;

    async fn get_image(&self, id: &str) -> Result<ImageInfo, RuntimeError>;

    /// The owning process is final; drop any deferred removal armed at start.
    fn release_container(&self, _id: &str) {}
}

#[derive(Clone, Debug)]
pub struct DockerClientConfig {
    /// Engine base URL, e.g. `http://127.0.0.1:2375`.
    pub base_url: String,
    /// Optional API version path segment, e.g. `v1.43`.
    pub api_version: Option<String>,
    pub max_running_time: Duration,
    pub request_timeout: Option<Duration>,
}

impl Default for DockerClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:2375".to_string(),
            api_version: None,
            max_running_time: DEFAULT_MAX_RUNNING_TIME,
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Clone)]
pub struct DockerClient {
    http: reqwest::Client,
    config: DockerClientConfig,
    reaper: DeferredTasks,
}

impl DockerClient {
    pub fn new(config: DockerClientConfig) -> Result<Self, RuntimeError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| RuntimeError::Internal(format!("build http client: {e}")))?;
        Ok(Self {
            http,
            config,
            reaper: DeferredTasks::new(),
        })
    }

    pub fn config(&self) -> &DockerClientConfig {
        &self.config
    }

    /// Pending safety-net removals, keyed by container id.
    pub fn reaper(&self) -> &DeferredTasks {
        &self.reaper
    }

    pub(crate) fn url(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match &self.config.api_version {
            Some(version) => format!("{}/{}{}", base, version.trim_matches('/'), path),
            None => format!("{}{}", base, path),
        }
    }

    /// Streaming request without the per-request timeout.
    pub(crate) fn stream_request(&self, path: &str) -> RequestBuilder {
        reqwest::Client::new().get(self.url(path))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }

    async fn send(
        &self,
        operation: RuntimeOperation,
        builder: RequestBuilder,
    ) -> Result<Response, RuntimeError> {
        let response = builder
            .send()
            .await
            .map_err(|e| RuntimeError::from_transport(operation, &e))?;
        check_status(operation, response).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: RuntimeOperation,
        builder: RequestBuilder,
    ) -> Result<T, RuntimeError> {
        let response = self.send(operation, builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RuntimeError::Internal(format!("{operation:?}: decode response: {e}")))
    }

    fn arm_reaper(&self, id: &str) {
        let client = self.clone();
        let container_id = id.to_string();
        let lifetime = self.config.max_running_time;
        self.reaper.schedule(id, lifetime, async move {
            log::warn!(
                "container_reaper container_id={} max_running_time_secs={}",
                container_id,
                lifetime.as_secs()
            );
            if let Err(e) = client.remove_container(&container_id).await {
                if !e.is_not_found() {
                    log::error!(
                        "container_reaper_failed container_id={} code={} error={}",
                        container_id,
                        e.code(),
                        e
                    );
                }
            }
        });
    }
}

pub(crate) async fn check_status(
    operation: RuntimeOperation,
    response: Response,
) -> Result<Response, RuntimeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);
    Err(RuntimeError::from_status(operation, status.as_u16(), message))
}

fn container_path(id: &str, suffix: &str) -> String {
    format!("/containers/{}{}", urlencoding::encode(id), suffix)
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.send(RuntimeOperation::Ping, self.request(Method::GET, "/_ping"))
            .await
            .map(|_| ())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut builder = self
            .request(Method::POST, "/containers/create")
            .json(&spec.to_create_body());
        if let Some(name) = &spec.name {
            builder = builder.query(&[("name", name)]);
        }
        let created: CreateContainerResponse = self
            .send_json(RuntimeOperation::CreateContainer, builder)
            .await?;
        for warning in created.warnings.iter().flatten() {
            log::warn!(
                "container_create_warning container_id={} warning={}",
                created.id,
                warning
            );
        }
        log::debug!("container_created container_id={} image={}", created.id, spec.image);
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let builder = self.request(Method::POST, &container_path(id, "/start"));
        self.send(RuntimeOperation::StartContainer, builder).await?;
        self.arm_reaper(id);
        log::debug!("container_started container_id={}", id);
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let builder = self.request(Method::POST, &container_path(id, "/stop"));
        self.send(RuntimeOperation::StopContainer, builder).await?;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        let builder = self.request(Method::POST, &container_path(id, "/kill"));
        self.send(RuntimeOperation::KillContainer, builder).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.reaper.cancel(id);
        let info = self.inspect_container(id).await?;
        if info.state.is_active() {
            match self.kill_container(id).await {
                Ok(()) => {}
                // Died between inspect and kill.
                Err(e) if e.is_not_running() => {}
                Err(e) => return Err(e),
            }
        }
        let builder = self
            .request(Method::DELETE, &container_path(id, ""))
            .query(&[("v", "true")]);
        self.send(RuntimeOperation::RemoveContainer, builder).await?;
        log::debug!("container_removed container_id={}", id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let builder = self.request(Method::GET, &container_path(id, "/json"));
        self.send_json(RuntimeOperation::InspectContainer, builder)
            .await
    }

    async fn list_images(
        &self,
        options: &ImageListOptions,
    ) -> Result<Vec<ImageSummary>, RuntimeError> {
        let builder = self.request(Method::GET, "/images/json");
        let images: Vec<ImageSummary> = self
            .send_json(RuntimeOperation::ListImages, builder)
            .await?;
        Ok(select_images(images, options))
    }

    async fn get_image(&self, id: &str) -> Result<ImageInfo, RuntimeError> {
        let path = format!("/images/{}/json", urlencoding::encode(id));
        self.send_json(RuntimeOperation::InspectImage, self.request(Method::GET, &path))
            .await
    }

    fn release_container(&self, id: &str) {
        if self.reaper.cancel(id) {
            log::debug!("container_reaper_disarmed container_id={}", id);
        }
    }
}
