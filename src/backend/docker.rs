//! Docker implementation of the container backend.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BackendResult, ContainerBackend, ProxyRequest, ProxyResponse};
use crate::error::BackendError;

/// Configuration for Docker-backed containers.
#[derive(Debug, Clone)]
pub struct DockerBackendConfig {
    /// Image every pool container runs.
    pub image: String,
    /// Memory limit in MB.
    pub memory_limit_mb: u64,
    /// CPU shares (relative weight).
    pub cpu_shares: u32,
    /// Port the sandbox application listens on inside the container.
    pub container_port: u16,
}

impl Default for DockerBackendConfig {
    fn default() -> Self {
        Self {
            image: "sandpool-sandbox:latest".to_string(),
            memory_limit_mb: 2048,
            cpu_shares: 1024,
            container_port: 8080,
        }
    }
}

/// Starts pool containers via the Docker daemon and proxies traffic to them.
///
/// Each container gets an ephemeral published port on the host; the mapped
/// address is kept in memory only (re-resolved on restart by the
/// orchestrator replacing the pool).
pub struct DockerBackend {
    config: DockerBackendConfig,
    /// Cached Docker connection (created on first use).
    docker: RwLock<Option<bollard::Docker>>,
    addresses: RwLock<HashMap<Uuid, String>>,
    http: reqwest::Client,
}

impl DockerBackend {
    pub fn new(config: DockerBackendConfig) -> Self {
        Self {
            config,
            docker: RwLock::new(None),
            addresses: RwLock::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    /// Get or create a Docker connection.
    async fn docker(&self) -> BackendResult<bollard::Docker> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker =
            bollard::Docker::connect_with_local_defaults().map_err(|e| BackendError::Unavailable {
                reason: e.to_string(),
            })?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    fn container_name(id: Uuid) -> String {
        format!("sandpool-{id}")
    }

    /// Resolve the ephemeral host port Docker assigned for the sandbox port.
    fn host_address(
        inspect: &bollard::models::ContainerInspectResponse,
        container_port: u16,
    ) -> Option<String> {
        let ports = inspect.network_settings.as_ref()?.ports.as_ref()?;
        let bindings = ports.get(&format!("{container_port}/tcp"))?.as_ref()?;
        let host_port = bindings.first()?.host_port.as_ref()?;
        Some(format!("127.0.0.1:{host_port}"))
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn start(&self, id: Uuid) -> BackendResult<String> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::HostConfig;

        let docker = self.docker().await?;
        let port_key = format!("{}/tcp", self.config.container_port);

        let host_config = HostConfig {
            memory: Some((self.config.memory_limit_mb * 1024 * 1024) as i64),
            cpu_shares: Some(self.config.cpu_shares as i64),
            network_mode: Some("bridge".to_string()),
            publish_all_ports: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.config.image.clone()),
            env: Some(vec![format!("SANDPOOL_CONTAINER_ID={id}")]),
            exposed_ports: Some(
                [(port_key, HashMap::new())]
                    .into_iter()
                    .collect::<HashMap<String, HashMap<(), ()>>>(),
            ),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Self::container_name(id),
            ..Default::default()
        };

        let response = docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| BackendError::StartFailed {
                id,
                reason: e.to_string(),
            })?;
        let docker_id = response.id;

        docker
            .start_container::<String>(&docker_id, None)
            .await
            .map_err(|e| BackendError::StartFailed {
                id,
                reason: format!("created but failed to start: {e}"),
            })?;

        let inspect = docker
            .inspect_container(&docker_id, None)
            .await
            .map_err(|e| BackendError::StartFailed {
                id,
                reason: format!("failed to inspect started container: {e}"),
            })?;

        let Some(address) = Self::host_address(&inspect, self.config.container_port) else {
            // Started but unreachable; clean it up rather than leak it.
            let _ = docker
                .remove_container(
                    &docker_id,
                    Some(bollard::container::RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(BackendError::StartFailed {
                id,
                reason: format!(
                    "no host port published for {}/tcp",
                    self.config.container_port
                ),
            });
        };

        self.addresses.write().await.insert(id, address.clone());

        tracing::info!(container_id = %id, address = %address, "Started pool container");
        Ok(address)
    }

    async fn kill(&self, id: Uuid) -> BackendResult<()> {
        let docker = self.docker().await?;
        let name = Self::container_name(id);

        if let Err(e) = docker
            .stop_container(&name, Some(bollard::container::StopContainerOptions { t: 5 }))
            .await
        {
            tracing::warn!(container_id = %id, error = %e, "Failed to stop container (may already be stopped)");
        }

        docker
            .remove_container(
                &name,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| BackendError::KillFailed {
                id,
                reason: e.to_string(),
            })?;

        self.addresses.write().await.remove(&id);

        tracing::info!(container_id = %id, "Removed pool container");
        Ok(())
    }

    async fn forward(&self, id: Uuid, request: ProxyRequest) -> BackendResult<ProxyResponse> {
        let address = self
            .addresses
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| BackendError::ForwardFailed {
                id,
                reason: "no known address for container".to_string(),
            })?;

        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            BackendError::ForwardFailed {
                id,
                reason: format!("bad method '{}': {e}", request.method),
            }
        })?;

        let url = format!("http://{}{}", address, request.path);
        let mut builder = self.http.request(method, &url).body(request.body);
        if let Some(content_type) = &request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::ForwardFailed {
                id,
                reason: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response
            .bytes()
            .await
            .map_err(|e| BackendError::ForwardFailed {
                id,
                reason: format!("failed to read response body: {e}"),
            })?
            .to_vec();

        Ok(ProxyResponse {
            status,
            body,
            content_type,
        })
    }
}
