//! Container backend collaborator.
//!
//! The backend starts and kills physical containers and proxies data-plane
//! traffic to them. It never calls back into the orchestrator; the
//! orchestrator invokes it and commits the outcome itself.

pub mod docker;

pub use docker::{DockerBackend, DockerBackendConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BackendError;

pub type BackendResult<T> = Result<T, BackendError>;

/// Opaque data-plane request forwarded to a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub method: String,
    /// Path (with leading slash) relative to the container's root.
    pub path: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// Response produced by a container for a forwarded request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Start a container for `id` and return its reachable address.
    ///
    /// On failure nothing is retained for `id`; the caller commits no state.
    async fn start(&self, id: Uuid) -> BackendResult<String>;

    /// Stop and remove the container for `id`.
    async fn kill(&self, id: Uuid) -> BackendResult<()>;

    /// Proxy one application request to the container for `id`.
    async fn forward(&self, id: Uuid, request: ProxyRequest) -> BackendResult<ProxyResponse>;
}
