use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, ContainerSummary, ImageInspect,
};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

pub type ContainerId = String;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not modified: {0}")]
    NotModified(String),
    #[error("runtime responded with {status}: {message}")]
    Server { status: u16, message: String },
    #[error("unexpected runtime payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Docker(bollard::errors::Error),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    /// Already stopped, already started and already removed answers.
    pub fn is_idempotent_noop(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_) | RuntimeError::NotModified(_))
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(value: bollard::errors::Error) -> Self {
        match value {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 304,
                message,
            } => RuntimeError::NotModified(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => RuntimeError::Server {
                status: status_code,
                message,
            },
            other => RuntimeError::Docker(other),
        }
    }
}

/// The subset of the container runtime the update engine drives.
///
/// Containers are addressed by id or name, exactly as the Docker engine API
/// accepts them.
pub trait ContainerRuntime: Send + Sync + 'static {
    /// All containers, including stopped ones.
    fn list_containers(
        &self,
    ) -> impl Future<Output = Result<Vec<ContainerSummary>, RuntimeError>> + Send;

    fn inspect_container(
        &self,
        container: &str,
    ) -> impl Future<Output = Result<ContainerInspectResponse, RuntimeError>> + Send;

    fn inspect_image(
        &self,
        image: &str,
    ) -> impl Future<Output = Result<ImageInspect, RuntimeError>> + Send;

    fn pull_image(&self, image: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> impl Future<Output = Result<ContainerId, RuntimeError>> + Send;

    fn start_container(
        &self,
        container: &str,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn stop_container(
        &self,
        container: &str,
        timeout_secs: i32,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn rename_container(
        &self,
        container: &str,
        new_name: &str,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn remove_container(
        &self,
        container: &str,
        force: bool,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Raw answer of the distribution inspection endpoint for `image`.
    /// A reference unknown to the registry yields [`RuntimeError::NotFound`].
    fn inspect_distribution(
        &self,
        image: &str,
    ) -> impl Future<Output = Result<serde_json::Value, RuntimeError>> + Send;
}

/// Live view of a container as listed by the runtime.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub state: Option<String>,
    pub status: Option<String>,
    pub labels: HashMap<String, String>,
}

impl From<ContainerSummary> for ContainerInfo {
    fn from(summary: ContainerSummary) -> Self {
        let name = summary
            .names
            .unwrap_or_default()
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        Self {
            id: summary.id.unwrap_or_default(),
            name,
            image: summary.image.unwrap_or_default(),
            state: summary.state.map(|s| s.to_string()),
            status: summary.status,
            labels: summary.labels.unwrap_or_default(),
        }
    }
}

/// Split an image reference into repository and tag (or digest).
///
/// A colon only separates a tag when it follows the last path segment, so
/// registry ports survive: `registry:5000/app` has the implicit tag `latest`.
pub fn split_reference(image: &str) -> (&str, &str) {
    if let Some((repo, digest)) = image.split_once('@') {
        return (repo, digest);
    }
    let last_segment = image.rfind('/').map_or(0, |pos| pos + 1);
    match image[last_segment..].rfind(':') {
        Some(pos) => {
            let split = last_segment + pos;
            (&image[..split], &image[split + 1..])
        }
        None => (image, "latest"),
    }
}
