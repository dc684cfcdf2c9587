use crate::runtime::{ContainerId, ContainerRuntime, RuntimeError, split_reference};
use bollard::Docker;
use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, ContainerSummary, ImageInspect,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions,
    ListContainersOptionsBuilder, RemoveContainerOptions, RenameContainerOptions,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use futures_util::StreamExt;
use log::{debug, info, trace};

/// [`ContainerRuntime`] backed by the local Docker engine.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options = ListContainersOptionsBuilder::default().all(true).build();
        let containers = self.docker.list_containers(Some(options)).await?;
        debug!("found {} containers", containers.len());
        Ok(containers)
    }

    async fn inspect_container(
        &self,
        container: &str,
    ) -> Result<ContainerInspectResponse, RuntimeError> {
        let details = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await?;
        trace!(
            "container details: {}",
            serde_json::to_string_pretty(&details).unwrap_or_default()
        );
        Ok(details)
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageInspect, RuntimeError> {
        Ok(self.docker.inspect_image(image).await?)
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let (repository, tag) = split_reference(image);
        let options = CreateImageOptions {
            from_image: Some(repository.to_owned()),
            tag: Some(tag.to_owned()),
            ..Default::default()
        };
        info!("Pulling {repository}:{tag}");
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            let output = result?;
            debug!("{output:?}");
            if let Some(status) = &output.status
                && status.contains("Digest:")
            {
                info!("{image}: {status}");
            }
        }
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> Result<ContainerId, RuntimeError> {
        let options = CreateContainerOptions {
            name: Some(name.to_owned()),
            ..Default::default()
        };
        let response = self.docker.create_container(Some(options), body).await?;
        for warning in &response.warnings {
            debug!("create {name}: {warning}");
        }
        Ok(response.id)
    }

    async fn start_container(&self, container: &str) -> Result<(), RuntimeError> {
        Ok(self
            .docker
            .start_container(container, None::<StartContainerOptions>)
            .await?)
    }

    async fn stop_container(&self, container: &str, timeout_secs: i32) -> Result<(), RuntimeError> {
        let options = StopContainerOptionsBuilder::new().t(timeout_secs).build();
        Ok(self.docker.stop_container(container, Some(options)).await?)
    }

    async fn rename_container(&self, container: &str, new_name: &str) -> Result<(), RuntimeError> {
        let options = RenameContainerOptions {
            name: new_name.to_owned(),
        };
        Ok(self.docker.rename_container(container, options).await?)
    }

    async fn remove_container(&self, container: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        Ok(self
            .docker
            .remove_container(container, Some(options))
            .await?)
    }

    async fn inspect_distribution(&self, image: &str) -> Result<serde_json::Value, RuntimeError> {
        let inspect = self.docker.inspect_registry_image(image, None).await?;
        serde_json::to_value(&inspect).map_err(|e| RuntimeError::Payload(e.to_string()))
    }
}
