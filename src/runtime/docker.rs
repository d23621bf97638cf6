//! Docker Engine implementation of [`ContainerRuntime`].

use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    PruneContainersOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, PruneImagesOptions, RemoveImageOptions};
use futures::StreamExt;
use secrecy::ExposeSecret;

use crate::error::RuntimeError;
use crate::models::{DesiredContainer, ImageReference};
use crate::registry::RegistryCredential;
use crate::runtime::params::container_config;
use crate::runtime::{ContainerRecord, ContainerRuntime};

/// Connect to the local Docker daemon and check it responds.
///
/// Honors `DOCKER_HOST`; falls back to the platform default socket.
pub async fn connect_docker(timeout: Duration) -> Result<Docker, RuntimeError> {
    let docker = Docker::connect_with_local_defaults()
        .map_err(|e| RuntimeError::Unavailable {
            reason: e.to_string(),
        })?
        .with_timeout(timeout);

    docker
        .ping()
        .await
        .map_err(|e| RuntimeError::Unavailable {
            reason: e.to_string(),
        })?;

    Ok(docker)
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Credentials in the form the engine API expects. Built per call so the
/// plain-text copy lives no longer than the request.
fn docker_credentials(credential: Option<&RegistryCredential>) -> Option<DockerCredentials> {
    credential.map(|c| DockerCredentials {
        username: Some(c.username.clone()),
        password: Some(c.password().expose_secret().to_string()),
        serveraddress: Some(c.registry_host.clone()),
        ..Default::default()
    })
}

/// [`ContainerRuntime`] backed by a Docker Engine connection.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub async fn connect(timeout: Duration) -> Result<Self, RuntimeError> {
        Ok(Self::new(connect_docker(timeout).await?))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        let mut records = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };

            // The listing omits env; inspect each container for its config.
            let details = match self
                .docker
                .inspect_container(&id, None::<InspectContainerOptions>)
                .await
            {
                Ok(details) => details,
                Err(e) if is_not_found(&e) => {
                    tracing::debug!(container = %id, "Container vanished while listing");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let name = details
                .name
                .as_deref()
                .map(|n| n.trim_start_matches('/').to_string())
                .or_else(|| {
                    summary
                        .names
                        .as_ref()
                        .and_then(|names| names.first())
                        .map(|n| n.trim_start_matches('/').to_string())
                })
                .unwrap_or(id);

            let config = details.config.unwrap_or_default();
            records.push(ContainerRecord {
                name,
                image: config.image.or(summary.image).unwrap_or_default(),
                image_id: details.image.or(summary.image_id).unwrap_or_default(),
                env: config.env.unwrap_or_default(),
            });
        }

        Ok(records)
    }

    async fn prune_containers(&self) -> Result<(), RuntimeError> {
        let report = self
            .docker
            .prune_containers(None::<PruneContainersOptions<String>>)
            .await?;
        let pruned = report.containers_deleted.map_or(0, |c| c.len());
        if pruned > 0 {
            tracing::info!(pruned, "Pruned stopped containers");
        }
        Ok(())
    }

    async fn image_repo_digests(&self, image: &str) -> Result<Option<Vec<String>>, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(inspect) => Ok(Some(inspect.repo_digests.unwrap_or_default())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn registry_digest(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
    ) -> Result<Option<String>, RuntimeError> {
        let inspect = self
            .docker
            .inspect_registry_image(image, docker_credentials(credential))
            .await?;
        Ok(inspect.descriptor.digest)
    }

    async fn pull_image(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
    ) -> Result<(), RuntimeError> {
        let reference = ImageReference::parse(image);
        let options = CreateImageOptions {
            from_image: reference.name(),
            tag: reference.pull_tag(),
            ..Default::default()
        };

        tracing::info!(image = %image, "Pulling image");

        let mut stream = self
            .docker
            .create_image(Some(options), None, docker_credentials(credential));

        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(error) = info.error {
                return Err(RuntimeError::request("pull image", error));
            }
            if let Some(status) = info.status {
                tracing::trace!("Pull status: {}", status);
            }
        }

        Ok(())
    }

    async fn run_container(&self, spec: &DesiredContainer) -> Result<(), RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name().to_string(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), container_config(&spec.parameters))
            .await?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name(), "Create warning: {}", warning);
        }

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await?;

        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<Option<Vec<String>>, RuntimeError> {
        let details = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => details,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let tags = match details.image.as_deref() {
            Some(image_id) => match self.docker.inspect_image(image_id).await {
                Ok(image) => image.repo_tags.unwrap_or_default(),
                Err(e) if is_not_found(&e) => Vec::new(),
                Err(e) => return Err(e.into()),
            },
            None => Vec::new(),
        };

        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(Some(tags)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_image(
                tag,
                Some(RemoveImageOptions {
                    force: true,
                    noprune: true,
                }),
                None,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn prune_images(&self) -> Result<(), RuntimeError> {
        let report = self
            .docker
            .prune_images(None::<PruneImagesOptions<String>>)
            .await?;
        tracing::debug!(
            reclaimed = report.space_reclaimed.unwrap_or(0),
            "Pruned dangling images"
        );
        Ok(())
    }
}
