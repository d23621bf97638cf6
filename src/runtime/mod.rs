//! Container runtime seam.
//!
//! Everything the agent needs from the container engine goes through the
//! [`ContainerRuntime`] trait. [`docker::DockerRuntime`] talks to a Docker
//! Engine; tests use [`crate::testing::FakeRuntime`].
//!
//! Calls made through [`bounded`] are limited by the configured runtime
//! timeout; an elapsed call becomes [`RuntimeError::Timeout`] and is handled
//! like any other failure of that call.

pub mod docker;
pub mod params;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::models::DesiredContainer;
use crate::registry::RegistryCredential;

pub use docker::{DockerRuntime, connect_docker};

/// A container as listed by the runtime, with its recorded configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub name: String,
    /// Image reference from the container config (usually `repo:tag`).
    pub image: String,
    /// Engine image id the container was created from.
    pub image_id: String,
    pub env: Vec<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List every container on the host, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, RuntimeError>;

    /// Remove stopped containers.
    async fn prune_containers(&self) -> Result<(), RuntimeError>;

    /// Repo-digest annotations of a locally stored image.
    ///
    /// `Ok(None)` when the image is not present on the host.
    async fn image_repo_digests(&self, image: &str) -> Result<Option<Vec<String>>, RuntimeError>;

    /// Manifest digest published by the registry, without pulling.
    async fn registry_digest(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
    ) -> Result<Option<String>, RuntimeError>;

    async fn pull_image(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
    ) -> Result<(), RuntimeError>;

    /// Create and start a detached container with an always-restart policy.
    async fn run_container(&self, spec: &DesiredContainer) -> Result<(), RuntimeError>;

    /// Stop and force-remove a container.
    ///
    /// Returns the tags of the image it ran, or `Ok(None)` if no container by
    /// that name exists.
    async fn remove_container(&self, name: &str) -> Result<Option<Vec<String>>, RuntimeError>;

    /// Force-remove an image tag without pruning its parents.
    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError>;

    /// Remove dangling images.
    async fn prune_images(&self) -> Result<(), RuntimeError>;
}

/// Run a runtime call with an upper bound on its duration.
pub async fn bounded<T, F>(
    timeout: Duration,
    operation: &'static str,
    call: F,
) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::Timeout { operation, timeout }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let ok = bounded(Duration::from_secs(1), "noop", async { Ok::<_, RuntimeError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err = bounded(Duration::from_secs(1), "noop", async {
            Err::<(), _>(RuntimeError::request("noop", "refused"))
        })
        .await;
        assert!(matches!(err, Err(RuntimeError::Request { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result = bounded(Duration::from_millis(50), "list containers", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, RuntimeError>(())
        })
        .await;

        match result {
            Err(RuntimeError::Timeout { operation, timeout }) => {
                assert_eq!(operation, "list containers");
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
