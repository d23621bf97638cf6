//! Applies reconciliation decisions to the container runtime.
//!
//! - `create`: login (if the container has an auth bundle), explicit pull,
//!   then create+start with an always-restart policy
//! - `update`: `remove` then `create`; there is no in-place reconfiguration
//! - `remove`: force-remove the container, drop its image tags, prune
//!   dangling images
//!
//! An update leaves the container absent between its remove and create. If
//! the process dies in that window, the next pass sees the name as missing
//! and creates it.

use std::sync::Arc;
use std::time::Duration;

use crate::error::ActionError;
use crate::models::{DesiredContainer, ImageReference};
use crate::registry::{LoginOutcome, RegistryCredentialStore};
use crate::runtime::{ContainerRuntime, bounded};

pub struct LifecycleExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    credentials: Arc<RegistryCredentialStore>,
    timeout: Duration,
    pull_timeout: Duration,
}

impl LifecycleExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        credentials: Arc<RegistryCredentialStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            credentials,
            timeout,
            pull_timeout: timeout,
        }
    }

    /// Bound the whole image pull separately from single runtime calls.
    pub fn with_pull_timeout(mut self, pull_timeout: Duration) -> Self {
        self.pull_timeout = pull_timeout;
        self
    }

    /// Pull the image and start the container.
    ///
    /// Registry credentials are held only for the login, pull and run calls
    /// and released on every exit path.
    pub async fn create(&self, spec: &DesiredContainer) -> Result<(), ActionError> {
        let image = spec.image();
        let mut scope = self.credentials.acquire(spec.auth.as_ref()).await;

        match scope.login(self.runtime.as_ref(), image, self.timeout).await {
            LoginOutcome::NotRequired => {}
            LoginOutcome::Authenticated { registry } => {
                tracing::debug!(container = %spec.name(), registry = %registry, "Authenticated for pull");
            }
            LoginOutcome::Failed => {
                return Err(ActionError::AuthenticationFailed {
                    name: spec.name().to_string(),
                    registry: ImageReference::parse(image).registry_host(),
                });
            }
        }

        bounded(
            self.pull_timeout,
            "pull image",
            self.runtime.pull_image(image, scope.active()),
        )
        .await
        .map_err(|source| ActionError::PullFailed {
            image: image.to_string(),
            source,
        })?;

        bounded(
            self.timeout,
            "run container",
            self.runtime.run_container(spec),
        )
        .await
        .map_err(|source| ActionError::StartFailed {
            name: spec.name().to_string(),
            source,
        })?;

        tracing::info!(container = %spec.name(), image = %image, "Started container");
        Ok(())
    }

    /// Recreate the container from `spec`.
    ///
    /// If the old container cannot be removed the create is not attempted.
    pub async fn update(&self, spec: &DesiredContainer) -> Result<(), ActionError> {
        self.remove(spec.name()).await?;
        self.create(spec).await
    }

    /// Remove the container and its image. Removing an absent container is a no-op.
    pub async fn remove(&self, name: &str) -> Result<(), ActionError> {
        let tags = match bounded(
            self.timeout,
            "remove container",
            self.runtime.remove_container(name),
        )
        .await
        {
            Ok(Some(tags)) => tags,
            Ok(None) => {
                tracing::debug!(container = %name, "Container already absent");
                return Ok(());
            }
            Err(source) => {
                return Err(ActionError::RemoveFailed {
                    name: name.to_string(),
                    source,
                });
            }
        };

        // Image cleanup is best-effort; the container is already gone.
        for tag in &tags {
            if let Err(e) = bounded(self.timeout, "remove image", self.runtime.remove_image(tag)).await
            {
                tracing::warn!(container = %name, image = %tag, error = %e, "Failed to remove image");
            }
        }
        if let Err(e) = bounded(self.timeout, "prune images", self.runtime.prune_images()).await {
            tracing::warn!(error = %e, "Failed to prune dangling images");
        }

        tracing::info!(container = %name, "Removed container");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use pretty_assertions::assert_eq;

    fn executor(runtime: &Arc<FakeRuntime>) -> (LifecycleExecutor, Arc<RegistryCredentialStore>) {
        let store = Arc::new(RegistryCredentialStore::new());
        let executor =
            LifecycleExecutor::new(runtime.clone(), store.clone(), Duration::from_secs(5));
        (executor, store)
    }

    fn auth_for(host: &str, userpass: &str) -> String {
        serde_json::json!({ "auths": { host: { "auth": STANDARD.encode(userpass) } } }).to_string()
    }

    async fn assert_released(store: &RegistryCredentialStore) {
        let scope =
            tokio::time::timeout(Duration::from_millis(50), store.acquire(None)).await;
        assert!(scope.is_ok(), "credential scope was not released");
    }

    #[tokio::test]
    async fn test_create_pulls_before_run() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.with_registry_digest("nginx:1.25", "sha256:abc");
        let (executor, _) = executor(&runtime);

        let spec = DesiredContainer::new("web", "web", "nginx:1.25").with_env(&["A=1"]);
        executor.create(&spec).await.unwrap();

        assert_eq!(runtime.calls(), vec!["pull nginx:1.25", "run web"]);
        let web = runtime.container("web").unwrap();
        assert_eq!(web.env, vec!["A=1"]);
    }

    #[tokio::test]
    async fn test_create_with_private_registry() {
        let image = "reg.example.com/team/api:2";
        let runtime = Arc::new(FakeRuntime::new());
        runtime.with_registry_digest(image, "sha256:abc");
        runtime.require_credentials(image, "deploy", "pw:with:colons");
        let (executor, store) = executor(&runtime);

        let spec = DesiredContainer::new("api", "api", image)
            .with_auth(auth_for("reg.example.com", "deploy:pw:with:colons"));
        executor.create(&spec).await.unwrap();

        assert!(runtime.container("api").is_some());
        assert_released(&store).await;
    }

    #[tokio::test]
    async fn test_create_fails_when_login_rejected() {
        let image = "reg.example.com/team/api:2";
        let runtime = Arc::new(FakeRuntime::new());
        runtime.with_registry_digest(image, "sha256:abc");
        runtime.require_credentials(image, "deploy", "right");
        let (executor, store) = executor(&runtime);

        let spec = DesiredContainer::new("api", "api", image)
            .with_auth(auth_for("reg.example.com", "deploy:wrong"));
        let err = executor.create(&spec).await.unwrap_err();

        assert!(matches!(err, ActionError::AuthenticationFailed { .. }));
        assert!(runtime.container("api").is_none());
        assert!(!runtime.calls().iter().any(|c| c.starts_with("pull")));
        assert_released(&store).await;
    }

    #[tokio::test]
    async fn test_pull_failure_reported_and_scope_released() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.with_registry_digest("nginx:1.25", "sha256:abc");
        runtime.fail_pull("nginx:1.25");
        let (executor, store) = executor(&runtime);

        let spec = DesiredContainer::new("web", "web", "nginx:1.25")
            .with_auth(auth_for("docker.io", "u:p"));
        let err = executor.create(&spec).await.unwrap_err();

        assert!(matches!(err, ActionError::PullFailed { .. }));
        assert!(runtime.container("web").is_none());
        assert_released(&store).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_pull_within_pull_timeout() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.with_registry_digest("huge:1", "sha256:abc");
        runtime.with_pull_delay("huge:1", Duration::from_secs(90));
        let (executor, _) = executor(&runtime);
        let executor = executor.with_pull_timeout(Duration::from_secs(600));

        let spec = DesiredContainer::new("big", "big", "huge:1");
        executor.create(&spec).await.unwrap();

        assert!(runtime.container("big").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_exceeding_pull_timeout_fails() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.with_registry_digest("huge:1", "sha256:abc");
        runtime.with_pull_delay("huge:1", Duration::from_secs(900));
        let (executor, _) = executor(&runtime);
        let executor = executor.with_pull_timeout(Duration::from_secs(600));

        let err = executor
            .create(&DesiredContainer::new("big", "big", "huge:1"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ActionError::PullFailed {
                source: crate::error::RuntimeError::Timeout { .. },
                ..
            }
        ));
        assert!(runtime.container("big").is_none());
    }

    #[tokio::test]
    async fn test_remove_cleans_images() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.with_container("web", "nginx:1.25", &[]);
        runtime.with_local_image("nginx:1.25", &["nginx@sha256:abc"]);
        let (executor, _) = executor(&runtime);

        executor.remove("web").await.unwrap();

        assert!(runtime.container("web").is_none());
        assert_eq!(
            runtime.calls(),
            vec!["remove web", "remove image nginx:1.25", "prune images"]
        );
    }

    #[tokio::test]
    async fn test_remove_absent_is_ok() {
        let runtime = Arc::new(FakeRuntime::new());
        let (executor, _) = executor(&runtime);

        executor.remove("ghost").await.unwrap();
        assert_eq!(runtime.calls(), vec!["remove ghost"]);
    }

    #[tokio::test]
    async fn test_remove_failure_reported() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.with_container("web", "nginx:1.25", &[]);
        runtime.fail_remove("web");
        let (executor, _) = executor(&runtime);

        let err = executor.remove("web").await.unwrap_err();
        assert!(matches!(err, ActionError::RemoveFailed { .. }));
        assert!(runtime.container("web").is_some());
    }

    #[tokio::test]
    async fn test_update_recreates() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.with_container("web", "nginx:1.24", &["A=1"]);
        runtime.with_registry_digest("nginx:1.25", "sha256:new");
        let (executor, _) = executor(&runtime);

        let spec = DesiredContainer::new("web", "web", "nginx:1.25").with_env(&["A=2"]);
        executor.update(&spec).await.unwrap();

        let web = runtime.container("web").unwrap();
        assert_eq!(web.image, "nginx:1.25");
        assert_eq!(web.env, vec!["A=2"]);
        assert_eq!(runtime.calls().first().map(String::as_str), Some("remove web"));
    }

    #[tokio::test]
    async fn test_update_skips_create_when_remove_fails() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.with_container("web", "nginx:1.24", &[]);
        runtime.with_registry_digest("nginx:1.25", "sha256:new");
        runtime.fail_remove("web");
        let (executor, _) = executor(&runtime);

        let spec = DesiredContainer::new("web", "web", "nginx:1.25");
        assert!(executor.update(&spec).await.is_err());
        assert!(!runtime.calls().iter().any(|c| c.starts_with("pull")));
    }
}
