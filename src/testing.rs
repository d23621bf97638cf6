//! Test doubles for the runtime and desired-state seams.
//!
//! Provides:
//! - [`FakeRuntime`]: an in-memory container engine with a fake registry
//! - [`StaticSource`]: a desired-state source returning a fixed list, or failing
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kapellmeister::testing::FakeRuntime;
//!
//! let runtime = Arc::new(FakeRuntime::new());
//! runtime.with_registry_digest("nginx:1.25", "sha256:abc");
//! runtime.with_container("web", "nginx:1.25", &["A=1"]);
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;

use crate::error::{FetchError, RuntimeError};
use crate::management::DesiredStateSource;
use crate::models::{DesiredContainer, ImageReference};
use crate::registry::RegistryCredential;
use crate::runtime::{ContainerRecord, ContainerRuntime};

#[derive(Default)]
struct FakeState {
    containers: BTreeMap<String, ContainerRecord>,
    /// image -> repo digests of the locally stored copy
    local_images: HashMap<String, Vec<String>>,
    /// image -> digest published by the registry
    registry: HashMap<String, String>,
    /// image -> (username, password) the registry demands
    private: HashMap<String, (String, String)>,
    fail_listing: bool,
    failing_pulls: HashSet<String>,
    failing_removes: HashSet<String>,
    pull_delays: HashMap<String, Duration>,
    calls: Vec<String>,
}

/// In-memory container engine.
///
/// Pulls copy the registry digest into the local image store, so a pass that
/// creates a container leaves it fresh for the next pass. Registry lookups
/// are not recorded in [`calls`](Self::calls); mutating calls are.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        // A panicking test poisons the lock; the state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a container created from `image`, with the image id equal to the tag.
    pub fn with_container(&self, name: &str, image: &str, env: &[&str]) {
        self.state().containers.insert(
            name.to_string(),
            ContainerRecord {
                name: name.to_string(),
                image: image.to_string(),
                image_id: image.to_string(),
                env: env.iter().map(|e| e.to_string()).collect(),
            },
        );
    }

    pub fn with_local_image(&self, image: &str, repo_digests: &[&str]) {
        self.state().local_images.insert(
            image.to_string(),
            repo_digests.iter().map(|d| d.to_string()).collect(),
        );
    }

    /// Publish `digest` for `image` in the fake registry.
    pub fn with_registry_digest(&self, image: &str, digest: &str) {
        self.state()
            .registry
            .insert(image.to_string(), digest.to_string());
    }

    pub fn require_credentials(&self, image: &str, username: &str, password: &str) {
        self.state().private.insert(
            image.to_string(),
            (username.to_string(), password.to_string()),
        );
    }

    pub fn fail_listing(&self) {
        self.state().fail_listing = true;
    }

    pub fn fail_pull(&self, image: &str) {
        self.state().failing_pulls.insert(image.to_string());
    }

    /// Make pulls of `image` take `delay` (on the tokio clock) before completing.
    pub fn with_pull_delay(&self, image: &str, delay: Duration) {
        self.state().pull_delays.insert(image.to_string(), delay);
    }

    pub fn fail_remove(&self, name: &str) {
        self.state().failing_removes.insert(name.to_string());
    }

    pub fn container(&self, name: &str) -> Option<ContainerRecord> {
        self.state().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state().containers.keys().cloned().collect()
    }

    /// Mutating calls in order, e.g. `"pull nginx:1.25"`, `"run web"`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    fn check_access(
        state: &FakeState,
        image: &str,
        credential: Option<&RegistryCredential>,
        operation: &'static str,
    ) -> Result<(), RuntimeError> {
        let Some((username, password)) = state.private.get(image) else {
            return Ok(());
        };
        match credential {
            Some(c) if &c.username == username && c.password().expose_secret() == password.as_str() => {
                Ok(())
            }
            _ => Err(RuntimeError::request(operation, "unauthorized")),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let state = self.state();
        if state.fail_listing {
            return Err(RuntimeError::Unavailable {
                reason: "daemon not responding".to_string(),
            });
        }
        Ok(state.containers.values().cloned().collect())
    }

    async fn prune_containers(&self) -> Result<(), RuntimeError> {
        self.state().calls.push("prune containers".to_string());
        Ok(())
    }

    async fn image_repo_digests(&self, image: &str) -> Result<Option<Vec<String>>, RuntimeError> {
        Ok(self.state().local_images.get(image).cloned())
    }

    async fn registry_digest(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
    ) -> Result<Option<String>, RuntimeError> {
        let state = self.state();
        Self::check_access(&state, image, credential, "inspect registry image")?;
        state
            .registry
            .get(image)
            .cloned()
            .map(Some)
            .ok_or_else(|| RuntimeError::request("inspect registry image", "manifest unknown"))
    }

    async fn pull_image(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
    ) -> Result<(), RuntimeError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(format!("pull {image}"));
            state.pull_delays.get(image).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        Self::check_access(&state, image, credential, "pull image")?;
        if state.failing_pulls.contains(image) {
            return Err(RuntimeError::request("pull image", "connection reset"));
        }
        let digest = state
            .registry
            .get(image)
            .cloned()
            .ok_or_else(|| RuntimeError::request("pull image", "manifest unknown"))?;
        let repo_digest = format!("{}@{}", ImageReference::parse(image).name(), digest);
        state.local_images.insert(image.to_string(), vec![repo_digest]);
        Ok(())
    }

    async fn run_container(&self, spec: &DesiredContainer) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("run {}", spec.name()));
        if state.containers.contains_key(spec.name()) {
            return Err(RuntimeError::request("run container", "name already in use"));
        }
        state.containers.insert(
            spec.name().to_string(),
            ContainerRecord {
                name: spec.name().to_string(),
                image: spec.image().to_string(),
                image_id: spec.image().to_string(),
                env: spec.environment().to_vec(),
            },
        );
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<Option<Vec<String>>, RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("remove {name}"));
        if state.failing_removes.contains(name) {
            return Err(RuntimeError::request("remove container", "device busy"));
        }
        Ok(state.containers.remove(name).map(|c| vec![c.image]))
    }

    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("remove image {tag}"));
        state.local_images.remove(tag);
        Ok(())
    }

    async fn prune_images(&self) -> Result<(), RuntimeError> {
        self.state().calls.push("prune images".to_string());
        Ok(())
    }
}

/// Desired-state source with a fixed answer.
pub struct StaticSource {
    desired: Mutex<Option<Vec<DesiredContainer>>>,
}

impl StaticSource {
    pub fn new(desired: Vec<DesiredContainer>) -> Self {
        Self {
            desired: Mutex::new(Some(desired)),
        }
    }

    /// A source whose fetch always fails, like an unreachable server.
    pub fn unreachable() -> Self {
        Self {
            desired: Mutex::new(None),
        }
    }

    pub fn set(&self, desired: Vec<DesiredContainer>) {
        *self.desired.lock().unwrap_or_else(|e| e.into_inner()) = Some(desired);
    }
}

#[async_trait]
impl DesiredStateSource for StaticSource {
    async fn fetch(&self) -> Result<Vec<DesiredContainer>, FetchError> {
        self.desired
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(FetchError::Status { status: 503 })
    }
}
