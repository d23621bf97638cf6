//! Data model shared by the reconciliation components.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

/// Runtime parameters of a desired container.
///
/// Only `name`, `image` and `environment` are interpreted by the engine; the
/// rest is handed to the runtime when the container is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerParameters {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub cpu_period: Option<i64>,
    #[serde(default)]
    pub cpu_quota: Option<i64>,
    #[serde(default)]
    pub nano_cpus: Option<i64>,
    #[serde(default)]
    pub devices: Option<Vec<String>>,
    #[serde(default)]
    pub tmpfs: Option<HashMap<String, String>>,
    /// Either a list of bind strings or a map `host -> {bind, mode}`.
    #[serde(default)]
    pub volumes: Option<serde_json::Value>,
    /// Map of `"<port>/<proto>"` to a host binding.
    #[serde(default)]
    pub ports: Option<serde_json::Value>,
    #[serde(default)]
    pub privileged: Option<bool>,
    #[serde(default)]
    pub cap_add: Option<Vec<String>>,
}

/// One entry of the desired-state list served by the management server.
#[derive(Clone, Deserialize)]
pub struct DesiredContainer {
    /// Stable logical identifier, independent of the container name.
    pub slug: String,
    /// Docker-config JSON with registry credentials, if any.
    #[serde(default, deserialize_with = "deserialize_auth")]
    pub auth: Option<SecretString>,
    /// Digest the server last saw for this container. Informational only.
    #[serde(default)]
    pub digest: Option<String>,
    pub parameters: ContainerParameters,
}

fn deserialize_auth<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.trim().is_empty()).map(SecretString::from))
}

impl DesiredContainer {
    pub fn new(slug: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            auth: None,
            digest: None,
            parameters: ContainerParameters {
                name: name.into(),
                image: image.into(),
                ..Default::default()
            },
        }
    }

    pub fn with_env(mut self, env: &[&str]) -> Self {
        self.parameters.environment = env.iter().map(|e| (*e).to_string()).collect();
        self
    }

    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        let auth = auth.into();
        self.auth = (!auth.trim().is_empty()).then(|| SecretString::from(auth));
        self
    }

    /// Runtime container name.
    pub fn name(&self) -> &str {
        &self.parameters.name
    }

    /// Image reference as declared.
    pub fn image(&self) -> &str {
        &self.parameters.image
    }

    pub fn environment(&self) -> &[String] {
        &self.parameters.environment
    }

    /// Check the structural invariants: non-empty slug, name and image.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.slug.trim().is_empty() {
            return Err("slug is empty");
        }
        if self.name().trim().is_empty() {
            return Err("name is empty");
        }
        if self.image().trim().is_empty() {
            return Err("image is empty");
        }
        Ok(())
    }
}

impl fmt::Debug for DesiredContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesiredContainer")
            .field("slug", &self.slug)
            .field("name", &self.parameters.name)
            .field("image", &self.parameters.image)
            .field("environment", &self.parameters.environment.len())
            .field("auth", &self.auth.is_some())
            .finish()
    }
}

/// Content digest of an image manifest, e.g. `sha256:4b1c...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(String);

impl Digest {
    pub fn new(digest: impl Into<String>) -> Option<Self> {
        let digest = digest.into();
        let (algorithm, hex) = digest.split_once(':')?;
        if algorithm.is_empty() || hex.is_empty() {
            return None;
        }
        Some(Self(digest))
    }

    /// Extract the digest from a repo-digest annotation (`name@sha256:...`).
    pub fn from_repo_digest(repo_digest: &str) -> Option<Self> {
        let (_, digest) = repo_digest.split_once('@')?;
        Self::new(digest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry host Docker uses when an image reference names none.
pub const DOCKER_HUB: &str = "docker.io";

/// Parsed `[registry/]repository[:tag][@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Self {
        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (reference, None),
        };

        // A ':' after the last '/' separates the tag; one before it is a registry port.
        let (name, tag) = match rest.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, Some(tag.to_string())),
            _ => (rest, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), remainder.to_string())
            }
            _ => (None, name.to_string()),
        };

        Self {
            registry,
            repository,
            tag,
            digest,
        }
    }

    /// Registry host serving this image, normalised.
    pub fn registry_host(&self) -> String {
        self.registry
            .as_deref()
            .map(normalize_registry_host)
            .unwrap_or_else(|| DOCKER_HUB.to_string())
    }

    /// Image name without tag or digest, as the engine expects for a pull.
    pub fn name(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{registry}/{}", self.repository),
            None => self.repository.clone(),
        }
    }

    /// Digest or tag to pull. A pinned digest wins over the tag; an empty tag
    /// would pull every tag, so default to `latest`.
    pub fn pull_tag(&self) -> String {
        self.digest
            .clone()
            .or_else(|| self.tag.clone())
            .unwrap_or_else(|| "latest".to_string())
    }
}

/// Normalise a registry key from a Docker config (`https://index.docker.io/v1/` etc.).
pub fn normalize_registry_host(host: &str) -> String {
    let host = host
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host).to_ascii_lowercase();
    match host.as_str() {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
            DOCKER_HUB.to_string()
        }
        _ => host,
    }
}

/// A container currently present on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContainerSnapshot {
    pub name: String,
    /// Image reference the container was created from.
    pub image_tag: String,
    pub env: HashSet<String>,
    /// Repo digest of the image the container runs, if the runtime has one.
    pub local_image_digest: Option<Digest>,
}

/// Snapshot of the host keyed by container name.
pub type Inventory = BTreeMap<String, RuntimeContainerSnapshot>;

/// Registry digests resolved for this pass, keyed by image reference.
pub type RegistryDigests = HashMap<String, Option<Digest>>;

/// Actions computed by one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationDecision {
    pub create: Vec<DesiredContainer>,
    pub update: Vec<DesiredContainer>,
    pub remove: Vec<String>,
}

impl ReconciliationDecision {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }

    pub fn create_names(&self) -> Vec<&str> {
        self.create.iter().map(DesiredContainer::name).collect()
    }

    pub fn update_names(&self) -> Vec<&str> {
        self.update.iter().map(DesiredContainer::name).collect()
    }
}
