//! Local and registry image digests, and the staleness rule built on them.

use std::sync::Arc;
use std::time::Duration;

use crate::models::{Digest, ImageReference};
use crate::registry::RegistryCredential;
use crate::runtime::{ContainerRuntime, bounded};

/// How to judge staleness when a digest cannot be resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StalenessPolicy {
    /// Without both digests the image is not stale. A registry outage never
    /// forces updates.
    #[default]
    Conservative,
    /// An unresolved digest counts as a mismatch.
    AssumeStale,
}

impl StalenessPolicy {
    pub fn is_stale(&self, local: Option<&Digest>, registry: Option<&Digest>) -> bool {
        match (local, registry) {
            (Some(local), Some(registry)) => local != registry,
            _ => matches!(self, StalenessPolicy::AssumeStale),
        }
    }
}

/// Resolves image digests through the runtime.
///
/// Every failure (missing image, auth, network, timeout) is logged and
/// reported as `None`; nothing here fails a pass.
#[derive(Clone)]
pub struct ImageDigestResolver {
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Duration,
}

impl ImageDigestResolver {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }

    /// Digest of `image_ref` as currently stored on the host.
    pub async fn local_digest(&self, image_ref: &str) -> Option<Digest> {
        self.local_digest_for(image_ref, image_ref).await
    }

    /// Look up `image` (tag or image id) and pick the repo digest belonging
    /// to `reference`'s repository, falling back to the first one.
    pub async fn local_digest_for(&self, image: &str, reference: &str) -> Option<Digest> {
        let repo_digests = match bounded(
            self.timeout,
            "inspect image",
            self.runtime.image_repo_digests(image),
        )
        .await
        {
            Ok(Some(repo_digests)) => repo_digests,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(image = %image, error = %e, "Failed to inspect local image");
                return None;
            }
        };

        select_repo_digest(&repo_digests, reference)
    }

    /// Manifest digest the registry currently publishes for `image_ref`.
    pub async fn registry_digest(
        &self,
        image_ref: &str,
        credential: Option<&RegistryCredential>,
    ) -> Option<Digest> {
        match bounded(
            self.timeout,
            "inspect registry image",
            self.runtime.registry_digest(image_ref, credential),
        )
        .await
        {
            Ok(digest) => digest.and_then(Digest::new),
            Err(e) => {
                tracing::warn!(image = %image_ref, error = %e, "Registry digest unavailable");
                None
            }
        }
    }
}

fn select_repo_digest(repo_digests: &[String], reference: &str) -> Option<Digest> {
    let name = ImageReference::parse(reference).name();
    repo_digests
        .iter()
        .find(|rd| rd.split_once('@').is_some_and(|(repo, _)| repo == name))
        .or_else(|| repo_digests.first())
        .and_then(|rd| Digest::from_repo_digest(rd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;

    fn digest(s: &str) -> Digest {
        Digest::new(s).unwrap()
    }

    #[test]
    fn test_conservative_policy_needs_both_digests() {
        let a = digest("sha256:aa");
        let b = digest("sha256:bb");
        let policy = StalenessPolicy::Conservative;

        assert!(policy.is_stale(Some(&a), Some(&b)));
        assert!(!policy.is_stale(Some(&a), Some(&a)));
        assert!(!policy.is_stale(None, Some(&b)));
        assert!(!policy.is_stale(Some(&a), None));
        assert!(!policy.is_stale(None, None));
    }

    #[test]
    fn test_assume_stale_policy() {
        let a = digest("sha256:aa");
        let policy = StalenessPolicy::AssumeStale;

        assert!(!policy.is_stale(Some(&a), Some(&a)));
        assert!(policy.is_stale(Some(&a), None));
        assert!(policy.is_stale(None, Some(&a)));
    }

    #[test]
    fn test_select_repo_digest_prefers_matching_repository() {
        let repo_digests = vec![
            "mirror.example.com/web@sha256:11".to_string(),
            "registry.example.com/web@sha256:22".to_string(),
        ];
        assert_eq!(
            select_repo_digest(&repo_digests, "registry.example.com/web:latest"),
            Some(digest("sha256:22"))
        );
        assert_eq!(
            select_repo_digest(&repo_digests, "sha256:deadbeef"),
            Some(digest("sha256:11"))
        );
        assert_eq!(select_repo_digest(&[], "web"), None);
    }

    #[tokio::test]
    async fn test_local_digest() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.with_local_image("nginx:1.25", &["nginx@sha256:abc"]);
        runtime.with_local_image("scratch:dev", &[]);
        let resolver = ImageDigestResolver::new(runtime, Duration::from_secs(5));

        assert_eq!(
            resolver.local_digest("nginx:1.25").await,
            Some(digest("sha256:abc"))
        );
        assert_eq!(resolver.local_digest("scratch:dev").await, None);
        assert_eq!(resolver.local_digest("missing:1").await, None);
    }

    #[tokio::test]
    async fn test_registry_digest_errors_are_none() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.with_registry_digest("nginx:1.25", "sha256:abc");
        runtime.with_registry_digest("reg.example.com/private:1", "sha256:def");
        runtime.require_credentials("reg.example.com/private:1", "u", "p");
        let resolver = ImageDigestResolver::new(runtime, Duration::from_secs(5));

        assert_eq!(
            resolver.registry_digest("nginx:1.25", None).await,
            Some(digest("sha256:abc"))
        );
        assert_eq!(resolver.registry_digest("nginx:unknown", None).await, None);
        assert_eq!(
            resolver
                .registry_digest("reg.example.com/private:1", None)
                .await,
            None
        );

        let cred = RegistryCredential::new("reg.example.com", "u", "p");
        assert_eq!(
            resolver
                .registry_digest("reg.example.com/private:1", Some(&cred))
                .await,
            Some(digest("sha256:def"))
        );
    }
}
