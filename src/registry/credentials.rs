//! Registry credentials decoded from per-container auth bundles.
//!
//! An auth bundle is a Docker config document:
//!
//! ```json
//! {"auths": {"reg.example.com": {"auth": "<base64 of user:password>"}}}
//! ```
//!
//! Security properties:
//! - Credentials live only inside a [`CredentialScope`] for one pull/lookup
//! - Passwords are held as `SecretString` and zeroized when the scope drops
//! - Only one scope exists at a time; the store serializes every
//!   credential-bearing sequence
//! - Nothing is written to disk and nothing is logged but the registry host

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use secrecy::zeroize::Zeroize;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::{Mutex, MutexGuard};

use crate::models::{ImageReference, normalize_registry_host};
use crate::runtime::{ContainerRuntime, bounded};

/// Username and password for one registry host.
pub struct RegistryCredential {
    pub registry_host: String,
    pub username: String,
    password: SecretString,
}

impl RegistryCredential {
    pub fn new(
        registry_host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            registry_host: registry_host.into(),
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }

    /// Whether this credential is for `registry_host` (already normalised).
    pub fn serves(&self, registry_host: &str) -> bool {
        normalize_registry_host(&self.registry_host) == registry_host
    }
}

impl fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("registry_host", &self.registry_host)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Deserialize)]
struct AuthBundle {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
}

#[derive(Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
}

/// Decode an auth bundle.
///
/// Never fails: malformed JSON yields no credentials, and entries without a
/// usable `auth` field are skipped.
pub fn parse_auth_bundle(auth_blob: &str) -> Vec<RegistryCredential> {
    let bundle: AuthBundle = match serde_json::from_str(auth_blob) {
        Ok(bundle) => bundle,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed registry auth bundle");
            return Vec::new();
        }
    };

    bundle
        .auths
        .into_iter()
        .filter_map(|(host, entry)| {
            let encoded = entry.auth?;
            let credential = decode_basic_auth(&host, encoded.trim());
            if credential.is_none() {
                tracing::debug!(registry = %host, "Skipping unusable registry auth entry");
            }
            credential
        })
        .collect()
}

/// Decode base64 `user:password`, splitting on the first colon only.
fn decode_basic_auth(host: &str, encoded: &str) -> Option<RegistryCredential> {
    let mut decoded = STANDARD.decode(encoded).ok()?;
    let credential = std::str::from_utf8(&decoded)
        .ok()
        .and_then(|text| text.split_once(':'))
        .filter(|(username, _)| !username.is_empty())
        .map(|(username, password)| RegistryCredential::new(host, username, password));
    decoded.zeroize();
    credential
}

/// Result of authenticating an auth bundle against the image's registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// The container declares no credentials; pull anonymously.
    NotRequired,
    /// A credential from the bundle was accepted by the registry.
    Authenticated { registry: String },
    /// Credentials were supplied but none was accepted.
    Failed,
}

impl LoginOutcome {
    pub fn may_proceed(&self) -> bool {
        !matches!(self, LoginOutcome::Failed)
    }
}

/// Shared credential context.
///
/// The engine's credential state is global, so every login/pull or
/// authenticated digest lookup runs inside a scope acquired here, one at a
/// time.
#[derive(Default)]
pub struct RegistryCredentialStore {
    lock: Mutex<()>,
}

impl RegistryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of the credential context and load `auth` into it.
    pub async fn acquire(&self, auth: Option<&SecretString>) -> CredentialScope<'_> {
        let guard = self.lock.lock().await;
        let credentials = auth
            .map(|blob| parse_auth_bundle(blob.expose_secret()))
            .unwrap_or_default();

        CredentialScope {
            _guard: guard,
            credentials,
            active: None,
        }
    }
}

/// Credentials held for the duration of one pull or lookup.
///
/// Dropping the scope erases the credentials and releases the store, on
/// every exit path.
pub struct CredentialScope<'a> {
    _guard: MutexGuard<'a, ()>,
    credentials: Vec<RegistryCredential>,
    active: Option<usize>,
}

impl CredentialScope<'_> {
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn credentials(&self) -> &[RegistryCredential] {
        &self.credentials
    }

    /// Credential accepted by the last successful [`login`](Self::login).
    pub fn active(&self) -> Option<&RegistryCredential> {
        self.active.and_then(|i| self.credentials.get(i))
    }

    /// Credentials in the order they are tried for `image`: those for the
    /// image's registry first, then the rest of the bundle.
    pub fn candidates(&self, image: &str) -> Vec<&RegistryCredential> {
        self.candidate_order(image)
            .into_iter()
            .map(|i| &self.credentials[i])
            .collect()
    }

    fn candidate_order(&self, image: &str) -> Vec<usize> {
        let host = ImageReference::parse(image).registry_host();
        let mut order: Vec<usize> = (0..self.credentials.len()).collect();
        order.sort_by_key(|&i| !self.credentials[i].serves(&host));
        order
    }

    /// Authenticate against the registry serving `image`.
    ///
    /// Credentials for the image's registry are tried first, then the rest of
    /// the bundle. A rejected credential is logged and the next one tried.
    pub async fn login(
        &mut self,
        runtime: &dyn ContainerRuntime,
        image: &str,
        timeout: Duration,
    ) -> LoginOutcome {
        if self.credentials.is_empty() {
            return LoginOutcome::NotRequired;
        }

        for i in self.candidate_order(image) {
            let credential = &self.credentials[i];
            match bounded(
                timeout,
                "registry login",
                runtime.registry_digest(image, Some(credential)),
            )
            .await
            {
                Ok(_) => {
                    tracing::debug!(registry = %credential.registry_host, "Registry login succeeded");
                    self.active = Some(i);
                    return LoginOutcome::Authenticated {
                        registry: credential.registry_host.clone(),
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        registry = %credential.registry_host,
                        error = %e,
                        "Registry login failed"
                    );
                }
            }
        }

        LoginOutcome::Failed
    }
}

impl Drop for CredentialScope<'_> {
    fn drop(&mut self) {
        if !self.credentials.is_empty() {
            // SecretString zeroizes each password as it drops.
            self.credentials.clear();
            tracing::trace!("Registry credentials released");
        }
    }
}
