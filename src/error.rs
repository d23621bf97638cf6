//! Error types for the agent.
//!
//! Each boundary gets its own error: configuration, the container runtime,
//! the desired-state fetch, a single lifecycle action, and a whole pass.
//! The reconciliation decision itself is infallible and has no error type.

use std::time::Duration;

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors returned by a container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime could not be reached at all.
    #[error("Container runtime not available: {reason}")]
    Unavailable { reason: String },

    /// A call did not complete within the configured bound.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The runtime rejected the request.
    #[error("{operation} failed: {reason}")]
    Request {
        operation: &'static str,
        reason: String,
    },

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

impl RuntimeError {
    pub(crate) fn request(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Request {
            operation,
            reason: reason.into(),
        }
    }
}

/// Errors fetching the desired state from the management server.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Management server returned status {status}")]
    Status { status: u16 },

    #[error("Desired state is not a JSON array: {0}")]
    Body(String),
}

/// Failure of one create, update or remove action.
///
/// These are reported and counted by the pass; they never abort it.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("No credential in the auth bundle for '{name}' could authenticate against {registry}")]
    AuthenticationFailed { name: String, registry: String },

    #[error("Failed to pull image '{image}': {source}")]
    PullFailed {
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Failed to start container '{name}': {source}")]
    StartFailed {
        name: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Failed to remove container '{name}': {source}")]
    RemoveFailed {
        name: String,
        #[source]
        source: RuntimeError,
    },
}

/// Errors that abort a whole reconciliation pass.
#[derive(Debug, Error)]
pub enum PassError {
    /// No partial inventory is trusted, so nothing is applied.
    #[error("Failed to list containers, pass aborted: {0}")]
    Inventory(#[source] RuntimeError),
}
