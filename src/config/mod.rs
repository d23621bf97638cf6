//! Configuration for the agent.
//!
//! Settings come from environment variables, after an optional `.env` file
//! has been loaded by the binary. A variable that is set but does not parse
//! is an error; only unset variables fall back to defaults.

mod helpers;

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::registry::StalenessPolicy;

use self::helpers::{
    Lookup, optional_env, parse_bool_env, parse_secs_env, process_env, required_env,
};

pub const DEFAULT_AGENT_NAME: &str = "kapellmeister-agent";

/// Main configuration for the agent.
#[derive(Debug, Clone)]
pub struct Config {
    pub management: ManagementConfig,
    pub agent: AgentConfig,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            management: ManagementConfig::resolve(lookup)?,
            agent: AgentConfig::resolve(lookup)?,
            log_format: LogFormat::resolve(lookup)?,
        })
    }
}

/// Where the desired state is fetched from.
#[derive(Debug, Clone)]
pub struct ManagementConfig {
    /// Base URL of the management server.
    pub url: String,
    pub project: String,
    pub channel: String,
    /// API token, sent as `Authorization: Token <key>`.
    pub key: SecretString,
    /// Bound on the whole desired-state request.
    pub timeout: Duration,
}

impl ManagementConfig {
    pub(crate) fn resolve(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let url = required_env(
            lookup,
            "MANAGEMENT_URL",
            "Set it to the management server's base URL.",
        )?;
        match url::Url::parse(&url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => {
                return Err(ConfigError::InvalidValue {
                    key: "MANAGEMENT_URL".to_string(),
                    message: format!("unsupported scheme '{}'", parsed.scheme()),
                });
            }
            Err(e) => {
                return Err(ConfigError::InvalidValue {
                    key: "MANAGEMENT_URL".to_string(),
                    message: e.to_string(),
                });
            }
        }

        Ok(Self {
            url,
            project: required_env(lookup, "MANAGEMENT_PROJECT", "Set it to the project slug.")?,
            channel: required_env(lookup, "MANAGEMENT_CHANNEL", "Set it to the channel slug.")?,
            key: SecretString::from(required_env(
                lookup,
                "MANAGEMENT_KEY",
                "Set it to the agent's API token.",
            )?),
            timeout: Duration::from_secs(parse_secs_env(lookup, "HTTP_TIMEOUT_SECS", 60)?),
        })
    }

    /// `{url}/{project}/{channel}/`
    pub fn desired_state_url(&self) -> String {
        format!(
            "{}/{}/{}/",
            self.url.trim_end_matches('/'),
            self.project,
            self.channel
        )
    }
}

/// Reconciliation loop settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// The agent's own container name, never reconciled.
    pub name: String,
    /// Sleep between passes.
    pub interval: Duration,
    /// Bound on each container runtime or registry call.
    pub runtime_timeout: Duration,
    /// Bound on a whole image pull, which streams for as long as the
    /// download takes.
    pub pull_timeout: Duration,
    pub staleness: StalenessPolicy,
    /// Prune stopped containers before each snapshot.
    pub prune_stopped: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_AGENT_NAME.to_string(),
            interval: Duration::from_secs(60),
            runtime_timeout: Duration::from_secs(60),
            pull_timeout: Duration::from_secs(30 * 60),
            staleness: StalenessPolicy::Conservative,
            prune_stopped: true,
        }
    }
}

impl AgentConfig {
    pub(crate) fn resolve(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let staleness = if parse_bool_env(lookup, "STALE_ON_UNKNOWN_DIGEST", false)? {
            StalenessPolicy::AssumeStale
        } else {
            StalenessPolicy::Conservative
        };

        Ok(Self {
            name: optional_env(lookup, "AGENT_NAME").unwrap_or(defaults.name),
            interval: Duration::from_secs(parse_secs_env(
                lookup,
                "RECONCILE_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
            runtime_timeout: Duration::from_secs(parse_secs_env(
                lookup,
                "RUNTIME_TIMEOUT_SECS",
                defaults.runtime_timeout.as_secs(),
            )?),
            pull_timeout: Duration::from_secs(parse_secs_env(
                lookup,
                "PULL_TIMEOUT_SECS",
                defaults.pull_timeout.as_secs(),
            )?),
            staleness,
            prune_stopped: parse_bool_env(
                lookup,
                "PRUNE_STOPPED_CONTAINERS",
                defaults.prune_stopped,
            )?,
        })
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn resolve(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        match optional_env(lookup, "LOG_FORMAT").as_deref() {
            None => Ok(Self::default()),
            Some(v) if v.eq_ignore_ascii_case("text") => Ok(Self::Text),
            Some(v) if v.eq_ignore_ascii_case("json") => Ok(Self::Json),
            Some(v) => Err(ConfigError::InvalidValue {
                key: "LOG_FORMAT".to_string(),
                message: format!("must be 'text' or 'json', got '{v}'"),
            }),
        }
    }
}
