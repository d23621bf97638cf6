//! Desired state from the management server.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CACHE_CONTROL, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::config::ManagementConfig;
use crate::error::FetchError;
use crate::models::DesiredContainer;

const USER_AGENT: &str = "kapellmeister-agent";

/// Where the desired container list comes from.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<DesiredContainer>, FetchError>;
}

/// Fetches `GET {url}/{project}/{channel}/` with token auth.
pub struct ManagementClient {
    client: reqwest::Client,
    url: String,
    key: SecretString,
}

impl ManagementClient {
    pub fn new(config: &ManagementConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            url: config.desired_state_url(),
            key: config.key.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if let Ok(mut token) =
            HeaderValue::from_str(&format!("Token {}", self.key.expose_secret()))
        {
            token.set_sensitive(true);
            headers.insert(AUTHORIZATION, token);
        } else {
            tracing::warn!("MANAGEMENT_KEY contains characters not allowed in a header");
        }
        headers
    }
}

#[async_trait]
impl DesiredStateSource for ManagementClient {
    async fn fetch(&self) -> Result<Vec<DesiredContainer>, FetchError> {
        tracing::debug!(url = %self.url, "Fetching desired state");

        let response = self
            .client
            .get(&self.url)
            .headers(self.headers())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let body: Value = response.json().await?;
        parse_desired_state(body)
    }
}

/// Parse the server's JSON array, skipping entries that do not parse or are invalid.
pub fn parse_desired_state(body: Value) -> Result<Vec<DesiredContainer>, FetchError> {
    let Value::Array(entries) = body else {
        return Err(FetchError::Body(format!("got {}", json_kind(&body))));
    };

    let mut desired = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let container: DesiredContainer = match serde_json::from_value(entry) {
            Ok(container) => container,
            Err(e) => {
                tracing::warn!(index, error = %e, "Skipping malformed desired container");
                continue;
            }
        };
        if let Err(reason) = container.validate() {
            tracing::warn!(index, slug = %container.slug, reason, "Skipping invalid desired container");
            continue;
        }
        desired.push(container);
    }

    Ok(desired)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
