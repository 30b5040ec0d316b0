//! Access to the environment daemon's raw data dictionary.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Errors from querying the environment daemon.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("environment daemon request failed: {0}")]
    Transport(String),
    #[error("environment daemon returned invalid data: {0}")]
    InvalidData(String),
}

/// Source of raw environment data.
///
/// The production implementation polls the environment daemon over HTTP;
/// tests substitute a scripted source.
#[async_trait]
pub trait EnvironmentSource: Send + Sync {
    /// Fetches the current data dictionary:
    /// `{<sensor>: {"parameters": {<parameter>: {"latest": .., "unsafe": .., "updated": ".."}}}}`.
    async fn query(&self) -> Result<Value, EnvironmentError>;
}

/// Default request timeout for environment polls.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// HTTP implementation of [`EnvironmentSource`].
pub struct HttpEnvironmentSource {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl HttpEnvironmentSource {
    /// Creates a source polling the given base URL.
    pub fn new(url: &str) -> Result<Self, EnvironmentError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| EnvironmentError::InvalidData(format!("bad URL '{url}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| EnvironmentError::Transport(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl EnvironmentSource for HttpEnvironmentSource {
    async fn query(&self) -> Result<Value, EnvironmentError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| EnvironmentError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| EnvironmentError::Transport(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| EnvironmentError::InvalidData(e.to_string()))
    }
}
