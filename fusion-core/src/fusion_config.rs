//! Fusion config client
//!
//! Fetches the deployment document that lists which functions take part in a
//! fusion. The document is a JSON array of objects with an `entry` key naming
//! the function; everything else in an entry is ignored.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::config::FusionConfigSource;
use crate::error::FetchError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FusionEntry {
    pub entry: String,
}

#[derive(Debug, Clone)]
pub struct FusionConfigClient {
    client: Client,
    max_retries: usize,
    retry_delay_ms: u64,
}

impl FusionConfigClient {
    pub fn new(config: &FusionConfigSource) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    /// Fetch the entries published at `url`, retrying with backoff.
    pub async fn fetch_entries(&self, url: &str) -> Result<Vec<FusionEntry>, FetchError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries);

        match Retry::spawn(retry_strategy, || self.fetch_once(url)).await {
            Ok(entries) => {
                tracing::debug!(url, functions = entries.len(), "Fetched fusion config");
                Ok(entries)
            }
            Err(e) => {
                tracing::error!(
                    attempts = self.max_retries,
                    error = %e,
                    url,
                    "All fusion config fetch attempts failed"
                );
                Err(FetchError::RetryExhausted {
                    attempts: self.max_retries,
                })
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<FusionEntry>, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), url, "Fusion config source returned an error");
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<Vec<FusionEntry>>().await?)
    }
}

// ============================================================================
// TESTS
// ============================================================================
