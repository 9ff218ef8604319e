//! HTTP(S) release downloads.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::AcquisitionError;
use super::Fetch;

/// User agent sent with release downloads.
const USER_AGENT: &str = concat!("wayafk-supervisor/", env!("CARGO_PKG_VERSION"));

/// Downloads release assets with reqwest.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with a bounded request timeout.
    pub fn new() -> Result<Self, AcquisitionError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AcquisitionError::Download(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, AcquisitionError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AcquisitionError::Download(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AcquisitionError::Download(format!(
                "{url} returned {status}"
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AcquisitionError::Download(e.to_string()))?;

        debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }
}
