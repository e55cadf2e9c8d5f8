//! Vendor artifact download.

use std::collections::HashMap;
use std::time::Duration;

use kon_core::{KonError, KonResult};
use tracing::debug;

pub const DOWNLOAD_TIMEOUT_ENV: &str = "KON_DOWNLOAD_TIMEOUT_SECS";

#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Whole body of `url`. Failures are `ToolDownloadFailed` for `tool`.
    async fn fetch(&self, tool: &str, url: &str) -> KonResult<Vec<u8>>;
}

/// HTTPS download with a request timeout. Non-2xx responses are failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> KonResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KonError::ToolDownloadFailed { tool: "<client>".into(), message: format!("building http client: {}", e) })?;
        Ok(Self { client })
    }

    /// Timeout from `KON_DOWNLOAD_TIMEOUT_SECS` (120).
    pub fn from_env() -> KonResult<Self> {
        let secs = std::env::var(DOWNLOAD_TIMEOUT_ENV).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(120);
        Self::new(Duration::from_secs(secs))
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, tool: &str, url: &str) -> KonResult<Vec<u8>> {
        let fail = |message: String| KonError::ToolDownloadFailed { tool: tool.to_string(), message };
        let resp = self.client.get(url).send().await.map_err(|e| fail(format!("GET {}: {}", url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(fail(format!("GET {}: HTTP {}", url, status)));
        }
        let body = resp.bytes().await.map_err(|e| fail(format!("reading {}: {}", url, e)))?;
        debug!(tool, url, bytes = body.len(), "downloaded");
        Ok(body.to_vec())
    }
}

/// Fixed url → body map, for offline installs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticFetcher {
    items: HashMap<String, Vec<u8>>,
}

impl StaticFetcher {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.items.insert(url.to_string(), body.into());
        self
    }
}

#[async_trait::async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, tool: &str, url: &str) -> KonResult<Vec<u8>> {
        self.items
            .get(url)
            .cloned()
            .ok_or_else(|| KonError::ToolDownloadFailed { tool: tool.to_string(), message: format!("GET {}: not available offline", url) })
    }
}
