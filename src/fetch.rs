//! HTTP access to the listing page, monthly update PDFs, and policy PDFs.

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use policy_harvest_core::error::HarvestError;
use policy_harvest_core::throttle::HealthProbe;

use crate::config::SourceConfig;

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, HarvestError> {
        let network = |message: String| HarvestError::Network {
            url: url.to_string(),
            message,
        };
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(network(format!("HTTP {}", status)));
        }
        Ok(resp)
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, HarvestError> {
        let started = Instant::now();
        let bytes = self
            .get(url)
            .await?
            .bytes()
            .await
            .map_err(|e| HarvestError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        debug!(url, bytes = bytes.len(), elapsed_ms = started.elapsed().as_millis() as u64, "fetched");
        Ok(bytes.to_vec())
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, HarvestError> {
        self.get(url)
            .await?
            .text()
            .await
            .map_err(|e| HarvestError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })
    }
}

/// Times a GET against a dependent service.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self) -> Result<Duration> {
        let started = Instant::now();
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("health probe returned HTTP {}", resp.status());
        }
        Ok(started.elapsed())
    }
}
