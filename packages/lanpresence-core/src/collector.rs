//! HTTP client for pushing presence reports to a remote collector.

use crate::scanner::PresenceReport;
use anyhow::{Context, Result};
use std::time::Duration;

const DEVICE_SESSIONS_ENDPOINT: &str = "collector/api/v1/device-sessions/";

#[derive(Debug, Clone)]
pub struct CollectorClient {
    base_url: String,
    client: reqwest::Client,
}

impl CollectorClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Push one cycle's reports. The batch is all-or-nothing on the
    /// collector side, so any non-success status means nothing was
    /// ingested.
    pub async fn push_reports(&self, reports: &[PresenceReport]) -> Result<()> {
        let url = format!("{}/{}", self.base_url, DEVICE_SESSIONS_ENDPOINT);

        tracing::info!("Uploading {} report(s) to {}", reports.len(), url);
        let resp = self
            .client
            .post(&url)
            .json(reports)
            .send()
            .await
            .context("failed to reach collector")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            tracing::error!("Collector rejected batch: {} - {}", status, body);
            return Err(anyhow::anyhow!("collector returned {}: {}", status, body));
        }

        tracing::debug!("Batch accepted by collector");
        Ok(())
    }
}
