use std::{fmt::Debug, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Issues one request to the remote JSON service.
///
/// Implementations never fail past this boundary: transport errors, bad
/// statuses and unparseable bodies all come back as `None`.
#[async_trait]
pub trait FetchClient: Send + Sync + Debug {
    async fn fetch(&self, url: &str) -> Option<Value>;
}

#[async_trait]
impl<C: FetchClient + ?Sized> FetchClient for Arc<C> {
    async fn fetch(&self, url: &str) -> Option<Value> {
        (**self).fetch(url).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetchClient {
    api_key: Option<String>,
    http: Client,
}

impl HttpFetchClient {
    pub fn new(timeout: Duration, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { api_key, http })
    }

    async fn fetch_json(&self, url: &str) -> Result<Value> {
        let mut request = self.http.get(url);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.as_str())]);
        }

        let res = request
            .send()
            .await
            .with_context(|| format!("Failed to send request to {url}"))?;

        let status = res.status();
        let body = res
            .text()
            .await
            .with_context(|| format!("Failed to read response body from {url}"))?;

        if !status.is_success() {
            return Err(anyhow!(
                "Request to {} failed with status {}: {}",
                url,
                status,
                truncate_body(&body),
            ));
        }

        serde_json::from_str(&body).with_context(|| format!("Failed to parse JSON from {url}"))
    }
}

#[async_trait]
impl FetchClient for HttpFetchClient {
    async fn fetch(&self, url: &str) -> Option<Value> {
        match self.fetch_json(url).await {
            Ok(payload) => {
                debug!(url, "fetched payload");
                Some(payload)
            }
            Err(err) => {
                warn!(url, error = %format!("{err:#}"), "fetch failed");
                None
            }
        }
    }
}

/// Caps the number of requests in flight across every pipeline sharing this client.
#[derive(Debug)]
pub struct LimitedFetchClient<C> {
    inner: C,
    permits: Semaphore,
    max_in_flight: usize,
}

impl<C: FetchClient> LimitedFetchClient<C> {
    /// A limit of zero is treated as one.
    pub fn new(inner: C, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            inner,
            permits: Semaphore::new(max_in_flight),
            max_in_flight,
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl<C: FetchClient> FetchClient for LimitedFetchClient<C> {
    async fn fetch(&self, url: &str) -> Option<Value> {
        // The semaphore is never closed, so acquire only fails if that changes.
        let _permit = self.permits.acquire().await.ok()?;
        self.inner.fetch(url).await
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}
