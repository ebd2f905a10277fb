//! reqwest-backed fetch bridge.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use folio_runtime::{FetchBridgeService, FetchError, FetchOptions, FetchResponse};

use crate::config::HttpConfig;

pub struct HttpFetchBridge {
    client: reqwest::Client,
    default_headers: BTreeMap<String, String>,
}

impl HttpFetchBridge {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            default_headers: config.default_headers.clone(),
        })
    }
}

/// Configured defaults first, then the plugin's headers, compared
/// case-insensitively.
fn merged_headers(defaults: &BTreeMap<String, String>, requested: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = defaults
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect();
    for (name, value) in requested {
        headers.insert(name.to_ascii_lowercase(), value.clone());
    }
    headers
}

#[async_trait::async_trait]
impl FetchBridgeService for HttpFetchBridge {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse, FetchError> {
        let method = reqwest::Method::from_bytes(options.method.as_bytes())
            .map_err(|_| FetchError::InvalidRequest(format!("unsupported method {}", options.method)))?;

        let mut req_builder = self.client.request(method, url);
        for (name, value) in merged_headers(&self.default_headers, &options.headers) {
            req_builder = req_builder.header(name, value);
        }
        if let Some(body) = &options.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::TimedOut
            } else if e.is_builder() {
                FetchError::InvalidRequest(e.to_string())
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let final_url = response.url().to_string();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(format!("Failed to read response body: {}", e)))?;

        tracing::debug!("[http] {} {} -> {}", options.method, url, status.as_u16());

        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            text,
            url: Some(final_url),
            headers,
        })
    }
}
