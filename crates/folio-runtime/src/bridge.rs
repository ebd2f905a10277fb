//! Fetch relay data types.
//!
//! Scripts never perform I/O. `fetch()` queues a [`FetchRequest`] with the
//! host; the await loop hands it to a [`FetchBridgeService`] on the calling
//! task and injects the [`FetchResponse`] (or failure) back into the engine.
//!
//! [`FetchBridgeService`]: crate::services::FetchBridgeService

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::services::RuntimeServices;

/// A network intent captured from script code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Assigned by the host when the request is queued.
    #[serde(default)]
    pub id: u64,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl FetchRequest {
    pub fn options(&self) -> FetchOptions {
        FetchOptions {
            method: self.method.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Request options handed to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOptions {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

/// What the bridge returns for a completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub text: String,
    /// Final URL after redirects, when known.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl FetchResponse {
    pub fn new(status: u16, text: impl Into<String>) -> Self {
        Self {
            status,
            status_text: String::new(),
            text: text.into(),
            url: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Mirrors `Response.ok` on the script side.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Result of relaying one request, ready to be injected into the engine.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FetchOutcome {
    Completed(FetchResponse),
    Failed(String),
}

/// Perform one queued request with the configured bridge.
pub(crate) async fn perform(services: &RuntimeServices, request: &FetchRequest) -> FetchOutcome {
    let Some(bridge) = services.fetch.as_ref() else {
        return FetchOutcome::Failed(format!("no fetch bridge is configured for {}", request.url));
    };

    tracing::debug!("[fetch:{}] {} {}", request.id, request.method, request.url);
    match bridge.fetch(&request.url, &request.options()).await {
        Ok(response) => {
            tracing::trace!("[fetch:{}] status {}", request.id, response.status);
            FetchOutcome::Completed(response)
        }
        Err(err) => {
            tracing::debug!("[fetch:{}] failed: {}", request.id, err);
            FetchOutcome::Failed(err.to_string())
        }
    }
}

/// Relay every request concurrently, keeping their ids.
pub(crate) async fn perform_all(
    services: &RuntimeServices,
    requests: Vec<FetchRequest>,
) -> Vec<(u64, FetchOutcome)> {
    let pending = requests.iter().map(|request| async move {
        (request.id, perform(services, request).await)
    });
    futures::future::join_all(pending).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_script_json() {
        let request: FetchRequest =
            serde_json::from_str(r#"{"url":"https://a.test/x","headers":{"accept":"text/html"},"body":null}"#).unwrap();

        assert_eq!(request.id, 0);
        assert_eq!(request.method, "GET");
        assert_eq!(request.headers.get("accept").map(String::as_str), Some("text/html"));
        assert_eq!(request.options().body, None);
    }

    #[test]
    fn test_response_wire_shape() {
        let response = FetchResponse::new(404, "missing").with_header("Content-Type", "text/plain");
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["statusText"], "");
        assert_eq!(json["headers"]["content-type"], "text/plain");
        assert!(!response.is_ok());
        assert!(FetchResponse::new(204, "").is_ok());
        assert!(!FetchResponse::new(300, "").is_ok());
    }

    #[tokio::test]
    async fn test_perform_without_bridge_fails() {
        let request = FetchRequest {
            id: 3,
            url: "https://a.test/".to_string(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
        };

        match perform(&RuntimeServices::default(), &request).await {
            FetchOutcome::Failed(message) => assert!(message.contains("no fetch bridge")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
