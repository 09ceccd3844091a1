//! HTTP client for the runtime's model-management endpoints

use crate::error::{RuntimeError, RuntimeResult};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Timeout for the short control requests (version, tags, delete)
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Optional detail block the runtime reports per model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization_level: Option<String>,
}

/// A model the runtime has on disk, as listed by `/api/tags`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub details: Option<ModelDetails>,
}

impl InstalledModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            modified_at: None,
            digest: String::new(),
            details: None,
        }
    }

    pub fn parameter_size(&self) -> Option<&str> {
        self.details
            .as_ref()
            .and_then(|d| d.parameter_size.as_deref())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<InstalledModel>,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(default)]
    version: String,
}

/// Body shared by `/api/pull` and `/api/delete`
#[derive(Debug, Serialize)]
pub(crate) struct ModelNameRequest<'a> {
    pub name: &'a str,
}

/// Client for the runtime's control surface
#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> RuntimeResult<Self> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(RuntimeError::Config("Runtime base URL is required".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /api/version`
    pub async fn version(&self) -> RuntimeResult<String> {
        let response = self
            .client
            .get(format!("{}/api/version", self.base_url))
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: VersionResponse = response.json().await?;
        Ok(body.version)
    }

    /// Any 2xx from `/api/version` counts as connected
    pub async fn is_connected(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/version", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Runtime not reachable");
                false
            }
        }
    }

    /// Poll until the runtime answers or `timeout` elapses
    pub async fn wait_until_ready(&self, timeout: Duration, poll_interval: Duration) -> RuntimeResult<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.is_connected().await {
                tracing::info!(url = %self.base_url, "Runtime is ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RuntimeError::NotReady {
                    url: self.base_url.clone(),
                    timeout,
                });
            }
            sleep(poll_interval).await;
        }
    }

    /// `GET /api/tags`
    pub async fn installed_models(&self) -> RuntimeResult<Vec<InstalledModel>> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: TagsResponse = response.json().await?;

        tracing::debug!(count = body.models.len(), "Fetched installed models");
        Ok(body.models)
    }

    /// `DELETE /api/delete`
    pub async fn delete_model(&self, name: &str) -> RuntimeResult<()> {
        let response = self
            .client
            .delete(format!("{}/api/delete", self.base_url))
            .json(&ModelNameRequest { name })
            .send()
            .await?;
        check_status(response).await?;

        tracing::info!(model = %name, "Model deleted from runtime");
        Ok(())
    }
}

pub(crate) async fn check_status(response: reqwest::Response) -> RuntimeResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RuntimeError::ServerStatus { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags_response() {
        let json = r#"{
            "models": [
                {
                    "name": "llama3:8b",
                    "model": "llama3:8b",
                    "size": 4661224676,
                    "modified_at": "2024-05-01T10:00:00.123456789-07:00",
                    "digest": "365c0bd3c000",
                    "details": {
                        "family": "llama",
                        "format": "gguf",
                        "parameter_size": "8.0B",
                        "quantization_level": "Q4_0"
                    }
                },
                { "name": "bare" }
            ]
        }"#;

        let parsed: TagsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.models.len(), 2);
        assert_eq!(parsed.models[0].parameter_size(), Some("8.0B"));
        assert!(parsed.models[0].modified_at.is_some());
        assert_eq!(parsed.models[1].size, 0);
        assert_eq!(parsed.models[1].parameter_size(), None);
    }

    #[test]
    fn test_empty_tags_response() {
        let parsed: TagsResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.models.is_empty());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = OllamaClient::new("http://127.0.0.1:15537/").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:15537");
    }

    #[test]
    fn test_empty_base_url_rejected() {
        assert!(matches!(
            OllamaClient::new(""),
            Err(RuntimeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_runtime_not_connected() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = OllamaClient::new(format!("http://127.0.0.1:{}", port)).unwrap();
        assert!(!client.is_connected().await);
        let result = client
            .wait_until_ready(Duration::from_millis(200), Duration::from_millis(50))
            .await;
        assert!(
            matches!(
                &result,
                Err(RuntimeError::NotReady { timeout, .. }) if *timeout == Duration::from_millis(200)
            ),
            "{:?}",
            result
        );
    }
}
