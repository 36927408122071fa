//! reqwest-backed transports.
//!
//! # Usage
//!
//! ```rust,no_run
//! use tether_core::transport::{DashboardTransport, HttpDashboardTransport};
//! use tether_core::types::{Endpoint, EndpointRole};
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let transport = HttpDashboardTransport::new(Some("secret".into()), "proj-1")?;
//!     let endpoint = Endpoint::new("https://dash.example.com", EndpointRole::Primary);
//!     transport.health(&endpoint).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::debug;

use super::{
    AiTransport, CommandsResponse, DashboardTransport, ExecuteResponse, SendAck, UpdateBatch,
};
use crate::error::{Result, SyncError};
use crate::types::{CommandType, Endpoint, InboundCommand};

/// Header carrying the project identifier.
pub const PROJECT_HEADER: &str = "X-Project-Id";

/// Default per-request timeout when none is configured.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin JSON-over-HTTP helper shared by both transports.
#[derive(Clone)]
struct JsonClient {
    client: reqwest::Client,
    api_key: Option<String>,
    project_id: Option<String>,
}

impl JsonClient {
    fn new(
        api_key: Option<String>,
        project_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            project_id,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);

        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(ref project) = self.project_id {
            req = req.header(PROJECT_HEADER, project);
        }

        req
    }

    async fn probe(&self, url: &str) -> Result<()> {
        debug!("Health probe: GET {}", url);
        let resp = self.request(reqwest::Method::GET, url).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SyncError::Unreachable(format!(
                "health check returned {}",
                resp.status()
            )))
        }
    }

    async fn send<T: DeserializeOwned, B: Serialize>(
        &self,
        method: reqwest::Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<T> {
        debug!("API request: {} {}", method, url);

        let mut req = self.request(method, url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status.is_success() {
            resp.json::<T>()
                .await
                .map_err(|e| SyncError::Protocol(format!("Failed to parse response: {}", e)))
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(SyncError::QuotaExceeded { used: 0, limit: 0 })
        } else {
            let error_text = resp.text().await.unwrap_or_default();
            Err(SyncError::Unreachable(format!(
                "API error {}: {}",
                status, error_text
            )))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dashboard
// ─────────────────────────────────────────────────────────────────────────────

/// Dashboard transport over HTTP(S).
#[derive(Clone)]
pub struct HttpDashboardTransport {
    http: JsonClient,
}

impl HttpDashboardTransport {
    pub fn new(api_key: Option<String>, project_id: impl Into<String>) -> Result<Self> {
        Self::with_timeout(api_key, project_id, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        api_key: Option<String>,
        project_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: JsonClient::new(api_key, Some(project_id.into()), timeout)?,
        })
    }
}

#[async_trait]
impl DashboardTransport for HttpDashboardTransport {
    async fn health(&self, endpoint: &Endpoint) -> Result<()> {
        self.http.probe(&format!("{}/health", endpoint.url)).await
    }

    async fn send_updates(&self, endpoint: &Endpoint, batch: &UpdateBatch) -> Result<SendAck> {
        self.http
            .send(
                reqwest::Method::POST,
                &format!("{}/v1/sync/updates", endpoint.url),
                &[],
                Some(batch),
            )
            .await
    }

    async fn poll_commands(
        &self,
        endpoint: &Endpoint,
        project_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InboundCommand>> {
        let mut query = vec![("projectId", project_id.to_string())];
        if let Some(since) = since {
            query.push(("since", since.timestamp_millis().to_string()));
        }

        let resp: CommandsResponse = self
            .http
            .send(
                reqwest::Method::GET,
                &format!("{}/v1/sync/commands", endpoint.url),
                &query,
                Option::<&()>::None,
            )
            .await?;
        Ok(resp.commands)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AI command service
// ─────────────────────────────────────────────────────────────────────────────

/// AI command service transport over HTTP(S).
#[derive(Clone)]
pub struct HttpAiTransport {
    http: JsonClient,
    base_url: String,
}

impl HttpAiTransport {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        Self::with_timeout(base_url, api_key, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: JsonClient::new(api_key, None, timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AiTransport for HttpAiTransport {
    async fn health(&self) -> Result<()> {
        self.http.probe(&format!("{}/health", self.base_url)).await
    }

    async fn execute(
        &self,
        command_type: CommandType,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let resp: ExecuteResponse = self
            .http
            .send(
                reqwest::Method::POST,
                &format!("{}/v1/commands/{}", self.base_url, command_type),
                &[],
                Some(payload),
            )
            .await?;

        match resp.error {
            Some(error) => Err(SyncError::Protocol(format!(
                "{} command rejected: {}",
                command_type, error
            ))),
            None => Ok(resp.result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EndpointRole;

    #[test]
    fn test_transport_creation() {
        assert!(HttpDashboardTransport::new(Some("key".into()), "proj").is_ok());
        let ai = HttpAiTransport::new("http://localhost:9000/", None).unwrap();
        assert_eq!(ai.base_url, "http://localhost:9000");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable_error() {
        let transport =
            HttpDashboardTransport::with_timeout(None, "proj", Duration::from_millis(500)).unwrap();
        // Port 9 (discard) on localhost is closed in test environments
        let endpoint = Endpoint::new("http://127.0.0.1:9", EndpointRole::Primary);

        let err = transport.health(&endpoint).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
