//! Pluggable transports toward the two remote services.
//!
//! The managers only talk to these traits. The reqwest-backed
//! implementations live in [`http`]; tests substitute in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{CommandType, Endpoint, InboundCommand, Update};

#[cfg(feature = "http")]
pub mod http;

#[cfg(test)]
pub mod fake;

#[cfg(feature = "http")]
pub use http::{HttpAiTransport, HttpDashboardTransport};

/// AI command service: health probe plus `execute(type, payload)`.
#[async_trait]
pub trait AiTransport: Send + Sync {
    /// Lightweight reachability check.
    async fn health(&self) -> Result<()>;

    /// Run one command and return the service's result document.
    async fn execute(
        &self,
        command_type: CommandType,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value>;
}

/// Dashboard service, addressed per endpoint.
#[async_trait]
pub trait DashboardTransport: Send + Sync {
    /// `GET /health`; anything but success counts as down.
    async fn health(&self, endpoint: &Endpoint) -> Result<()>;

    /// `POST /v1/sync/updates`.
    async fn send_updates(&self, endpoint: &Endpoint, batch: &UpdateBatch) -> Result<SendAck>;

    /// `GET /v1/sync/commands?projectId=&since=`.
    async fn poll_commands(
        &self,
        endpoint: &Endpoint,
        project_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InboundCommand>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Body of `POST /v1/sync/updates`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBatch {
    pub updates: Vec<Update>,
    pub project_id: String,
    /// Unix milliseconds at send time.
    pub timestamp: i64,
}

/// Response of `POST /v1/sync/updates`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAck {
    pub success: bool,
}

/// Response of `GET /v1/sync/commands`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandsResponse {
    #[serde(default)]
    pub commands: Vec<InboundCommand>,
}

/// Response of an AI command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_response_tolerates_missing_list() {
        let resp: CommandsResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.commands.is_empty());

        let resp: CommandsResponse = serde_json::from_value(serde_json::json!({
            "commands": [{ "id": "c1", "type": "force-sync" }]
        }))
        .unwrap();
        assert_eq!(resp.commands[0].command_type, "force-sync");
        assert!(resp.commands[0].payload.is_null());
    }

    #[test]
    fn test_update_batch_wire_names() {
        let batch = UpdateBatch {
            updates: vec![],
            project_id: "proj".into(),
            timestamp: 42,
        };
        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["projectId"], "proj");
        assert_eq!(value["timestamp"], 42);
    }
}
