//! Shared types for tether-core.
//!
//! These types are used by the sync managers, the orchestrator, the
//! transports (as wire payloads) and the local cache.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

// ─────────────────────────────────────────────────────────────────────────────
// Priority
// ─────────────────────────────────────────────────────────────────────────────

/// Priority class shared by commands, updates and directives.
///
/// Declaration order is the processing order: `Critical` sorts first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All classes, highest first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// `normal` and `low` items may be dropped on queue overflow.
    pub fn is_evictable(&self) -> bool {
        matches!(self, Priority::Normal | Priority::Low)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" | "medium" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(SyncError::InvalidPayload(format!("unknown priority '{other}'"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AI Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of work sent to the AI command service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Analyze,
    Generate,
    Optimize,
    Monitor,
    Execute,
}

impl CommandType {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Analyze => "analyze",
            CommandType::Generate => "generate",
            CommandType::Optimize => "optimize",
            CommandType::Monitor => "monitor",
            CommandType::Execute => "execute",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "analyze" => Ok(CommandType::Analyze),
            "generate" => Ok(CommandType::Generate),
            "optimize" => Ok(CommandType::Optimize),
            "monitor" => Ok(CommandType::Monitor),
            "execute" => Ok(CommandType::Execute),
            _ => Err(SyncError::UnknownCommandType(s.to_string())),
        }
    }
}

/// Lifecycle of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }
}

/// A unit of work destined for the AI command service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// Monotonic enqueue order, breaks ties between equal timestamps.
    #[serde(default)]
    pub seq: u64,
    pub status: CommandStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Command {
    pub fn new(
        command_type: CommandType,
        payload: serde_json::Value,
        priority: Priority,
        created_at: DateTime<Utc>,
        seq: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_type,
            payload,
            priority,
            created_at,
            seq,
            status: CommandStatus::Pending,
            retry_count: 0,
            response: None,
            last_error: None,
            finished_at: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dashboard Updates
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of telemetry pushed to the dashboard service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateType {
    Status,
    Log,
    Metric,
    Alert,
    CodePatch,
}

impl UpdateType {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Status => "status",
            UpdateType::Log => "log",
            UpdateType::Metric => "metric",
            UpdateType::Alert => "alert",
            UpdateType::CodePatch => "code-patch",
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "status" => Ok(UpdateType::Status),
            "log" => Ok(UpdateType::Log),
            "metric" => Ok(UpdateType::Metric),
            "alert" => Ok(UpdateType::Alert),
            "code-patch" => Ok(UpdateType::CodePatch),
            _ => Err(SyncError::UnknownUpdateType(s.to_string())),
        }
    }
}

/// A telemetry item destined for the dashboard service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub priority: Priority,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub synced: bool,
    /// Failed batch sends this update took part in.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Update {
    pub fn new(
        update_type: UpdateType,
        payload: serde_json::Value,
        priority: Priority,
        created_at: DateTime<Utc>,
        seq: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            update_type,
            payload,
            created_at,
            priority,
            seq,
            synced: false,
            attempts: 0,
            last_error: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoints
// ─────────────────────────────────────────────────────────────────────────────

/// Role of a dashboard endpoint; declaration order is the probe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Primary,
    Secondary,
    Fallback,
}

impl EndpointRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointRole::Primary => "primary",
            EndpointRole::Secondary => "secondary",
            EndpointRole::Fallback => "fallback",
        }
    }
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate dashboard endpoint. Liveness is tracked by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    pub role: EndpointRole,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, role: EndpointRole) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            role,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound operator commands
// ─────────────────────────────────────────────────────────────────────────────

/// Operator command pulled from the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundCommand {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Agents & Directives
// ─────────────────────────────────────────────────────────────────────────────

/// A registered agent. Staleness is derived from `last_seen_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub status: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// An instruction queued for a specific agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directive {
    pub id: Uuid,
    pub agent_id: String,
    pub directive: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Set once a critical directive has been broadcast for execution.
    #[serde(default)]
    pub issued: bool,
}

impl Directive {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let mut priorities = vec![Priority::Low, Priority::Critical, Priority::Normal, Priority::High];
        priorities.sort();
        assert_eq!(priorities, Priority::ALL.to_vec());
        assert!(Priority::Low.is_evictable());
        assert!(!Priority::High.is_evictable());
    }

    #[test]
    fn test_command_type_parse() {
        assert_eq!("Analyze".parse::<CommandType>().unwrap(), CommandType::Analyze);
        let err = "teleport".parse::<CommandType>().unwrap_err();
        assert!(matches!(err, SyncError::UnknownCommandType(ref t) if t == "teleport"));
    }

    #[test]
    fn test_update_type_parse_and_wire_name() {
        assert_eq!("code_patch".parse::<UpdateType>().unwrap(), UpdateType::CodePatch);
        assert_eq!(
            serde_json::to_value(UpdateType::CodePatch).unwrap(),
            serde_json::json!("code-patch")
        );
        assert!("heartbeat".parse::<UpdateType>().is_err());
    }

    #[test]
    fn test_update_wire_shape() {
        let update = Update::new(
            UpdateType::Log,
            serde_json::json!({"line": "ok"}),
            Priority::High,
            Utc::now(),
            7,
        );
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["priority"], "high");
        assert_eq!(value["synced"], false);
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let endpoint = Endpoint::new("https://dash.example.com/", EndpointRole::Primary);
        assert_eq!(endpoint.url, "https://dash.example.com");
    }

    #[test]
    fn test_directive_expiry() {
        let now = Utc::now();
        let directive = Directive {
            id: Uuid::new_v4(),
            agent_id: "a1".into(),
            directive: "refactor".into(),
            parameters: serde_json::Value::Null,
            priority: Priority::Normal,
            deadline: Some(now - chrono::Duration::seconds(1)),
            created_at: now,
            issued: false,
        };
        assert!(directive.is_expired(now));
        assert!(!Directive { deadline: None, ..directive }.is_expired(now));
    }
}
