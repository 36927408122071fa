//! Composite health score.
//!
//! The score starts at 100 and loses a fixed penalty per failing
//! condition. Every penalty comes with an alert string so operators see
//! why the score dropped.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::OrchestratorConfig;

pub const AI_OFFLINE_PENALTY: u32 = 30;
pub const DASHBOARD_OFFLINE_PENALTY: u32 = 25;
pub const ERROR_RATE_PENALTY: u32 = 15;
pub const QUOTA_PENALTY: u32 = 10;
pub const QUEUE_DEPTH_PENALTY: u32 = 10;
pub const STALE_WARN_PENALTY: u32 = 10;
pub const STALE_CRITICAL_PENALTY: u32 = 25;

/// Quota utilization above which the quota penalty applies.
pub const QUOTA_PRESSURE: f64 = 0.9;

/// Health band derived from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }

    /// healthy >= 80, degraded >= 50, critical below.
    pub fn from_score(score: u32) -> Self {
        if score >= 80 {
            HealthStatus::Healthy
        } else if score >= 50 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An agent whose heartbeat is older than the staleness window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleAgent {
    pub id: String,
    pub idle_secs: i64,
}

/// Everything the score is computed from.
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    /// `None` before the first probe.
    pub ai_online: Option<bool>,
    pub dashboard_connected: bool,
    pub ai_error_rate: f64,
    pub quota_utilization: f64,
    pub ai_queue_depth: usize,
    pub dashboard_queue_depth: usize,
    /// Seconds since both services were last synced in the same pass.
    pub since_last_sync_secs: i64,
    pub stale_agents: Vec<StaleAgent>,
}

/// Result of one health computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub score: u32,
    pub status: HealthStatus,
    pub alerts: Vec<String>,
    pub computed_at: DateTime<Utc>,
    pub ai_online: Option<bool>,
    pub dashboard_connected: bool,
    pub ai_error_rate: f64,
    pub quota_utilization: f64,
    pub ai_queue_depth: usize,
    pub dashboard_queue_depth: usize,
    pub since_last_sync_secs: i64,
    #[serde(default)]
    pub stale_agents: Vec<StaleAgent>,
}

/// Apply the penalty table to `inputs`.
pub fn assess(
    inputs: &HealthInputs,
    thresholds: &OrchestratorConfig,
    now: DateTime<Utc>,
) -> HealthReport {
    let mut penalty = 0u32;
    let mut alerts = Vec::new();

    if inputs.ai_online == Some(false) {
        penalty += AI_OFFLINE_PENALTY;
        alerts.push("AI service offline".to_string());
    }

    if !inputs.dashboard_connected {
        penalty += DASHBOARD_OFFLINE_PENALTY;
        alerts.push("Dashboard offline: no endpoint reachable".to_string());
    }

    if inputs.ai_error_rate > thresholds.error_rate_threshold {
        penalty += ERROR_RATE_PENALTY;
        alerts.push(format!(
            "AI error rate {:.0}% above {:.0}%",
            inputs.ai_error_rate * 100.0,
            thresholds.error_rate_threshold * 100.0
        ));
    }

    if inputs.quota_utilization > QUOTA_PRESSURE {
        penalty += QUOTA_PENALTY;
        alerts.push(format!(
            "AI quota {:.0}% used",
            inputs.quota_utilization * 100.0
        ));
    }

    if inputs.dashboard_queue_depth > thresholds.queue_depth_threshold {
        penalty += QUEUE_DEPTH_PENALTY;
        alerts.push(format!(
            "Dashboard queue depth {} above {}",
            inputs.dashboard_queue_depth, thresholds.queue_depth_threshold
        ));
    }

    let since = inputs.since_last_sync_secs;
    if since > thresholds.stale_sync_critical_secs as i64 {
        penalty += STALE_CRITICAL_PENALTY;
        alerts.push(format!("Sync critically stale: last full sync {since}s ago"));
    } else if since > thresholds.stale_sync_warn_secs as i64 {
        penalty += STALE_WARN_PENALTY;
        alerts.push(format!("Sync stale: last full sync {since}s ago"));
    }

    for agent in &inputs.stale_agents {
        alerts.push(format!(
            "Agent {} stale: no heartbeat for {}s",
            agent.id, agent.idle_secs
        ));
    }

    let score = 100u32.saturating_sub(penalty);
    HealthReport {
        score,
        status: HealthStatus::from_score(score),
        alerts,
        computed_at: now,
        ai_online: inputs.ai_online,
        dashboard_connected: inputs.dashboard_connected,
        ai_error_rate: inputs.ai_error_rate,
        quota_utilization: inputs.quota_utilization,
        ai_queue_depth: inputs.ai_queue_depth,
        dashboard_queue_depth: inputs.dashboard_queue_depth,
        since_last_sync_secs: inputs.since_last_sync_secs,
        stale_agents: inputs.stale_agents.clone(),
    }
}
