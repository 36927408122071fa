//! Sync configuration.
//!
//! Configuration is loaded from multiple sources with precedence:
//! 1. Environment variables (`TETHER_*`)
//! 2. Config file (`TETHER_CONFIG`, or `<config dir>/tether/config.toml`)
//! 3. Default values

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::types::{Endpoint, EndpointRole};

/// Configuration loading / validation failure
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Project identifier sent with every dashboard request
    pub project_id: String,

    /// Bearer key used for both services unless overridden per service
    pub api_key: Option<String>,

    /// Directory holding the JSON state caches
    pub state_dir: PathBuf,

    /// AI command service settings
    pub ai: AiConfig,

    /// Dashboard service settings
    pub dashboard: DashboardConfig,

    /// Orchestrator settings
    pub orchestrator: OrchestratorConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            project_id: "default".to_string(),
            api_key: None,
            state_dir: default_state_dir(),
            ai: AiConfig::default(),
            dashboard: DashboardConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// AI command sync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// Base URL of the AI command service
    pub url: String,

    /// Service-specific key (falls back to the top-level key)
    pub api_key: Option<String>,

    /// Tick interval in milliseconds (default: 5000)
    pub tick_interval_ms: u64,

    /// Commands executed per tick (default: 5)
    pub batch_size: usize,

    /// Retries after the first failed attempt (default: 3)
    pub max_retries: u32,

    /// Attempts allowed per rolling day (default: 1000)
    pub daily_quota: u32,

    /// Maximum pending commands before eviction (default: 500)
    pub queue_cap: usize,

    /// Terminal commands kept for status lookups (default: 100)
    pub history_limit: usize,

    /// Health probe timeout in milliseconds (default: 3000)
    pub probe_timeout_ms: u64,

    /// Execution timeout in milliseconds (default: 30000)
    pub request_timeout_ms: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8700".to_string(),
            api_key: None,
            tick_interval_ms: 5_000,
            batch_size: 5,
            max_retries: 3,
            daily_quota: 1_000,
            queue_cap: 500,
            history_limit: 100,
            probe_timeout_ms: 3_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl AiConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Dashboard sync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Primary endpoint URL
    pub primary_url: String,

    /// Secondary endpoint URL (optional)
    pub secondary_url: Option<String>,

    /// Fallback endpoint URL (optional)
    pub fallback_url: Option<String>,

    /// Tick interval in milliseconds (default: 10000)
    pub tick_interval_ms: u64,

    /// Updates per batch POST (default: 20)
    pub batch_size: usize,

    /// Maximum unsynced updates before eviction (default: 1000)
    pub queue_cap: usize,

    /// Failed batches an update may take part in before it is dropped (default: 5)
    pub max_retries: u32,

    /// Synced updates kept for status lookups (default: 100)
    pub history_limit: usize,

    /// Health probe timeout in milliseconds (default: 2000)
    pub probe_timeout_ms: u64,

    /// Push / poll timeout in milliseconds (default: 15000)
    pub request_timeout_ms: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            primary_url: "http://localhost:3000".to_string(),
            secondary_url: None,
            fallback_url: None,
            tick_interval_ms: 10_000,
            batch_size: 20,
            queue_cap: 1_000,
            max_retries: 5,
            history_limit: 100,
            probe_timeout_ms: 2_000,
            request_timeout_ms: 15_000,
        }
    }
}

impl DashboardConfig {
    /// Configured endpoints in probe order (primary, secondary, fallback).
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = vec![Endpoint::new(&self.primary_url, EndpointRole::Primary)];
        if let Some(url) = self.secondary_url.as_deref().filter(|u| !u.is_empty()) {
            endpoints.push(Endpoint::new(url, EndpointRole::Secondary));
        }
        if let Some(url) = self.fallback_url.as_deref().filter(|u| !u.is_empty()) {
            endpoints.push(Endpoint::new(url, EndpointRole::Fallback));
        }
        endpoints
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Tick interval in milliseconds (default: 15000)
    pub tick_interval_ms: u64,

    /// Seconds without heartbeat before an agent is flagged stale (default: 120)
    pub agent_stale_after_secs: u64,

    /// AI error rate above which health is penalized (default: 0.2)
    pub error_rate_threshold: f64,

    /// Dashboard queue depth above which health is penalized (default: 100)
    pub queue_depth_threshold: usize,

    /// Seconds since last unified sync before the first penalty (default: 300)
    pub stale_sync_warn_secs: u64,

    /// Seconds since last unified sync before the larger penalty (default: 900)
    pub stale_sync_critical_secs: u64,

    /// Internal events kept in memory (default: 200)
    pub event_log_limit: usize,

    /// Push a status update with the health report every tick (default: true)
    pub push_status_snapshots: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 15_000,
            agent_stale_after_secs: 120,
            error_rate_threshold: 0.2,
            queue_depth_threshold: 100,
            stale_sync_warn_secs: 300,
            stale_sync_critical_secs: 900,
            event_log_limit: 200,
            push_status_snapshots: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("tether"))
        .unwrap_or_else(|| PathBuf::from(".tether"))
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("tether"))
        .unwrap_or_else(|| PathBuf::from(".tether"))
        .join("config.toml")
}

impl SyncConfig {
    /// Load configuration from file and environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file, or defaults when it does not exist.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Get the config file path.
    pub fn config_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path())
    }

    /// Apply `TETHER_*` overrides through `lookup` (the process environment
    /// in production, a map in tests).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TETHER_PROJECT_ID") {
            self.project_id = v;
        }
        if let Some(v) = lookup("TETHER_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = lookup("TETHER_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }

        if let Some(v) = lookup("TETHER_AI_URL") {
            self.ai.url = v;
        }
        if let Some(v) = lookup("TETHER_AI_API_KEY") {
            self.ai.api_key = Some(v);
        }
        parse_into(&lookup, "TETHER_AI_TICK_MS", &mut self.ai.tick_interval_ms)?;
        parse_into(&lookup, "TETHER_AI_BATCH_SIZE", &mut self.ai.batch_size)?;
        parse_into(&lookup, "TETHER_AI_QUEUE_CAP", &mut self.ai.queue_cap)?;
        parse_into(&lookup, "TETHER_MAX_RETRIES", &mut self.ai.max_retries)?;
        parse_into(&lookup, "TETHER_DAILY_QUOTA", &mut self.ai.daily_quota)?;

        if let Some(v) = lookup("TETHER_PRIMARY_URL") {
            self.dashboard.primary_url = v;
        }
        if let Some(v) = lookup("TETHER_SECONDARY_URL") {
            self.dashboard.secondary_url = Some(v);
        }
        if let Some(v) = lookup("TETHER_FALLBACK_URL") {
            self.dashboard.fallback_url = Some(v);
        }
        parse_into(&lookup, "TETHER_DASHBOARD_TICK_MS", &mut self.dashboard.tick_interval_ms)?;
        parse_into(&lookup, "TETHER_BATCH_SIZE", &mut self.dashboard.batch_size)?;
        parse_into(&lookup, "TETHER_QUEUE_CAP", &mut self.dashboard.queue_cap)?;
        parse_into(&lookup, "TETHER_DASHBOARD_MAX_RETRIES", &mut self.dashboard.max_retries)?;

        parse_into(&lookup, "TETHER_ORCHESTRATOR_TICK_MS", &mut self.orchestrator.tick_interval_ms)?;
        parse_into(
            &lookup,
            "TETHER_AGENT_STALE_SECS",
            &mut self.orchestrator.agent_stale_after_secs,
        )?;

        Ok(())
    }

    /// Check ranges and required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::invalid("project_id", "must not be empty"));
        }
        if self.dashboard.primary_url.trim().is_empty() {
            return Err(ConfigError::invalid("dashboard.primary_url", "must not be empty"));
        }
        if self.ai.url.trim().is_empty() {
            return Err(ConfigError::invalid("ai.url", "must not be empty"));
        }
        if self.ai.batch_size == 0 || self.dashboard.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.ai.queue_cap == 0 || self.dashboard.queue_cap == 0 {
            return Err(ConfigError::invalid("queue_cap", "must be at least 1"));
        }
        if self.ai.daily_quota == 0 {
            return Err(ConfigError::invalid("ai.daily_quota", "must be at least 1"));
        }
        if self.ai.tick_interval_ms == 0
            || self.dashboard.tick_interval_ms == 0
            || self.orchestrator.tick_interval_ms == 0
        {
            return Err(ConfigError::invalid("tick_interval_ms", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.orchestrator.error_rate_threshold) {
            return Err(ConfigError::invalid(
                "orchestrator.error_rate_threshold",
                "must be between 0 and 1",
            ));
        }
        if self.orchestrator.stale_sync_warn_secs >= self.orchestrator.stale_sync_critical_secs {
            return Err(ConfigError::invalid(
                "orchestrator.stale_sync_warn_secs",
                "must be below stale_sync_critical_secs",
            ));
        }
        Ok(())
    }

    /// Key used for the AI service.
    pub fn ai_api_key(&self) -> Option<String> {
        self.ai.api_key.clone().or_else(|| self.api_key.clone())
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(value) = lookup(key) {
        *target = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ai.max_retries, 3);
        assert_eq!(config.dashboard.endpoints().len(), 1);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = SyncConfig::default();
        config
            .apply_overrides(lookup_from(&[
                ("TETHER_PRIMARY_URL", "https://a.example.com"),
                ("TETHER_SECONDARY_URL", "https://b.example.com"),
                ("TETHER_FALLBACK_URL", "https://c.example.com"),
                ("TETHER_API_KEY", "secret"),
                ("TETHER_PROJECT_ID", "proj-9"),
                ("TETHER_DAILY_QUOTA", "250"),
                ("TETHER_BATCH_SIZE", "7"),
                ("TETHER_MAX_RETRIES", "2"),
            ]))
            .unwrap();

        let endpoints = config.dashboard.endpoints();
        assert_eq!(endpoints.len(), 3);
        assert_eq!(endpoints[0].role, EndpointRole::Primary);
        assert_eq!(endpoints[2].url, "https://c.example.com");
        assert_eq!(config.project_id, "proj-9");
        assert_eq!(config.ai.daily_quota, 250);
        assert_eq!(config.dashboard.batch_size, 7);
        assert_eq!(config.ai.max_retries, 2);
        assert_eq!(config.ai_api_key().as_deref(), Some("secret"));
    }

    #[test]
    fn test_invalid_env_number() {
        let mut config = SyncConfig::default();
        let err = config
            .apply_overrides(lookup_from(&[("TETHER_QUEUE_CAP", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == "TETHER_QUEUE_CAP"));
    }

    #[test]
    fn test_partial_toml_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
project_id = "from-file"

[dashboard]
primary_url = "https://primary.example.com"
fallback_url = "https://fallback.example.com"
batch_size = 3
"#,
        )
        .unwrap();

        let config = SyncConfig::from_file(&path).unwrap();
        assert_eq!(config.project_id, "from-file");
        assert_eq!(config.dashboard.batch_size, 3);
        assert_eq!(config.dashboard.queue_cap, 1_000);
        let roles: Vec<EndpointRole> = config.dashboard.endpoints().iter().map(|e| e.role).collect();
        assert_eq!(roles, vec![EndpointRole::Primary, EndpointRole::Fallback]);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::from_file(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.project_id, "default");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SyncConfig::default();
        config.ai.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.orchestrator.stale_sync_warn_secs = 1_000;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.orchestrator.error_rate_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
