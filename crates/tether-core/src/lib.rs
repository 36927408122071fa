//! tether-core - Core library for tether
//!
//! Keeps an AI command service and a project dashboard in sync with the
//! local development environment:
//!
//! - **ai**: prioritized AI command queue with retry and daily quota
//! - **dashboard**: telemetry push with primary/secondary/fallback failover
//!   and inbound operator commands
//! - **orchestrator**: composes both managers, computes a health score,
//!   tracks agents and directives
//! - **cache**: durable JSON snapshots so queues survive restarts
//! - **transport**: pluggable service clients (HTTP by default)

pub mod ai;
pub mod cache;
pub mod clock;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use ai::{AiStatus, AiSyncManager};
pub use config::{AiConfig, ConfigError, DashboardConfig, OrchestratorConfig, SyncConfig};
pub use dashboard::{DashboardStatus, DashboardSyncManager, LinkState};
pub use error::{Result, SyncError};
pub use events::SyncEvent;
pub use orchestrator::{HealthReport, HealthStatus, Orchestrator, OrchestratorEvent, UnifiedStatus};
pub use types::{CommandType, Priority, UpdateType};
