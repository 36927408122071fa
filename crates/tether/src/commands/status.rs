//! Cached sync state view.
//!
//! Reads the JSON caches written by a running (or stopped) orchestrator.
//! Never touches the network. Supports JSON output for programmatic use.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;

use tether_core::ai::AiSyncState;
use tether_core::cache::{AI_CACHE_FILE, DASHBOARD_CACHE_FILE, ORCHESTRATOR_CACHE_FILE, StateCache};
use tether_core::dashboard::DashboardSyncState;
use tether_core::orchestrator::OrchestratorState;
use tether_core::{HealthReport, HealthStatus, Priority, SyncConfig};

/// Everything found in the state directory.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedStatus {
    pub state_dir: PathBuf,
    pub ai: Option<AiSyncState>,
    pub dashboard: Option<DashboardSyncState>,
    pub orchestrator: Option<OrchestratorState>,
}

pub fn load_cached(dir: &Path) -> Result<CachedStatus> {
    Ok(CachedStatus {
        state_dir: dir.to_path_buf(),
        ai: StateCache::in_dir(dir, AI_CACHE_FILE)
            .load()
            .context("Failed to read AI cache")?,
        dashboard: StateCache::in_dir(dir, DASHBOARD_CACHE_FILE)
            .load()
            .context("Failed to read dashboard cache")?,
        orchestrator: StateCache::in_dir(dir, ORCHESTRATOR_CACHE_FILE)
            .load()
            .context("Failed to read orchestrator cache")?,
    })
}

pub fn execute(config: &SyncConfig, json: bool) -> Result<()> {
    let status = load_cached(&config.state_dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{}", "tether status".cyan().bold());
    println!("{}", "─".repeat(50));
    println!("  State: {}", status.state_dir.display());
    println!();

    print_ai(status.ai.as_ref(), config.ai.daily_quota);
    println!();
    print_dashboard(status.dashboard.as_ref());
    println!();

    match &status.orchestrator {
        Some(state) => {
            println!("{}", "Orchestrator".bold());
            println!("  Agents: {}", state.agents.len());
            for agent in &state.agents {
                println!(
                    "    {} {} (last seen {})",
                    agent.id,
                    agent.status.dimmed(),
                    agent.last_seen_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!("  Directives: {}", state.directives.len());
            if let Some(report) = &state.last_health {
                println!();
                print_health(report);
            }
        }
        None => println!("{}", "Orchestrator: no cached state".yellow()),
    }
    Ok(())
}

fn print_ai(state: Option<&AiSyncState>, quota_limit: u32) {
    let Some(state) = state else {
        println!("{}", "AI: no cached state".yellow());
        return;
    };

    println!("{}", "AI commands".bold());
    println!(
        "  Pending: {} ({})",
        state.pending.len(),
        by_priority(state.pending.iter().map(|c| c.priority))
    );
    println!(
        "  Completed: {}  Failed: {}",
        state.metrics.completed, state.metrics.failed
    );
    println!("  Quota: {}/{}", state.quota.used, quota_limit);
    println!("  Last sync: {}", format_time(state.last_sync));
}

fn print_dashboard(state: Option<&DashboardSyncState>) {
    let Some(state) = state else {
        println!("{}", "Dashboard: no cached state".yellow());
        return;
    };

    println!("{}", "Dashboard updates".bold());
    println!(
        "  Pending: {} ({})",
        state.pending.len(),
        by_priority(state.pending.iter().map(|u| u.priority))
    );
    println!(
        "  Synced: {}  Dropped: {}  Inbound: {}",
        state.metrics.synced, state.metrics.dropped, state.metrics.inbound
    );
    println!("  Last sync: {}", format_time(state.last_sync));
}

pub fn print_health(report: &HealthReport) {
    let label = format!("{} ({})", report.score, report.status);
    let label = match report.status {
        HealthStatus::Healthy => label.green(),
        HealthStatus::Degraded => label.yellow(),
        HealthStatus::Critical => label.red(),
    };
    println!("{} {}", "Health:".bold(), label);
    for alert in &report.alerts {
        println!("  {} {}", "!".red(), alert);
    }
}

fn by_priority(priorities: impl Iterator<Item = Priority>) -> String {
    let mut counts = [0usize; 4];
    for priority in priorities {
        counts[priority as usize] += 1;
    }
    Priority::ALL
        .iter()
        .zip(counts)
        .map(|(p, n)| format!("{p} {n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_time(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_cached_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let status = load_cached(dir.path()).unwrap();
        assert!(status.ai.is_none());
        assert!(status.dashboard.is_none());
        assert!(status.orchestrator.is_none());
    }

    #[test]
    fn test_load_cached_reads_written_state() {
        let dir = tempfile::tempdir().unwrap();
        StateCache::in_dir(dir.path(), ORCHESTRATOR_CACHE_FILE)
            .save(&OrchestratorState::default())
            .unwrap();

        let status = load_cached(dir.path()).unwrap();
        assert!(status.orchestrator.is_some());
        assert!(status.ai.is_none());
    }

    #[test]
    fn test_by_priority_counts_every_class() {
        let summary = by_priority([Priority::Low, Priority::Critical, Priority::Low].into_iter());
        assert_eq!(summary, "critical 1, high 0, normal 0, low 2");
    }
}
