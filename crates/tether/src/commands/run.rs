//! Orchestrator runner.

use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use tether_core::transport::{HttpAiTransport, HttpDashboardTransport};
use tether_core::{Orchestrator, OrchestratorEvent, SyncConfig};

use super::status::print_health;

/// Wire the HTTP transports into a fresh orchestrator.
pub fn build(config: SyncConfig) -> Result<Orchestrator> {
    let ai = HttpAiTransport::with_timeout(
        config.ai.url.clone(),
        config.ai_api_key(),
        config.ai.request_timeout(),
    )
    .context("Failed to build AI service client")?;
    let dashboard = HttpDashboardTransport::with_timeout(
        config.api_key.clone(),
        config.project_id.clone(),
        config.dashboard.request_timeout(),
    )
    .context("Failed to build dashboard client")?;

    Ok(Orchestrator::new(config, Arc::new(ai), Arc::new(dashboard)))
}

pub async fn execute(config: SyncConfig, once: bool) -> Result<()> {
    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!(
            "Failed to create state directory {}",
            config.state_dir.display()
        )
    })?;
    let orchestrator = Arc::new(build(config)?);

    if once {
        orchestrator.restore();
        orchestrator.sync_all().await;
        let report = orchestrator.tick().await;
        orchestrator.shutdown().await;
        print_health(&report);
        return Ok(());
    }

    let mut events = orchestrator.subscribe();
    orchestrator.initialize().await;
    println!("{} tether running (Ctrl-C to stop)", "●".green());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event listener lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    orchestrator.shutdown().await;
    println!("{} tether stopped", "○".yellow());
    Ok(())
}

fn log_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::HealthUpdated(report) => {
            info!(score = report.score, status = %report.status, "Health");
        }
        OrchestratorEvent::DirectiveIssued(directive) => {
            info!(
                directive_id = %directive.id,
                agent_id = %directive.agent_id,
                directive = %directive.directive,
                "Critical directive issued"
            );
        }
        OrchestratorEvent::DirectiveExpired(directive) => {
            info!(directive_id = %directive.id, agent_id = %directive.agent_id, "Directive expired");
        }
        OrchestratorEvent::InboundCommand(command) => {
            info!(
                inbound_id = %command.id,
                command_type = %command.command_type,
                "Inbound command without handler"
            );
        }
        OrchestratorEvent::Sync(event) => debug!(event = event.name(), "Sync event"),
    }
}
