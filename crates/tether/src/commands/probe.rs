//! Connectivity diagnostics.

use anyhow::{Context, Result, bail};
use colored::Colorize;

use tether_core::SyncConfig;
use tether_core::transport::{AiTransport, DashboardTransport, HttpAiTransport, HttpDashboardTransport};

pub async fn execute(config: &SyncConfig) -> Result<()> {
    println!("{}", "tether probe".cyan().bold());
    println!("{}", "─".repeat(50));
    println!();

    let mut issues = Vec::new();

    let ai = HttpAiTransport::with_timeout(
        config.ai.url.clone(),
        config.ai_api_key(),
        config.ai.probe_timeout(),
    )
    .context("Failed to build AI service client")?;
    print!("  AI ({}): ", config.ai.url);
    match ai.health().await {
        Ok(()) => println!("{}", "✓ reachable".green()),
        Err(e) => {
            println!("{}", format!("✗ {e}").red());
            issues.push("AI service unreachable".to_string());
        }
    }

    let dashboard = HttpDashboardTransport::with_timeout(
        config.api_key.clone(),
        config.project_id.clone(),
        config.dashboard.probe_timeout(),
    )
    .context("Failed to build dashboard client")?;

    let endpoints = config.dashboard.endpoints();
    let mut reachable = 0;
    for endpoint in &endpoints {
        print!("  Dashboard {} ({}): ", endpoint.role, endpoint.url);
        match dashboard.health(endpoint).await {
            Ok(()) => {
                reachable += 1;
                println!("{}", "✓ reachable".green());
            }
            Err(e) => println!("{}", format!("✗ {e}").red()),
        }
    }
    if reachable == 0 {
        issues.push("No dashboard endpoint reachable".to_string());
    }

    println!();
    if issues.is_empty() {
        println!("{}", "All services reachable".green().bold());
        Ok(())
    } else {
        for issue in &issues {
            println!("  {} {}", "!".red(), issue);
        }
        bail!("{} connectivity issue(s)", issues.len())
    }
}
