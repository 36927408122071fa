//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// AI command and dashboard sync
///
/// Keeps the AI command service and the project dashboard in sync with the
/// local environment, surviving outages and restarts.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long = "json-logs", global = true)]
    pub json_logs: bool,

    /// Override the state cache directory
    #[arg(long, global = true, env = "TETHER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator until interrupted
    Run {
        /// Run one combined sync and health pass, then exit
        #[arg(long)]
        once: bool,
    },

    /// Show cached sync state (no network)
    Status {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Probe the AI service and every dashboard endpoint
    Probe,

    /// Configuration inspection
    Config(ConfigCommand),

    /// Show version
    Version,
}

// ─────────────────────────────────────────────────────────────────────────────
// Config Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,

    /// Print the config file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_once_with_global_flags() {
        let cli = Cli::parse_from(["tether", "run", "--once", "--json-logs", "--state-dir", "/tmp/t"]);
        assert!(cli.json_logs);
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/t")));
        assert!(matches!(cli.command, Commands::Run { once: true }));
    }

    #[test]
    fn test_parse_config_show() {
        let cli = Cli::parse_from(["tether", "config", "show"]);
        match cli.command {
            Commands::Config(cmd) => assert!(matches!(cmd.action, ConfigAction::Show)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
