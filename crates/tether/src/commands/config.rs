//! Configuration inspection.

use anyhow::{Context, Result};

use tether_core::SyncConfig;

use crate::cli::{ConfigAction, ConfigCommand};

const REDACTED: &str = "********";

pub fn execute(cmd: ConfigCommand, config: &SyncConfig) -> Result<()> {
    match cmd.action {
        ConfigAction::Show => {
            let rendered = toml::to_string_pretty(&redacted(config))
                .context("Failed to render configuration")?;
            print!("{rendered}");
        }
        ConfigAction::Path => println!("{}", SyncConfig::config_path().display()),
    }
    Ok(())
}

/// Copy of `config` with API keys masked.
fn redacted(config: &SyncConfig) -> SyncConfig {
    let mut config = config.clone();
    if config.api_key.is_some() {
        config.api_key = Some(REDACTED.to_string());
    }
    if config.ai.api_key.is_some() {
        config.ai.api_key = Some(REDACTED.to_string());
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_masked() {
        let mut config = SyncConfig::default();
        config.api_key = Some("secret".into());
        config.ai.api_key = Some("other".into());

        let rendered = toml::to_string_pretty(&redacted(&config)).unwrap();
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("other"));
        assert!(rendered.contains(REDACTED));
    }

    #[test]
    fn test_rendered_config_parses_back() {
        let config = SyncConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: SyncConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.project_id, config.project_id);
        assert_eq!(parsed.dashboard.primary_url, config.dashboard.primary_url);
    }
}
