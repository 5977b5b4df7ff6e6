//! Configuration view and validation commands (`shipyard config`).

use std::path::Path;

use anyhow::{Context, Result};

use shipyard::config::ShipyardConfig;

use super::super::ConfigCommands;

pub fn cmd_config(
    config_path: &Path,
    config: &ShipyardConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}, showing defaults", config_path.display());
            }
            let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            config.validate()?;
            println!("Configuration is valid.");
        }
    }
    Ok(())
}
