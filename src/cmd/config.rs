//! Configuration view and scaffolding commands (`zeule config`).

use std::path::Path;

use anyhow::Result;

use super::super::ConfigCommands;
use zeule::config::ZeuleConfig;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = ZeuleConfig::resolve(config_path)?;
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; showing defaults", config_path.display());
            }
            println!("# Effective values (with env overrides)");
            println!();
            print!("{}", config.to_toml()?);

            let warnings = config.validate();
            if !warnings.is_empty() {
                println!();
                for warning in warnings {
                    println!("# warning: {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists. Use --force to overwrite.",
                    config_path.display()
                );
            }
            ZeuleConfig::template().save(config_path)?;
            println!("Created {}", config_path.display());
        }
    }
    Ok(())
}
