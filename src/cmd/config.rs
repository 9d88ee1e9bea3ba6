//! Configuration view and validation commands, `conductor config`.

use anyhow::{Context, Result};
use conductor::config::{CONFIG_DIR, CONFIG_FILE, ConductorConfig, ConductorToml};

use super::super::ConfigCommands;

pub fn cmd_config(config: &ConductorConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_dir = config.project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No {} found; showing defaults", CONFIG_FILE);
            }
            println!("# Effective values (with env/CLI overrides):");
            println!();
            let rendered = toml::to_string_pretty(&config.settings)
                .context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let warnings = ConductorToml::load(&config_path)?.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create {}", config_dir.display()))?;
            ConductorToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [state] state_dir, cache_ttl_ms, update_retries");
            println!("  - [review] limits, timeouts, digest, fixer");
            println!("  - [[review.passes]] id and command for each analysis pass");
        }
    }

    Ok(())
}
