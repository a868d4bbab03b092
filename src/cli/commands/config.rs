use anyhow::Result;
use colored::Colorize;
use std::path::Path;

use crate::config::{config_path, save_config, save_config_to, Config};

/// Print where the config lives and the values in effect
pub fn run(config: &Config, explicit_path: Option<&Path>, save: bool) -> Result<()> {
    let path = match explicit_path {
        Some(path) => path.to_path_buf(),
        None => config_path()?,
    };

    if save {
        match explicit_path {
            Some(path) => save_config_to(path, config)?,
            None => save_config(config)?,
        }
        println!("{} {}", "Saved config to".green(), path.display());
        return Ok(());
    }

    println!("{} {}", "Config file:".bold(), path.display());
    println!("{} {}", "Claude dir:".bold(), config.claude_dir_path().display());
    println!("{} {}", "Database:".bold(), config.database_file().display());
    println!("{}", "─".repeat(60).dimmed());
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
