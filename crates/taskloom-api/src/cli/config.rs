//! CLI configuration subcommands.

use std::path::Path;

use anyhow::Result;
use clap::Subcommand;
use console::style;

use taskloom_infra::config::{config_path, read_engine_config};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate `config.toml` and report every problem found.
    Check,

    /// Print the effective configuration.
    Show,
}

/// Config commands read the file directly; they do not need a database.
///
/// Returns `false` when the configuration is unreadable or invalid.
pub async fn handle_config_command(cmd: ConfigCommand, data_dir: &Path, json: bool) -> Result<bool> {
    let path = config_path(data_dir);
    let config = match read_engine_config(data_dir).await {
        Ok(config) => config,
        Err(e) => {
            if json {
                let out = serde_json::json!({ "path": path, "valid": false, "errors": [e.to_string()] });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!();
                println!("  {} {}", style("x").red().bold(), e);
                println!();
            }
            return Ok(false);
        }
    };

    match cmd {
        ConfigCommand::Show => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(true)
        }
        ConfigCommand::Check => {
            let issues = config.validate().err().unwrap_or_default();
            if json {
                let errors: Vec<String> = issues.iter().map(ToString::to_string).collect();
                let out = serde_json::json!({ "path": path, "valid": errors.is_empty(), "errors": errors });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else if issues.is_empty() {
                println!();
                println!(
                    "  {} {} is valid",
                    style("*").green().bold(),
                    style(path.display()).cyan()
                );
                println!();
            } else {
                println!();
                println!(
                    "  {} {} has {} problem(s):",
                    style("x").red().bold(),
                    style(path.display()).cyan(),
                    issues.len()
                );
                for issue in &issues {
                    println!("    - {issue}");
                }
                println!();
            }
            Ok(issues.is_empty())
        }
    }
}
