//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use pv_domain::config::Config;
use pv_domain::error::{Error, Result};

#[derive(Parser)]
#[command(name = "palaver", about = "Gateway for a multi-channel conversational AI platform")]
pub struct Cli {
    /// Path to the system config file.
    #[arg(long, global = true, default_value = "./data/config/default.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway server (the default).
    Serve,
    /// Run diagnostics and exit non-zero on errors.
    Doctor,
    /// Config utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file.
    Validate,
    /// Print the redacted effective config.
    Show,
}

/// Load the system config; a missing file yields built-in defaults.
pub fn load_config(path: &PathBuf) -> Result<Config> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}
