//! Check command - configuration validation
//!
//! Loads a configuration file, applies `CONNPOOL_*` environment overrides,
//! validates the result and prints the effective settings as JSON.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use super::load_config;

/// Arguments for the check command
#[derive(Parser, Debug, Clone)]
pub struct CheckArgs {
    /// Path to the pool configuration file (TOML, YAML or JSON)
    #[arg(required = true)]
    pub config: PathBuf,

    /// Print compact single-line JSON
    #[arg(long)]
    pub compact: bool,
}

impl CheckArgs {
    /// Execute the check command
    pub fn execute(&self) -> Result<i32> {
        let config = load_config(Some(&self.config))?;
        info!(path = %self.config.display(), "Configuration is valid");

        let rendered = if self.compact {
            serde_json::to_string(&config)?
        } else {
            serde_json::to_string_pretty(&config)?
        };
        println!("{rendered}");
        Ok(0)
    }
}
