//! Subcommands module for the connpool CLI
//!
//! This module contains all the subcommand implementations.

pub mod check;
pub mod simulate;

use std::path::Path;

use anyhow::{Context, Result};
use connpool::PoolConfig;

/// Load a configuration file (or the defaults) with environment overrides
/// applied, the same way an embedding application would.
pub(crate) fn load_config(path: Option<&Path>) -> Result<PoolConfig> {
    PoolConfig::load(path).with_context(|| match path {
        Some(path) => format!("invalid pool configuration in {}", path.display()),
        None => "invalid pool configuration".to_string(),
    })
}
