//! CLI module for connpool
//!
//! Argument parsing and subcommand dispatch for the `connpool` binary.

pub mod commands;

use clap::{Parser, Subcommand};
use connpool::logging::{LogFormat, LogLevel};

/// connpool - inspect pool configurations and exercise the pool
#[derive(Parser, Debug, Clone)]
#[command(name = "connpool")]
#[command(author = "Connpool Contributors")]
#[command(version)]
#[command(about = "Async connection pool toolkit", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "compact", env = "CONNPOOL_LOG_FORMAT")]
    pub log_format: LogFormat,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Validate a pool configuration file and print the effective settings
    Check(commands::check::CheckArgs),

    /// Drive an in-memory workload through the pool and print its statistics
    Simulate(commands::simulate::SimulateArgs),
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
    }

    /// Log level implied by the verbosity flags
    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_verbosity(self.verbosity())
    }
}
