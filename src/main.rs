//! connpool - async connection pool toolkit
//!
//! This is the main entry point for the connpool CLI.

mod cli;

use anyhow::Result;
use cli::{Cli, Commands};
use connpool::logging::LoggingBuilder;

/// Application version information
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize logging based on verbosity
    if let Err(e) = LoggingBuilder::new()
        .with_level(cli.log_level())
        .with_format(cli.log_format)
        .with_target(cli.verbosity() >= 3)
        .init()
    {
        eprintln!("Warning: failed to initialize logging: {e}");
    }

    if cli.verbosity() >= 2 {
        eprintln!("connpool v{VERSION}");
    }

    // Execute the appropriate command
    let exit_code = match &cli.command {
        Commands::Check(args) => args.execute()?,
        Commands::Simulate(args) => args.execute().await?,
    };

    std::process::exit(exit_code);
}
