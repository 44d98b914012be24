//! # drive-reactor
//!
//! Runs and administers a drive reactor.
//!
//! ## Commands
//!
//! - `serve`: Run the reactor, its HTTP endpoints and its remotes
//! - `migrate`: Apply pending schema migrations, destructive ones included
//! - `status`: Show schema, checkpoints and sync cursors
//!
//! ## Example
//!
//! ```bash
//! # Prepare the database
//! drive-reactor migrate --config reactor.toml
//!
//! # Run
//! RUST_LOG=drive_reactor_server=debug drive-reactor serve --config reactor.toml
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{migrate, serve, status};
use config::CliConfig;

/// Runs and administers a drive reactor.
#[derive(Parser, Debug)]
#[command(name = "drive-reactor")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reactor until Ctrl+C
    Serve {
        /// Configuration file
        #[arg(long, short, default_value = "reactor.toml")]
        config: PathBuf,
    },

    /// Apply pending schema migrations
    Migrate {
        /// Configuration file
        #[arg(long, short, default_value = "reactor.toml")]
        config: PathBuf,
    },

    /// Show schema, checkpoints and sync cursors
    Status {
        /// Configuration file
        #[arg(long, short, default_value = "reactor.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    match cli.command {
        Commands::Serve { config } => serve::run(CliConfig::load(&config)?).await,
        Commands::Migrate { config } => migrate::run(CliConfig::load(&config)?).await,
        Commands::Status { config } => status::run(CliConfig::load(&config)?).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn config_defaults_to_reactor_toml() {
        let cli = Cli::try_parse_from(["drive-reactor", "status"]).unwrap();
        match cli.command {
            Commands::Status { config } => assert_eq!(config, PathBuf::from("reactor.toml")),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["drive-reactor"]).is_err());
        let cli = Cli::try_parse_from(["drive-reactor", "serve", "--config", "/etc/drive.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { config } if config == PathBuf::from("/etc/drive.toml")));
    }
}
