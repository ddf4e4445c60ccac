//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// tokenkeeper - keeps an OAuth2 credential valid without a human in the loop
#[derive(Debug, Parser)]
#[command(name = "tokenkeeper")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, env = "TOKENKEEPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v', global = true)]
    pub debug: bool,

    /// Log one JSON object per line
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the monitor in the foreground until SIGTERM or SIGINT
    Run,

    /// Obtain a valid credential now, reauthorizing if needed
    Check {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the interactive reauthorization regardless of expiry
    Refresh,

    /// Show the stored credential's expiry without network access
    Status {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Dump,
    /// Check that the configuration can be used
    Validate,
    /// Print the default configuration file path
    Path,
}
