//! tokenkeeper command-line client.
//!
//! Loads `config.toml`, builds the [`tokenkeeper_server::Orchestrator`] and
//! runs one of the subcommands in [`commands`].

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod secret;
