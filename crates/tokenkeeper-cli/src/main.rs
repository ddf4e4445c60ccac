//! tokenkeeper CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::Level;

use tokenkeeper_cli::cli::{Cli, Command, ConfigAction};
use tokenkeeper_cli::commands;
use tokenkeeper_cli::config::AppConfig;
use tokenkeeper_cli::error::{ClientError, ClientResult};
use tokenkeeper_server::logging::{LogFormat, LoggingConfig, init_logging};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(&cli) {
        eprintln!("error: {}", e);
        return ExitCode::from(e.exit_code());
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn setup_logging(cli: &Cli) -> ClientResult<()> {
    let mut logging = match cli.command {
        Command::Run => LoggingConfig::daemon(),
        _ => LoggingConfig::cli(),
    };
    if cli.debug {
        logging = logging.with_level(Level::DEBUG);
    }
    if cli.json_logs {
        logging = logging.with_format(LogFormat::Json);
    }
    init_logging(logging).map_err(|e| ClientError::Logging(e.to_string()))
}

async fn run(cli: Cli) -> ClientResult<()> {
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .map_err(ClientError::Config)?;

    match cli.command {
        Command::Run => commands::run::run(&config).await,
        Command::Check { json } => commands::check::check(&config, json).await,
        Command::Refresh => commands::refresh::refresh(&config).await,
        Command::Status { json } => commands::status::status(&config, json),
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config, cli.config.as_deref()),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(cli.config.as_deref()),
        },
    }
}
