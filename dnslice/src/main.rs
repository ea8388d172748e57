//! dnslice CLI - serve files through DNS CNAME answers
//!
//! Publishes files behind an authoritative DNS server and fetches them back
//! through ordinary recursive resolvers.

#![forbid(unsafe_code)]

use std::io;

use clap::Parser;
use color_eyre::eyre::Result;
use dnslice_lib::ClientError;
use tracing::{debug, error};

use cli::{Cli, Command};
use config::Config;

mod cli;
mod commands;
mod config;

#[cfg(test)]
mod tests;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = Cli::parse();
    debug!("CLI args: {cli:?}");

    let config = match Config::load(&cli.global.config) {
        Ok(config) => config,
        Err(e) if matches!(cli.command, Command::Fetch(_)) => {
            exit_with(&ClientError::usage("invalid_config", e.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    debug!("Config loaded: {config:?}");

    run_command(&cli, &config).await
}

/// Initializes the tracing subscriber for logging.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Runs the appropriate command based on CLI args.
async fn run_command(cli: &Cli, config: &Config) -> Result<()> {
    let ctx = match commands::CommandContext::new(config) {
        Ok(ctx) => ctx,
        Err(e) if matches!(cli.command, Command::Fetch(_)) => {
            exit_with(&ClientError::usage("invalid_config", e.to_string()))
        }
        Err(e) => return Err(e.into()),
    };

    match &cli.command {
        Command::Serve(args) => {
            commands::serve(&ctx, &args.files, args.descriptors.as_deref()).await
        }
        Command::Publish(args) => commands::publish(&ctx, &args.files, args.records),
        Command::Fetch(args) => match commands::fetch_file(&ctx, args).await {
            Ok(path) => {
                println!("{}", path.display());
                Ok(())
            }
            Err(e) => exit_with(&e),
        },
    }
}

/// Logs a fetch failure and exits with its category's status.
fn exit_with(e: &ClientError) -> ! {
    error!(
        kind = e.kind.as_str(),
        reason = e.reason,
        exit_code = e.exit_code(),
        "{}",
        e.message
    );
    std::process::exit(e.exit_code());
}
