//! CLI argument parsing for dnslice.
//!
//! This module defines the command-line interface using clap.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use securefmt::Debug;

/// Main CLI structure.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "dnslice - Serve files through DNS CNAME answers"
)]
pub struct Cli {
    /// Global arguments shared across all commands.
    #[command(flatten)]
    pub global: GlobalArgs,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Global arguments available to all commands.
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "config.toml")]
    pub config: PathBuf,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish files and answer slice queries until interrupted.
    Serve(ServeArgs),

    /// Run the startup pipeline and print the file descriptors.
    Publish(PublishArgs),

    /// Download a published file through a resolver.
    Fetch(FetchArgs),
}

/// Arguments for the serve command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Files to publish, replacing `[publish].files`.
    pub files: Vec<PathBuf>,

    /// Also write the descriptors as JSON to this path.
    #[arg(long)]
    pub descriptors: Option<PathBuf>,
}

/// Arguments for the publish command.
#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Files to publish, replacing `[publish].files`.
    pub files: Vec<PathBuf>,

    /// Print one `key=value` record per file instead of JSON.
    #[arg(long)]
    pub records: bool,
}

/// Arguments for the fetch command.
#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Descriptor file, as written by `publish` or `serve --descriptors`.
    #[arg(short, long)]
    pub descriptor: PathBuf,

    /// Which file to fetch when the descriptor file lists several.
    #[arg(long)]
    pub file_id: Option<String>,

    /// Resolver as `host[:port]`; defaults to the system resolver.
    #[arg(short, long)]
    pub resolver: Option<String>,

    /// Output path; defaults to `dnslice_<file_id>` in the temp directory.
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}
