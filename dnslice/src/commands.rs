//! Command handlers for the dnslice CLI.
//!
//! This module contains the implementation of each CLI command,
//! keeping the main module focused on argument parsing and setup.

#![forbid(unsafe_code)]

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::eyre::{Result, WrapErr};
use dnslice_lib::{
    client::{default_output_path, discover_system_resolver, parse_resolver, write_output},
    fetch, ClientError, Descriptor, RuntimeState, Server, SourceFile, StartupError, UdpTransport,
};
use tracing::info;

use crate::config::Config;

/// Context for CLI operations.
///
/// Bundles the loaded file configuration with the validated protocol
/// configuration built from its `[dns]` table.
pub struct CommandContext<'a> {
    /// Configuration loaded from config.toml.
    pub config: &'a Config,
    /// Validated protocol configuration.
    pub dns: dnslice_lib::Config,
}

impl<'a> CommandContext<'a> {
    /// Creates a new command context.
    ///
    /// # Errors
    ///
    /// Returns an `invalid_config` error if the `[dns]` table is invalid.
    pub fn new(config: &'a Config) -> Result<Self, StartupError> {
        let dns = dnslice_lib::Config::from_settings(&config.dns)?;
        Ok(Self { config, dns })
    }

    /// Files given on the command line, or the configured ones.
    pub fn files<'b>(&'b self, overrides: &'b [PathBuf]) -> &'b [PathBuf] {
        if overrides.is_empty() {
            &self.config.publish.files
        } else {
            overrides
        }
    }

    /// Reads the sources and runs the startup pipeline.
    ///
    /// # Errors
    ///
    /// Returns the first startup error.
    pub fn build_state(&self, files: &[PathBuf]) -> Result<RuntimeState, StartupError> {
        if files.is_empty() {
            return Err(StartupError::config("no files to publish"));
        }
        let sources = files
            .iter()
            .map(|path| SourceFile::read(path))
            .collect::<Result<Vec<_>, _>>()?;
        RuntimeState::build(self.dns.clone(), &sources)
    }
}

fn descriptors(state: &RuntimeState) -> Vec<Descriptor> {
    state
        .items()
        .iter()
        .map(|item| Descriptor::new(item, state.config()))
        .collect()
}

/// Publishes the files and serves them until Ctrl-C.
pub async fn serve(
    ctx: &CommandContext<'_>,
    files: &[PathBuf],
    descriptors_out: Option<&Path>,
) -> Result<()> {
    let state = ctx.build_state(ctx.files(files))?;

    if let Some(path) = descriptors_out {
        let json = serde_json::to_string_pretty(&descriptors(&state))?;
        std::fs::write(path, json)
            .wrap_err_with(|| format!("Failed to write descriptors to {}", path.display()))?;
        info!(path = %path.display(), "descriptors written");
    }

    let server = Server::bind(state).await?;
    server
        .run(async {
            // An unavailable signal handler leaves the server running.
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}

/// Runs the startup pipeline and prints the descriptors to stdout.
pub fn publish(ctx: &CommandContext<'_>, files: &[PathBuf], records: bool) -> Result<()> {
    let state = ctx.build_state(ctx.files(files))?;
    let descriptors = descriptors(&state);

    let mut stdout = io::stdout().lock();
    if records {
        for descriptor in &descriptors {
            writeln!(stdout, "{descriptor}")?;
        }
    } else {
        writeln!(stdout, "{}", serde_json::to_string_pretty(&descriptors)?)?;
    }
    Ok(())
}

/// Loads descriptors from JSON (one object or a list) or record lines.
///
/// # Errors
///
/// Returns a usage error if the file cannot be read or parsed.
pub fn load_descriptors(path: &Path) -> Result<Vec<Descriptor>, ClientError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ClientError::usage(
            "invalid_descriptor",
            format!("failed to read {}: {e}", path.display()),
        )
    })?;

    if let Ok(list) = serde_json::from_str::<Vec<Descriptor>>(&content) {
        return Ok(list);
    }
    if let Ok(single) = serde_json::from_str::<Descriptor>(&content) {
        return Ok(vec![single]);
    }
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Picks the descriptor for `file_id`, or the only one present.
///
/// # Errors
///
/// Returns a usage error if no descriptor or several descriptors match.
pub fn select_descriptor(
    descriptors: Vec<Descriptor>,
    file_id: Option<&str>,
) -> Result<Descriptor, ClientError> {
    let mut matching: Vec<Descriptor> = descriptors
        .into_iter()
        .filter(|descriptor| file_id.map_or(true, |id| descriptor.file_id == id))
        .collect();
    match (matching.pop(), matching.is_empty()) {
        (Some(descriptor), true) => Ok(descriptor),
        (None, _) => Err(ClientError::usage(
            "descriptor_not_found",
            "no descriptor matches the requested file",
        )),
        (Some(_), false) => Err(ClientError::usage(
            "ambiguous_descriptor",
            "several descriptors present; pass --file-id",
        )),
    }
}

/// Fetches one file and writes it out, returning the output path.
///
/// # Errors
///
/// Returns the categorized client error; its exit code is the process status.
pub async fn fetch_file(
    ctx: &CommandContext<'_>,
    args: &crate::cli::FetchArgs,
) -> Result<PathBuf, ClientError> {
    let descriptor = select_descriptor(
        load_descriptors(&args.descriptor)?,
        args.file_id.as_deref(),
    )?;

    let resolver = match args.resolver.as_deref() {
        Some(raw) => parse_resolver(raw)?,
        None => discover_system_resolver()?,
    };
    let out = args
        .out
        .clone()
        .unwrap_or_else(|| default_output_path(&descriptor.file_id));
    info!(
        file_id = descriptor.file_id,
        %resolver,
        total_slices = descriptor.total_slices,
        "fetching"
    );

    let client = &ctx.config.client;
    let mut transport = UdpTransport::new(
        resolver,
        Duration::from_millis(client.request_timeout_ms),
        ctx.dns.dns_edns_size,
    );
    let plaintext = fetch(&ctx.dns, &descriptor, client, &mut transport).await?;
    write_output(&out, &plaintext)?;
    info!(path = %out.display(), bytes = plaintext.len(), "file written");
    Ok(out)
}
