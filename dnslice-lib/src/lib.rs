//! dnslice library - files served through DNS CNAME answers
//!
//! A library for publishing files behind an authoritative DNS server and
//! fetching them back through ordinary recursive resolvers.
//!
//! # Overview
//!
//! Each file is compressed with Snappy and cut into slices sized so that one
//! slice fits one CNAME answer. Every slice is sealed with encrypt-then-MAC
//! under keys bound to the file, base32 encoded and addressed by a short
//! pseudorandom `<slice_token>.<file_tag>.<domain>` name. The server answers
//! from an immutable lookup built once at startup; the client derives the
//! same names, verifies every slice and reassembles the file.
//!
//! # Modules
//!
//! - [`budget`]: Largest slice that fits one response
//! - [`client`]: Query loop, response validation and reassembly
//! - [`config`]: Validated deployment configuration
//! - [`descriptor`]: The identity tuple a fetcher needs
//! - [`dns`]: DNS wire codec
//! - [`error`]: Error types
//! - [`mapping`]: File tags and slice tokens
//! - [`payload`]: Per-slice authenticated encryption
//! - [`publish`]: Compression, slicing and content identifiers
//! - [`server`]: Request classification and the UDP loop
//! - [`state`]: Startup convergence and the runtime lookup
//! - [`wire`]: Shared constants and encodings
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use dnslice_lib::{Config, RuntimeState, Server, Settings, SourceFile};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings {
//!     domains: vec!["example.com".to_string()],
//!     psk: "s3cr3t".to_string(),
//!     ..Settings::default()
//! };
//! let config = Config::from_settings(&settings)?;
//! let sources = vec![SourceFile::read(Path::new("example.txt"))?];
//! let state = RuntimeState::build(config, &sources)?;
//!
//! let counters = Server::bind(state)
//!     .await?
//!     .run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await;
//! println!("served {} slices", counters.served);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod budget;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod dns;
pub mod error;
pub mod mapping;
pub mod payload;
pub mod publish;
pub mod server;
pub mod state;
pub mod wire;


// Re-export commonly used types at the crate root
pub use client::{fetch, ClientSettings, Transport, UdpTransport};
pub use config::{Config, Settings};
pub use descriptor::Descriptor;
pub use error::{ClientError, ClientErrorKind, StartupError};
pub use publish::SourceFile;
pub use server::{handle_datagram, Outcome, Server};
pub use state::RuntimeState;
