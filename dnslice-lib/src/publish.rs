//! The publish pipeline.
//!
//! Each source file is hashed, compressed with Snappy, addressed by the
//! hash of its compressed bytes and split into fixed-size slices. The
//! resulting [`PublishedFile`] values are immutable.

#![forbid(unsafe_code)]

use std::{collections::HashSet, path::Path};

use securefmt::Debug;
use tracing::debug;

use crate::{
    error::{Phase, StartupError, StartupReason},
    wire::FILE_ID_LABEL,
};

/// Hex characters kept from the file id digest.
pub const FILE_ID_LEN: usize = 16;

/// A file read from disk, or built in memory, awaiting publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Stable identity of the source, usually its canonical path.
    pub identity: String,
    #[sensitive]
    pub bytes: Vec<u8>,
}

impl SourceFile {
    /// Reads a file, identified by its canonical path.
    ///
    /// # Errors
    /// Returns `unreadable_file` if the path cannot be resolved or read.
    pub fn read(path: &Path) -> Result<Self, StartupError> {
        let unreadable = |e: std::io::Error| {
            StartupError::new(
                Phase::Publish,
                StartupReason::UnreadableFile,
                format!("failed to read {}: {e}", path.display()),
            )
        };
        let canonical = path.canonicalize().map_err(unreadable)?;
        let bytes = std::fs::read(&canonical).map_err(unreadable)?;
        Ok(Self {
            identity: canonical.to_string_lossy().into_owned(),
            bytes,
        })
    }

    pub fn from_bytes(identity: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            identity: identity.into(),
            bytes: bytes.into(),
        }
    }
}

/// A published, sliced file. Never mutated after the publish phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFile {
    pub file_id: String,
    pub publish_version: String,
    pub plaintext_sha256: String,
    pub compressed_size: usize,
    #[sensitive]
    pub slices: Vec<Vec<u8>>,
}

impl PublishedFile {
    #[must_use]
    pub fn total_slices(&self) -> usize {
        self.slices.len()
    }
}

/// Derives the 16-hex-character file id from a publish version.
#[must_use]
pub fn derive_file_id(publish_version: &str) -> String {
    let mut file_id = sha256::digest(format!("{FILE_ID_LABEL}{publish_version}").as_bytes());
    file_id.truncate(FILE_ID_LEN);
    file_id
}

fn publish_error(reason: StartupReason, message: impl Into<String>) -> StartupError {
    StartupError::new(Phase::Publish, reason, message)
}

/// Publishes every source with slices of at most `max_slice_bytes`.
///
/// Either every file is published or none is.
///
/// # Errors
/// Returns a publish-phase startup error for a non-positive budget, a
/// repeated source, repeated plaintext, a compression failure, or a file id
/// collision.
pub fn build_publish_items(
    sources: &[SourceFile],
    max_slice_bytes: usize,
) -> Result<Vec<PublishedFile>, StartupError> {
    if max_slice_bytes == 0 {
        return Err(publish_error(
            StartupReason::BudgetUnusable,
            "max_ciphertext_slice_bytes must be positive",
        ));
    }

    let mut seen_sources = HashSet::new();
    let mut seen_plaintext = HashSet::new();
    let mut seen_file_ids = HashSet::new();
    let mut published = Vec::with_capacity(sources.len());

    for (file_index, source) in sources.iter().enumerate() {
        if !seen_sources.insert(source.identity.as_str()) {
            return Err(publish_error(
                StartupReason::DuplicateSource,
                format!("source {} is listed twice", source.identity),
            ));
        }

        let plaintext_sha256 = sha256::digest(source.bytes.as_slice());
        if !seen_plaintext.insert(plaintext_sha256.clone()) {
            return Err(publish_error(
                StartupReason::DuplicatePlaintextSha256,
                format!("duplicate file content detected ({plaintext_sha256})"),
            ));
        }

        let compressed = snap::raw::Encoder::new()
            .compress_vec(&source.bytes)
            .map_err(|e| {
                publish_error(
                    StartupReason::CompressionFailed,
                    format!("compression of file {file_index} failed: {e}"),
                )
            })?;
        if compressed.is_empty() {
            return Err(publish_error(
                StartupReason::CompressionEmpty,
                format!("compression of file {file_index} produced empty output"),
            ));
        }

        let publish_version = sha256::digest(compressed.as_slice());
        let file_id = derive_file_id(&publish_version);
        if !seen_file_ids.insert(file_id.clone()) {
            return Err(publish_error(
                StartupReason::FileIdCollision,
                format!("file_id {file_id} collides across the publish set"),
            ));
        }

        let slices: Vec<Vec<u8>> = compressed
            .chunks(max_slice_bytes)
            .map(<[u8]>::to_vec)
            .collect();
        if slices.is_empty() || u32::try_from(slices.len()).is_err() {
            return Err(publish_error(
                StartupReason::InvalidSliceCount,
                format!("file_id {file_id} has an invalid slice count"),
            ));
        }

        debug!(
            phase = "publish",
            file_index,
            file_id,
            publish_version,
            compressed_size = compressed.len(),
            total_slices = slices.len(),
            "publish item built"
        );

        published.push(PublishedFile {
            file_id,
            publish_version,
            plaintext_sha256,
            compressed_size: compressed.len(),
            slices,
        });
    }

    Ok(published)
}
