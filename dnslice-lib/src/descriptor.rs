//! The identity tuple a fetcher needs to download one published file.

#![forbid(unsafe_code)]

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    error::ClientError,
    mapping::{derive_file_tag, derive_slice_token, PublishItem},
    publish::derive_file_id,
    wire::{is_token_text, DIGEST_TEXT_CAPACITY},
};

pub const DESCRIPTOR_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub file_id: String,
    pub publish_version: String,
    pub file_tag: String,
    pub slice_tokens: Vec<String>,
    pub total_slices: usize,
    pub compressed_size: usize,
    pub plaintext_sha256: String,
    pub mapping_seed: String,
    pub slice_token_len: usize,
}

impl Descriptor {
    #[must_use]
    pub fn new(item: &PublishItem, config: &Config) -> Self {
        Self {
            file_id: item.file_id.clone(),
            publish_version: item.publish_version.clone(),
            file_tag: item.file_tag.clone(),
            slice_tokens: item.slice_tokens.clone(),
            total_slices: item.total_slices(),
            compressed_size: item.compressed_size,
            plaintext_sha256: item.plaintext_sha256.clone(),
            mapping_seed: config.mapping_seed.clone(),
            slice_token_len: item.slice_token_len,
        }
    }

    /// Checks the descriptor against what a fetcher derives on its own.
    ///
    /// # Errors
    /// Returns a usage error naming the first field that disagrees.
    pub fn verify(&self, file_tag_len: usize) -> Result<(), ClientError> {
        check_counts(self.total_slices, self.compressed_size, self.slice_token_len)?;
        if self.plaintext_sha256.len() != 64
            || !self.plaintext_sha256.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ClientError::usage("invalid_descriptor", "plaintext_sha256 is not a hex digest"));
        }
        if !is_token_text(&self.file_tag) {
            return Err(ClientError::usage("invalid_descriptor", "file_tag is not token text"));
        }
        if self.mapping_seed.is_empty() {
            return Err(ClientError::usage("invalid_descriptor", "mapping_seed is empty"));
        }

        if derive_file_id(&self.publish_version) != self.file_id {
            return Err(ClientError::usage(
                "descriptor_mismatch",
                format!("file_id {} does not match its publish_version", self.file_id),
            ));
        }
        if derive_file_tag(&self.mapping_seed, &self.publish_version, file_tag_len) != self.file_tag {
            return Err(ClientError::usage(
                "descriptor_mismatch",
                format!("file_tag {} does not match the mapping seed", self.file_tag),
            ));
        }
        if self.slice_tokens.len() != self.total_slices {
            return Err(ClientError::usage(
                "descriptor_mismatch",
                format!(
                    "{} slice tokens listed for {} slices",
                    self.slice_tokens.len(),
                    self.total_slices
                ),
            ));
        }
        for (index, token) in self.slice_tokens.iter().enumerate() {
            let derived = derive_slice_token(
                &self.mapping_seed,
                &self.publish_version,
                index,
                self.slice_token_len,
            );
            if *token != derived {
                return Err(ClientError::usage(
                    "descriptor_mismatch",
                    format!("slice token {index} does not match the mapping seed"),
                ));
            }
        }
        Ok(())
    }
}

/// Every slice carries at least one compressed byte, and a token is a prefix
/// of one digest's base32 text.
fn check_counts(
    total_slices: usize,
    compressed_size: usize,
    slice_token_len: usize,
) -> Result<(), ClientError> {
    let invalid = |message: String| Err(ClientError::usage("invalid_descriptor", message));
    if total_slices == 0 || u32::try_from(total_slices).is_err() {
        return invalid(format!("total_slices {total_slices} is out of range"));
    }
    if compressed_size == 0 {
        return invalid("compressed_size must be > 0".to_string());
    }
    if total_slices > compressed_size {
        return invalid(format!(
            "{total_slices} slices cannot carry {compressed_size} compressed bytes"
        ));
    }
    if slice_token_len == 0 || slice_token_len > DIGEST_TEXT_CAPACITY {
        return invalid(format!(
            "slice_token_len {slice_token_len} is outside 1..={DIGEST_TEXT_CAPACITY}"
        ));
    }
    Ok(())
}

/// `v=1 file_id=... slice_token_len=... mapping_seed=...`
///
/// Slice tokens are not written; they are re-derived on parse. The seed comes
/// last and runs to the end of the line since it may contain spaces.
impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v={DESCRIPTOR_VERSION} file_id={} publish_version={} file_tag={} total_slices={} compressed_size={} plaintext_sha256={} slice_token_len={} mapping_seed={}",
            self.file_id,
            self.publish_version,
            self.file_tag,
            self.total_slices,
            self.compressed_size,
            self.plaintext_sha256,
            self.slice_token_len,
            self.mapping_seed,
        )
    }
}

impl FromStr for Descriptor {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: String| ClientError::usage("invalid_descriptor", message);

        let line = s.trim_end_matches(['\r', '\n']);
        let (fields, mapping_seed) = line
            .split_once(" mapping_seed=")
            .ok_or_else(|| invalid("mapping_seed is missing".to_string()))?;

        let mut version = None;
        let mut file_id = None;
        let mut publish_version = None;
        let mut file_tag = None;
        let mut total_slices = None;
        let mut compressed_size = None;
        let mut plaintext_sha256 = None;
        let mut slice_token_len = None;

        for pair in fields.split_whitespace() {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid(format!("malformed field {pair:?}")))?;
            let number = || {
                value
                    .parse::<usize>()
                    .map_err(|e| invalid(format!("{key} is not a number: {e}")))
            };
            match key {
                "v" => version = Some(value.to_string()),
                "file_id" => file_id = Some(value.to_string()),
                "publish_version" => publish_version = Some(value.to_string()),
                "file_tag" => file_tag = Some(value.to_string()),
                "total_slices" => {
                    let count = value
                        .parse::<u32>()
                        .map_err(|e| invalid(format!("total_slices is out of range: {e}")))?;
                    total_slices = Some(count as usize);
                }
                "compressed_size" => compressed_size = Some(number()?),
                "plaintext_sha256" => plaintext_sha256 = Some(value.to_string()),
                "slice_token_len" => slice_token_len = Some(number()?),
                _ => (),
            }
        }

        if version.as_deref() != Some(DESCRIPTOR_VERSION) {
            return Err(invalid(format!("unsupported descriptor version {version:?}")));
        }
        let missing = |name: &str| invalid(format!("{name} is missing"));
        let publish_version = publish_version.ok_or_else(|| missing("publish_version"))?;
        let total_slices = total_slices.ok_or_else(|| missing("total_slices"))?;
        let slice_token_len = slice_token_len.ok_or_else(|| missing("slice_token_len"))?;
        let compressed_size = compressed_size.ok_or_else(|| missing("compressed_size"))?;
        check_counts(total_slices, compressed_size, slice_token_len)?;
        let slice_tokens = (0..total_slices)
            .map(|index| derive_slice_token(mapping_seed, &publish_version, index, slice_token_len))
            .collect();

        Ok(Self {
            file_id: file_id.ok_or_else(|| missing("file_id"))?,
            file_tag: file_tag.ok_or_else(|| missing("file_tag"))?,
            slice_tokens,
            total_slices,
            compressed_size,
            plaintext_sha256: plaintext_sha256.ok_or_else(|| missing("plaintext_sha256"))?,
            mapping_seed: mapping_seed.to_string(),
            slice_token_len,
            publish_version,
        })
    }
}
