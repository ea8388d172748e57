//! Deterministic file-tag and slice-token derivation.
//!
//! Tags and tokens are prefixes of the base32 text of an HMAC keyed by the
//! mapping seed, so no file name or slice index ever appears on the wire.
//! Token lengths start at the shortest length that is unique within a file
//! and are promoted one file at a time, in canonical order, until every
//! `(file_tag, slice_token)` key in the publish set is unique.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use securefmt::Debug;
use tracing::debug;

use crate::{
    config::Config,
    error::{Phase, StartupError, StartupReason},
    publish::PublishedFile,
    wire::{
        base32_encode, hmac_sha256, DIGEST_TEXT_CAPACITY, MAPPING_FILE_LABEL,
        MAPPING_SLICE_LABEL, MAX_DNS_NAME_WIRE_LENGTH,
    },
};

/// A published file together with its query labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishItem {
    pub file_id: String,
    pub publish_version: String,
    pub plaintext_sha256: String,
    pub compressed_size: usize,
    #[sensitive]
    pub slices: Vec<Vec<u8>>,
    pub file_tag: String,
    pub slice_tokens: Vec<String>,
    pub slice_token_len: usize,
}

impl PublishItem {
    #[must_use]
    pub fn total_slices(&self) -> usize {
        self.slices.len()
    }
}

fn digest_prefix(digest: &[u8; 32], len: usize) -> String {
    let mut text = base32_encode(digest);
    text.truncate(len);
    text
}

/// `base32(HMAC(seed, "file:v1|" + publish_version))[:len]`
#[must_use]
pub fn derive_file_tag(seed: &str, publish_version: &str, len: usize) -> String {
    let digest = hmac_sha256(
        seed.as_bytes(),
        &[MAPPING_FILE_LABEL, publish_version.as_bytes()],
    );
    digest_prefix(&digest, len)
}

/// `base32(HMAC(seed, "slice:v1|" + publish_version + "|" + index))[:len]`
#[must_use]
pub fn derive_slice_token(seed: &str, publish_version: &str, slice_index: usize, len: usize) -> String {
    let index = slice_index.to_string();
    let digest = hmac_sha256(
        seed.as_bytes(),
        &[
            MAPPING_SLICE_LABEL,
            publish_version.as_bytes(),
            b"|".as_slice(),
            index.as_bytes(),
        ],
    );
    digest_prefix(&digest, len)
}

/// Tokens for every slice of a file at one token length.
#[must_use]
pub fn derive_slice_tokens(
    seed: &str,
    publish_version: &str,
    total_slices: usize,
    len: usize,
) -> Vec<String> {
    (0..total_slices)
        .map(|index| derive_slice_token(seed, publish_version, index, len))
        .collect()
}

/// Longest token that still lets `<token>.<tag>.<longest domain>` fit.
fn max_token_len(config: &Config, file_tag: &str) -> usize {
    let by_qname = MAX_DNS_NAME_WIRE_LENGTH
        .saturating_sub(config.longest_domain().wire_len())
        .saturating_sub(1 + file_tag.len())
        .saturating_sub(1);
    config
        .dns_max_label_len
        .min(DIGEST_TEXT_CAPACITY)
        .min(by_qname)
}

fn mapping_error(reason: StartupReason, message: impl Into<String>) -> StartupError {
    StartupError::new(Phase::Mapping, reason, message)
}

struct Candidate {
    file: PublishedFile,
    file_tag: String,
    tokens: Vec<String>,
    token_len: usize,
    max_len: usize,
}

/// Indices of every file owning a key that another file also owns.
fn colliding_files(candidates: &[Candidate]) -> HashSet<usize> {
    let mut owners: HashMap<(&str, &str), usize> = HashMap::new();
    let mut colliding = HashSet::new();
    for (index, candidate) in candidates.iter().enumerate() {
        for token in &candidate.tokens {
            match owners.get(&(candidate.file_tag.as_str(), token.as_str())) {
                Some(&owner) => {
                    colliding.insert(owner);
                    colliding.insert(index);
                }
                None => {
                    owners.insert((candidate.file_tag.as_str(), token.as_str()), index);
                }
            }
        }
    }
    colliding
}

/// Assigns a file tag and collision-free slice tokens to every file.
///
/// The output keeps the input order. Identical inputs always produce
/// identical tags, token lengths and tokens, or the identical error.
///
/// # Errors
/// Returns `mapping_capacity_exceeded` when no token fits the query name,
/// and `mapping_collision` when a collision cannot be resolved within the
/// token length limit.
pub fn apply_mapping(
    published: Vec<PublishedFile>,
    config: &Config,
) -> Result<Vec<PublishItem>, StartupError> {
    let seed = config.mapping_seed.as_str();
    let mut candidates = Vec::with_capacity(published.len());

    for file in published {
        let file_tag = derive_file_tag(seed, &file.publish_version, config.file_tag_len);
        if file_tag.is_empty() {
            return Err(mapping_error(
                StartupReason::MappingCapacityExceeded,
                format!("file_tag for {} is empty", file.file_id),
            ));
        }

        let max_len = max_token_len(config, &file_tag);
        if max_len == 0 {
            return Err(mapping_error(
                StartupReason::MappingCapacityExceeded,
                format!("query name limits leave no room for a slice token ({})", file.file_id),
            ));
        }

        let total = file.total_slices();
        let local = (1..=max_len).find_map(|len| {
            let tokens = derive_slice_tokens(seed, &file.publish_version, total, len);
            let unique = tokens.iter().collect::<HashSet<_>>().len() == total;
            unique.then_some((len, tokens))
        });
        let Some((token_len, tokens)) = local else {
            return Err(mapping_error(
                StartupReason::MappingCollision,
                format!("slice tokens of {} collide at every length up to {max_len}", file.file_id),
            ));
        };

        candidates.push(Candidate {
            file,
            file_tag,
            tokens,
            token_len,
            max_len,
        });
    }

    let mut canonical: Vec<usize> = (0..candidates.len()).collect();
    canonical.sort_by(|&a, &b| {
        let key = |c: &Candidate| {
            (
                c.file_tag.clone(),
                c.file.file_id.clone(),
                c.file.publish_version.clone(),
            )
        };
        key(&candidates[a]).cmp(&key(&candidates[b]))
    });

    loop {
        let colliding = colliding_files(&candidates);
        if colliding.is_empty() {
            break;
        }
        let Some(&promote) = canonical.iter().find(|index| colliding.contains(*index)) else {
            return Err(mapping_error(
                StartupReason::MappingCollision,
                "collision set could not be resolved deterministically",
            ));
        };

        let candidate = &mut candidates[promote];
        if candidate.token_len >= candidate.max_len {
            return Err(mapping_error(
                StartupReason::MappingCollision,
                format!(
                    "unresolved collision for {} (file_tag={}, slice_token_len={}, max={})",
                    candidate.file.file_id, candidate.file_tag, candidate.token_len, candidate.max_len
                ),
            ));
        }
        candidate.token_len += 1;
        candidate.tokens = derive_slice_tokens(
            seed,
            &candidate.file.publish_version,
            candidate.file.total_slices(),
            candidate.token_len,
        );
        debug!(
            phase = "mapping",
            file_id = candidate.file.file_id,
            slice_token_len = candidate.token_len,
            "promoted slice token length"
        );
    }

    Ok(candidates
        .into_iter()
        .map(|candidate| PublishItem {
            file_id: candidate.file.file_id,
            publish_version: candidate.file.publish_version,
            plaintext_sha256: candidate.file.plaintext_sha256,
            compressed_size: candidate.file.compressed_size,
            slices: candidate.file.slices,
            file_tag: candidate.file_tag,
            slice_tokens: candidate.tokens,
            slice_token_len: candidate.token_len,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{tests::test_settings, Settings};

    fn published(publish_version: &str, total_slices: usize) -> PublishedFile {
        PublishedFile {
            file_id: crate::publish::derive_file_id(publish_version),
            publish_version: publish_version.to_string(),
            plaintext_sha256: sha256::digest(publish_version.as_bytes()),
            compressed_size: total_slices,
            slices: vec![vec![0]; total_slices],
        }
    }

    fn config_with(settings: Settings) -> Config {
        Config::from_settings(&settings).expect("Should build config")
    }

    #[test]
    fn test_derivations_are_deterministic() {
        let tag = derive_file_tag("0", "abc", 6);
        assert_eq!(tag, derive_file_tag("0", "abc", 6));
        assert_eq!(tag.len(), 6);
        assert!(crate::wire::is_token_text(&tag));
        assert_ne!(tag, derive_file_tag("1", "abc", 6));

        let token = derive_slice_token("0", "abc", 3, 52);
        assert_eq!(token.len(), 52);
        assert!(token.starts_with(&derive_slice_token("0", "abc", 3, 4)));
        assert_ne!(token, derive_slice_token("0", "abc", 4, 52));
    }

    #[test]
    fn test_tokens_unique_within_file() {
        let config = config_with(test_settings());
        let items = apply_mapping(vec![published("v1", 500)], &config).expect("Should map");
        let item = &items[0];

        let unique: HashSet<_> = item.slice_tokens.iter().collect();
        assert_eq!(unique.len(), 500);
        assert!(item.slice_tokens.iter().all(|t| t.len() == item.slice_token_len));
        // 500 tokens cannot be unique with a single base32 character
        assert!(item.slice_token_len >= 2);

        let shorter = derive_slice_tokens("0", "v1", 500, item.slice_token_len - 1);
        assert!(shorter.iter().collect::<HashSet<_>>().len() < 500);
    }

    #[test]
    fn test_mapping_keeps_input_order() {
        let config = config_with(test_settings());
        let items = apply_mapping(vec![published("v1", 3), published("v2", 3)], &config)
            .expect("Should map");
        assert_eq!(items[0].publish_version, "v1");
        assert_eq!(items[1].publish_version, "v2");
    }

    #[test]
    fn test_forced_tag_collision_yields_unique_keys() {
        // With 4-character tags, files sharing a tag force cross-file checks.
        let config = config_with(Settings {
            file_tag_len: 4,
            ..test_settings()
        });
        let versions: Vec<String> = (0..20_000).map(|i| format!("v{i}")).collect();
        let mut by_tag: HashMap<String, Vec<&String>> = HashMap::new();
        for version in &versions {
            by_tag
                .entry(derive_file_tag("0", version, 4))
                .or_default()
                .push(version);
        }
        let pair = by_tag
            .values()
            .find(|group| group.len() >= 2)
            .expect("20000 versions should share a 4-character tag");

        let files = vec![published(pair[0], 64), published(pair[1], 64)];
        let items = apply_mapping(files.clone(), &config).expect("Should map");
        let again = apply_mapping(files, &config).expect("Should map");
        assert_eq!(items, again);
        assert_eq!(items[0].file_tag, items[1].file_tag);

        let mut keys = HashSet::new();
        for item in &items {
            for token in &item.slice_tokens {
                assert!(keys.insert((item.file_tag.clone(), token.clone())));
            }
        }
    }

    /// Files with one publish_version share their tag and every token.
    fn sharing_version(file_id: &str, total_slices: usize) -> PublishedFile {
        PublishedFile {
            file_id: file_id.to_string(),
            ..published(&"b".repeat(64), total_slices)
        }
    }

    /// A domain this long leaves room for single-character tokens only.
    fn single_char_token_config() -> Config {
        let domain = format!(
            "{}.{}.{}.{}",
            "a".repeat(63),
            "b".repeat(63),
            "c".repeat(63),
            "d".repeat(54)
        );
        let config = config_with(Settings {
            domains: vec![domain],
            file_tag_len: 4,
            dns_max_label_len: 63,
            ..test_settings()
        });
        assert_eq!(max_token_len(&config, "abcd"), 1);
        config
    }

    #[test]
    fn test_collision_promotes_canonically_first_file() {
        let config = config_with(test_settings());
        let low = "0".repeat(16);
        let high = "f".repeat(16);

        // Input order is the reverse of canonical order.
        let files = vec![sharing_version(&high, 1), sharing_version(&low, 1)];
        let items = apply_mapping(files.clone(), &config).expect("Should map");

        assert_eq!(items[0].file_id, high);
        assert_eq!(items[0].slice_token_len, 1);
        assert_eq!(items[1].file_id, low);
        assert_eq!(items[1].slice_token_len, 2);
        assert_eq!(items[0].file_tag, items[1].file_tag);
        assert!(items[1].slice_tokens[0].starts_with(&items[0].slice_tokens[0]));

        assert_eq!(apply_mapping(files, &config).expect("Should map"), items);
    }

    #[test]
    fn test_cross_file_collision_beyond_limit_fails() {
        let config = single_char_token_config();
        let files = vec![
            sharing_version(&"f".repeat(16), 1),
            sharing_version(&"0".repeat(16), 1),
        ];

        let err = apply_mapping(files.clone(), &config).expect_err("Should fail");
        assert_eq!(err.phase, Phase::Mapping);
        assert_eq!(err.reason, StartupReason::MappingCollision);
        assert!(err.to_string().contains(&"0".repeat(16)));

        let again = apply_mapping(files, &config).expect_err("Should fail again");
        assert_eq!(again, err);
    }

    #[test]
    fn test_slice_count_boundary_at_token_limit() {
        let config = single_char_token_config();
        let seed = config.mapping_seed.as_str();

        // The first index whose one-character token repeats an earlier one.
        let mut seen = HashSet::new();
        let boundary = (0..)
            .find(|&index| !seen.insert(derive_slice_token(seed, "v1", index, 1)))
            .expect("33 tokens cannot be distinct in 32 characters");
        assert!(boundary <= 32);

        let items = apply_mapping(vec![published("v1", boundary)], &config)
            .expect("Should map at the boundary");
        assert_eq!(items[0].slice_token_len, 1);
        assert_eq!(items[0].total_slices(), boundary);

        let err = apply_mapping(vec![published("v1", boundary + 1)], &config)
            .expect_err("Should fail one slice past the boundary");
        assert_eq!(err.reason, StartupReason::MappingCollision);
    }

    #[test]
    fn test_unresolvable_collision_fails() {
        let config = single_char_token_config();

        // 33 slices cannot have unique single-character tokens.
        let err = apply_mapping(vec![published("v1", 33)], &config).expect_err("Should fail");
        assert_eq!(err.phase, Phase::Mapping);
        assert_eq!(err.reason, StartupReason::MappingCollision);
    }

    #[test]
    fn test_no_token_room_exceeds_capacity() {
        let domain = format!(
            "{}.{}.{}.{}",
            "a".repeat(63),
            "b".repeat(63),
            "c".repeat(63),
            "d".repeat(55)
        );
        let config = config_with(Settings {
            domains: vec![domain],
            file_tag_len: 4,
            ..test_settings()
        });
        let err = apply_mapping(vec![published("v1", 1)], &config).expect_err("Should fail");
        assert_eq!(err.reason, StartupReason::MappingCapacityExceeded);
    }
}
