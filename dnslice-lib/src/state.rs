//! The immutable runtime state the server answers from.
//!
//! [`RuntimeState::build`] runs the whole startup pipeline: budget, publish
//! and mapping are repeated until the slice token length the budget assumed
//! covers every realized token, then the lookup indexes are built and a
//! serving self-check is run. Nothing in the state changes afterwards.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use tracing::{debug, info};

use crate::{
    budget::{compute_budget, Budget},
    config::Config,
    dns::{self, Rcode},
    error::{Phase, StartupError, StartupReason},
    mapping::{apply_mapping, PublishItem},
    payload::SliceCipher,
    publish::{build_publish_items, SourceFile, FILE_ID_LEN},
};

/// Upper bound on budget/publish/mapping rounds before startup gives up.
pub const MAX_STARTUP_ITERATIONS: usize = 8;

/// The globally unique `(file_tag, slice_token)` lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub file_tag: String,
    pub slice_token: String,
}

impl MappingKey {
    pub fn new(file_tag: impl Into<String>, slice_token: impl Into<String>) -> Self {
        Self {
            file_tag: file_tag.into(),
            slice_token: slice_token.into(),
        }
    }
}

/// `(file_id, publish_version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub file_id: String,
    pub publish_version: String,
}

/// Where a mapping key points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceRef {
    pub identity: FileIdentity,
    pub slice_index: usize,
}

/// Serving metadata for one published file.
#[derive(Debug, Clone)]
pub struct FileEntry {
    item: usize,
    pub total_slices: usize,
    pub compressed_size: usize,
    pub cipher: SliceCipher,
}

#[derive(Debug, Clone)]
pub struct RuntimeState {
    config: Config,
    budget: Budget,
    items: Vec<PublishItem>,
    lookup: HashMap<MappingKey, SliceRef>,
    files: HashMap<FileIdentity, FileEntry>,
}

fn startup_error(phase: Phase, reason: StartupReason, message: impl Into<String>) -> StartupError {
    StartupError::new(phase, reason, message)
}

impl RuntimeState {
    /// Runs the bounded startup convergence loop and builds the state.
    ///
    /// # Errors
    ///
    /// Returns the first startup error raised by any phase, or
    /// `startup_not_converged` when the token length keeps growing.
    pub fn build(config: Config, sources: &[SourceFile]) -> Result<Self, StartupError> {
        let mut query_token_len = 1;
        for iteration in 1..=MAX_STARTUP_ITERATIONS {
            let budget = compute_budget(&config, query_token_len)?;
            let published = build_publish_items(sources, budget.max_ciphertext_slice_bytes)?;
            let items = apply_mapping(published, &config)?;

            let realized = items
                .iter()
                .map(|item| item.slice_token_len)
                .max()
                .unwrap_or(1);
            debug!(
                phase = "startup",
                iteration,
                query_token_len,
                realized_max_token_len = realized,
                max_ciphertext_slice_bytes = budget.max_ciphertext_slice_bytes,
                "startup iteration"
            );

            if realized <= query_token_len {
                let state = Self::from_parts(config, budget, items)?;
                state.self_check()?;
                for item in &state.items {
                    info!(
                        file_id = item.file_id,
                        publish_version = item.publish_version,
                        file_tag = item.file_tag,
                        total_slices = item.total_slices(),
                        compressed_size = item.compressed_size,
                        slice_token_len = item.slice_token_len,
                        plaintext_sha256 = item.plaintext_sha256,
                        "file published"
                    );
                }
                return Ok(state);
            }
            query_token_len = realized;
        }

        Err(startup_error(
            Phase::Startup,
            StartupReason::StartupNotConverged,
            format!("slice token length did not settle within {MAX_STARTUP_ITERATIONS} iterations"),
        ))
    }

    /// Builds the lookup indexes from mapped items.
    ///
    /// # Errors
    ///
    /// Returns `duplicate_publish_identity` or `mapping_collision` if the
    /// items do not form a consistent publish set.
    pub fn from_parts(
        config: Config,
        budget: Budget,
        items: Vec<PublishItem>,
    ) -> Result<Self, StartupError> {
        let mut lookup = HashMap::new();
        let mut files = HashMap::new();

        for (index, item) in items.iter().enumerate() {
            let identity = FileIdentity {
                file_id: item.file_id.clone(),
                publish_version: item.publish_version.clone(),
            };
            let entry = FileEntry {
                item: index,
                total_slices: item.total_slices(),
                compressed_size: item.compressed_size,
                cipher: SliceCipher::new(
                    &config.psk,
                    &item.file_id,
                    &item.publish_version,
                    item.total_slices(),
                    item.compressed_size,
                ),
            };
            if files.insert(identity.clone(), entry).is_some() {
                return Err(startup_error(
                    Phase::Publish,
                    StartupReason::DuplicatePublishIdentity,
                    format!("duplicate publish identity {}", item.file_id),
                ));
            }

            for (slice_index, token) in item.slice_tokens.iter().enumerate() {
                let key = MappingKey::new(item.file_tag.as_str(), token.as_str());
                let target = SliceRef {
                    identity: identity.clone(),
                    slice_index,
                };
                if lookup.insert(key, target).is_some() {
                    return Err(startup_error(
                        Phase::Mapping,
                        StartupReason::MappingCollision,
                        format!("lookup key {}.{} is not unique", token, item.file_tag),
                    ));
                }
            }
        }

        Ok(Self {
            config,
            budget,
            items,
            lookup,
            files,
        })
    }

    /// Encodes a worst-case response and checks it against the limits.
    fn self_check(&self) -> Result<(), StartupError> {
        let invalid = |message: String| {
            startup_error(Phase::Startup, StartupReason::ServerRuntimeInvalid, message)
        };
        let config = &self.config;
        let domain = config.longest_domain();

        let mut qname = vec![
            "a".repeat(self.budget.query_token_len),
            "a".repeat(config.file_tag_len),
        ];
        qname.extend(domain.labels.iter().cloned());
        let query = dns::build_query(0, &qname, self.edns_size())
            .map_err(|e| invalid(format!("probe query: {e}")))?;
        let request = dns::parse_request(&query).map_err(|e| invalid(format!("probe query: {e}")))?;

        let probe_version = "0".repeat(64);
        let probe_size = self.budget.max_ciphertext_slice_bytes;
        let cipher = SliceCipher::new(
            &config.psk,
            &"0".repeat(FILE_ID_LEN),
            &probe_version,
            1,
            probe_size,
        );
        let labels = cipher
            .payload_labels(0, &vec![0; probe_size], config.dns_max_label_len)
            .map_err(|e| invalid(format!("probe payload: {e}")))?;
        let answer = dns::cname_answer(&qname, 2, &labels, &config.response_label, config.ttl)
            .map_err(|e| invalid(format!("probe answer: {e}")))?;
        let response = dns::build_response(&request, Rcode::NoError, Some(&answer), self.edns_size())
            .map_err(|e| invalid(format!("probe response: {e}")))?;

        if response.len() > self.budget.response_size_limit {
            return Err(invalid(format!(
                "probe response of {} bytes exceeds the {} byte limit",
                response.len(),
                self.budget.response_size_limit
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn budget(&self) -> &Budget {
        &self.budget
    }

    #[must_use]
    pub fn items(&self) -> &[PublishItem] {
        &self.items
    }

    /// Advertised EDNS size for responses, if EDNS is enabled.
    #[must_use]
    pub fn edns_size(&self) -> Option<u16> {
        self.config
            .edns_enabled()
            .then(|| u16::try_from(self.config.dns_edns_size).unwrap_or(u16::MAX))
    }

    #[must_use]
    pub fn resolve(&self, key: &MappingKey) -> Option<&SliceRef> {
        self.lookup.get(key)
    }

    #[must_use]
    pub fn file(&self, identity: &FileIdentity) -> Option<&FileEntry> {
        self.files.get(identity)
    }

    /// The canonical slice table of a file.
    #[must_use]
    pub fn slice_table(&self, entry: &FileEntry) -> &[Vec<u8>] {
        match self.items.get(entry.item) {
            Some(item) => item.slices.as_slice(),
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{tests::test_settings, Settings};

    fn sources() -> Vec<SourceFile> {
        vec![
            SourceFile::from_bytes("hello", b"hello world".repeat(1000)),
            SourceFile::from_bytes("counter", (0..20_000u32).flat_map(u32::to_be_bytes).collect::<Vec<u8>>()),
        ]
    }

    #[test]
    fn test_build_indexes_every_slice() {
        let config = Config::from_settings(&test_settings()).expect("Should build config");
        let state = RuntimeState::build(config, &sources()).expect("Should build state");

        for item in state.items() {
            assert!(item.slice_token_len <= state.budget().query_token_len);
            for (index, token) in item.slice_tokens.iter().enumerate() {
                let target = state
                    .resolve(&MappingKey::new(item.file_tag.as_str(), token.as_str()))
                    .expect("Should resolve");
                assert_eq!(target.identity.file_id, item.file_id);
                assert_eq!(target.slice_index, index);

                let entry = state.file(&target.identity).expect("Should find file");
                assert_eq!(state.slice_table(entry)[index], item.slices[index]);
            }
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let first = RuntimeState::build(
            Config::from_settings(&test_settings()).expect("Should build config"),
            &sources(),
        )
        .expect("Should build state");
        let second = RuntimeState::build(
            Config::from_settings(&test_settings()).expect("Should build config"),
            &sources(),
        )
        .expect("Should build state");
        assert_eq!(first.items(), second.items());
        assert_eq!(first.budget(), second.budget());
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let config = Config::from_settings(&test_settings()).expect("Should build config");
        let budget = compute_budget(&config, 1).expect("Should compute budget");
        let published =
            build_publish_items(&[SourceFile::from_bytes("a", b"abc".to_vec())], 50).expect("Should publish");
        let items = apply_mapping(published, &config).expect("Should map");
        let doubled = vec![items[0].clone(), items[0].clone()];

        let err = RuntimeState::from_parts(config, budget, doubled).expect_err("Should fail");
        assert_eq!(err.reason, StartupReason::DuplicatePublishIdentity);
    }

    #[test]
    fn test_unusable_budget_blocks_startup() {
        let domain = ["a", "b", "c", "d"]
            .iter()
            .map(|c| c.repeat(60))
            .collect::<Vec<_>>()
            .join(".");
        let config = Config::from_settings(&Settings {
            domains: vec![domain],
            ..test_settings()
        })
        .expect("Should build config");
        let err = RuntimeState::build(config, &sources()).expect_err("Should fail");
        assert_eq!(err.reason, StartupReason::BudgetUnusable);
    }

    #[test]
    fn test_classic_packet_limit_passes_self_check() {
        let config = Config::from_settings(&Settings {
            dns_edns_size: 512,
            ..test_settings()
        })
        .expect("Should build config");
        let state = RuntimeState::build(config, &sources()).expect("Should build state");
        assert_eq!(state.edns_size(), None);
    }
}
