//! Validated, immutable deployment configuration.
//!
//! [`Settings`] is the raw, deserializable form with the deployment
//! defaults filled in. [`Config::from_settings`] normalizes and validates
//! it once at startup; nothing mutates a [`Config`] afterwards.

#![forbid(unsafe_code)]

use std::net::SocketAddr;

use securefmt::Debug;
use serde::{Deserialize, Serialize};

use crate::{
    error::StartupError,
    wire::{is_token_text, is_valid_label, labels_is_suffix, name_wire_length, MAX_DNS_NAME_WIRE_LENGTH},
};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:53";
pub const DEFAULT_TTL: u32 = 30;
pub const DEFAULT_EDNS_SIZE: usize = 1232;
pub const DEFAULT_MAX_LABEL_LEN: usize = 63;
pub const DEFAULT_RESPONSE_LABEL: &str = "r-x";
pub const DEFAULT_MAPPING_SEED: &str = "0";
pub const DEFAULT_FILE_TAG_LEN: usize = 6;

const TTL_RANGE: (u32, u32) = (1, 300);
const EDNS_SIZE_RANGE: (usize, usize) = (512, 4096);
const MAX_LABEL_LEN_RANGE: (usize, usize) = (16, 63);
const FILE_TAG_LEN_RANGE: (usize, usize) = (4, 16);

/// Raw protocol settings, as read from the `[dns]` table of a config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Ordered base domains the server is authoritative for.
    pub domains: Vec<String>,
    /// Pre-shared key for the payload crypto.
    #[sensitive]
    pub psk: String,
    /// UDP bind address for the server.
    pub listen_addr: String,
    /// Answer TTL in seconds.
    pub ttl: u32,
    /// Advertised EDNS UDP payload size; 512 disables EDNS.
    pub dns_edns_size: usize,
    /// Cap on payload label length.
    pub dns_max_label_len: usize,
    /// Label separating payload labels from the base domain.
    pub response_label: String,
    /// Seed for the file-tag and slice-token derivation.
    pub mapping_seed: String,
    /// Length of every file tag.
    pub file_tag_len: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            psk: String::new(),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            ttl: DEFAULT_TTL,
            dns_edns_size: DEFAULT_EDNS_SIZE,
            dns_max_label_len: DEFAULT_MAX_LABEL_LEN,
            response_label: DEFAULT_RESPONSE_LABEL.to_string(),
            mapping_seed: DEFAULT_MAPPING_SEED.to_string(),
            file_tag_len: DEFAULT_FILE_TAG_LEN,
        }
    }
}

/// A normalized base domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub name: String,
    pub labels: Vec<String>,
}

impl Domain {
    /// Normalizes and validates a domain name.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain is empty, has an invalid label, or
    /// exceeds the DNS name limit.
    pub fn parse(raw: &str) -> Result<Self, StartupError> {
        let name = raw.trim().to_ascii_lowercase();
        let name = name.trim_end_matches('.').to_string();
        if name.is_empty() {
            return Err(StartupError::config("domain is empty"));
        }

        let labels: Vec<String> = name.split('.').map(str::to_string).collect();
        if let Some(label) = labels.iter().find(|label| !is_valid_label(label)) {
            return Err(StartupError::config(format!(
                "domain label {label:?} is invalid"
            )));
        }
        if name_wire_length(&labels) > MAX_DNS_NAME_WIRE_LENGTH {
            return Err(StartupError::config(format!(
                "domain {name} exceeds DNS name-length limits"
            )));
        }

        Ok(Self { name, labels })
    }

    /// Wire length of the domain, root byte included.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        name_wire_length(&self.labels)
    }
}

/// Immutable configuration shared by publish, mapping, server and client.
#[derive(Debug, Clone)]
pub struct Config {
    pub domains: Vec<Domain>,
    #[sensitive]
    pub psk: String,
    pub listen_addr: SocketAddr,
    pub ttl: u32,
    pub dns_edns_size: usize,
    pub dns_max_label_len: usize,
    pub response_label: String,
    pub mapping_seed: String,
    pub file_tag_len: usize,
}

impl Config {
    /// Validates raw settings into a configuration.
    ///
    /// # Errors
    ///
    /// Returns an `invalid_config` startup error describing the first
    /// violated constraint.
    pub fn from_settings(settings: &Settings) -> Result<Self, StartupError> {
        let domains = normalize_domains(&settings.domains)?;

        if settings.psk.is_empty() {
            return Err(StartupError::config("psk must be non-empty"));
        }

        let listen_addr = settings
            .listen_addr
            .trim()
            .parse::<SocketAddr>()
            .map_err(|e| StartupError::config(format!("listen_addr is invalid: {e}")))?;

        let ttl = in_range("ttl", settings.ttl, TTL_RANGE)?;
        let dns_edns_size = in_range("dns_edns_size", settings.dns_edns_size, EDNS_SIZE_RANGE)?;
        let dns_max_label_len = in_range(
            "dns_max_label_len",
            settings.dns_max_label_len,
            MAX_LABEL_LEN_RANGE,
        )?;
        let file_tag_len = in_range("file_tag_len", settings.file_tag_len, FILE_TAG_LEN_RANGE)?;
        if file_tag_len > dns_max_label_len {
            return Err(StartupError::config(
                "file_tag_len cannot exceed dns_max_label_len",
            ));
        }

        let response_label = normalize_response_label(&settings.response_label)?;
        let mapping_seed = settings.mapping_seed.clone();
        if mapping_seed.is_empty() {
            return Err(StartupError::config("mapping_seed is empty"));
        }
        if !mapping_seed.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
            return Err(StartupError::config("mapping_seed must be printable ASCII"));
        }

        for domain in &domains {
            let mut suffix = vec![response_label.clone()];
            suffix.extend(domain.labels.iter().cloned());
            if name_wire_length(&suffix) > MAX_DNS_NAME_WIRE_LENGTH {
                return Err(StartupError::config(format!(
                    "response suffix for {} exceeds DNS name-length limits",
                    domain.name
                )));
            }
        }

        Ok(Self {
            domains,
            psk: settings.psk.clone(),
            listen_addr,
            ttl,
            dns_edns_size,
            dns_max_label_len,
            response_label,
            mapping_seed,
            file_tag_len,
        })
    }

    /// Whether responses and queries carry an OPT record.
    #[must_use]
    pub const fn edns_enabled(&self) -> bool {
        self.dns_edns_size > crate::wire::CLASSIC_DNS_PACKET_LIMIT
    }

    /// The configured domain with the longest wire length; ties keep the
    /// first configured.
    #[must_use]
    pub fn longest_domain(&self) -> &Domain {
        let mut longest = &self.domains[0];
        for domain in &self.domains[1..] {
            if domain.wire_len() > longest.wire_len() {
                longest = domain;
            }
        }
        longest
    }

    /// Finds the base domain `labels` ends with, returning it together with
    /// the labels in front of it.
    pub fn select_domain<'a, S: AsRef<str>>(&self, labels: &'a [S]) -> Option<(&Domain, &'a [S])> {
        self.domains.iter().find_map(|domain| {
            labels_is_suffix(&domain.labels, labels)
                .then(|| (domain, &labels[..labels.len() - domain.labels.len()]))
        })
    }
}

fn normalize_domains(raw: &[String]) -> Result<Vec<Domain>, StartupError> {
    let domains = raw
        .iter()
        .map(|domain| Domain::parse(domain))
        .collect::<Result<Vec<_>, _>>()?;
    if domains.is_empty() {
        return Err(StartupError::config("at least one domain is required"));
    }

    for (i, left) in domains.iter().enumerate() {
        for right in &domains[i + 1..] {
            if labels_is_suffix(&left.labels, &right.labels)
                || labels_is_suffix(&right.labels, &left.labels)
            {
                return Err(StartupError::config(format!(
                    "domains {} and {} overlap on a label boundary",
                    left.name, right.name
                )));
            }
        }
    }
    Ok(domains)
}

fn normalize_response_label(raw: &str) -> Result<String, StartupError> {
    let label = raw.trim().to_ascii_lowercase();
    if !is_valid_label(&label) {
        return Err(StartupError::config(format!(
            "response_label {label:?} is invalid"
        )));
    }
    if is_token_text(&label) {
        return Err(StartupError::config(
            "response_label must contain a non-token character",
        ));
    }
    Ok(label)
}

fn in_range<T: PartialOrd + Copy + std::fmt::Display>(
    field: &str,
    value: T,
    (min, max): (T, T),
) -> Result<T, StartupError> {
    if value < min || value > max {
        return Err(StartupError::config(format!(
            "{field}={value} is out of range {min}..={max}"
        )));
    }
    Ok(value)
}
