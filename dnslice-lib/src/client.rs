//! Fetching a published file back over DNS.
//!
//! The client asks for every slice of a [`Descriptor`] through a
//! [`Transport`], verifies each CNAME answer with the same payload crypto
//! the server sealed it with, and reassembles the file once every slice is
//! in. Slices may arrive in any order and any number of times.

#![forbid(unsafe_code)]

use std::{
    collections::BTreeMap,
    io::Write,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::{net::UdpSocket, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    config::{Config, Domain},
    descriptor::Descriptor,
    dns::{self, CLASS_IN, FLAG_QR, FLAG_TC, OPCODE_QUERY, TYPE_A, TYPE_CNAME},
    error::ClientError,
    payload::{decode_payload_labels, parse_record, SliceCipher},
};

pub const DEFAULT_DNS_PORT: u16 = 53;

/// Retry and pacing limits for one fetch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientSettings {
    pub request_timeout_ms: u64,
    pub no_progress_timeout_ms: u64,
    pub max_rounds: usize,
    pub max_consecutive_failures: usize,
    pub retry_sleep_base_ms: u64,
    pub retry_sleep_jitter_ms: u64,
    pub query_interval_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            no_progress_timeout_ms: 60_000,
            max_rounds: 64,
            max_consecutive_failures: 128,
            retry_sleep_base_ms: 100,
            retry_sleep_jitter_ms: 150,
            query_interval_ms: 0,
        }
    }
}

impl ClientSettings {
    /// # Errors
    /// Returns a usage error for a zero timeout or round limit.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.request_timeout_ms == 0 {
            return Err(ClientError::usage("invalid_client_settings", "request_timeout_ms must be > 0"));
        }
        if self.no_progress_timeout_ms == 0 {
            return Err(ClientError::usage("invalid_client_settings", "no_progress_timeout_ms must be > 0"));
        }
        if self.max_rounds == 0 {
            return Err(ClientError::usage("invalid_client_settings", "max_rounds must be > 0"));
        }
        Ok(())
    }

    fn retry_delay(&self) -> Duration {
        let jitter = if self.retry_sleep_jitter_ms > 0 {
            rand::rng().random_range(0..=self.retry_sleep_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.retry_sleep_base_ms + jitter)
    }
}

/// One DNS exchange: a query datagram in, a response datagram out.
///
/// Any error returned here is treated as retryable by [`fetch`].
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn exchange(&mut self, query: &[u8]) -> Result<Vec<u8>, ClientError>;
}

/// Sends each query from a fresh UDP socket to a single resolver.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    resolver: SocketAddr,
    timeout: Duration,
    recv_size: usize,
}

impl UdpTransport {
    #[must_use]
    pub fn new(resolver: SocketAddr, timeout: Duration, edns_size: usize) -> Self {
        Self {
            resolver,
            timeout,
            recv_size: (edns_size + 2048).max(2048),
        }
    }

    #[must_use]
    pub const fn resolver(&self) -> SocketAddr {
        self.resolver
    }
}

impl Transport for UdpTransport {
    async fn exchange(&mut self, query: &[u8]) -> Result<Vec<u8>, ClientError> {
        let bind_addr = if self.resolver.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ClientError::transport("socket_error", e.to_string()))?;
        socket
            .send_to(query, self.resolver)
            .await
            .map_err(|e| ClientError::transport("socket_error", e.to_string()))?;

        let mut buf = vec![0u8; self.recv_size];
        let (len, source) = tokio::time::timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| ClientError::transport("dns_timeout", "no response before the request timeout"))?
            .map_err(|e| ClientError::transport("socket_error", e.to_string()))?;

        if source != self.resolver {
            return Err(ClientError::transport(
                "unexpected_source",
                format!("response came from {source}, expected {}", self.resolver),
            ));
        }
        buf.truncate(len);
        Ok(buf)
    }
}

/// Parses `host`, `host:port`, `[v6]` or `[v6]:port` into a resolver address.
///
/// # Errors
/// Returns a usage error for a malformed value or a host that does not resolve.
pub fn parse_resolver(raw: &str) -> Result<SocketAddr, ClientError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ClientError::usage("invalid_resolver", "resolver is empty"));
    }
    if let Ok(addr) = value.parse::<SocketAddr>() {
        if addr.port() == 0 {
            return Err(ClientError::usage("invalid_resolver", "resolver port must be > 0"));
        }
        return Ok(addr);
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_DNS_PORT));
    }

    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let Some((host, remainder)) = rest.split_once(']') else {
            return Err(ClientError::usage("invalid_resolver", "resolver has an unclosed bracket"));
        };
        let port = match remainder {
            "" => None,
            _ => Some(remainder.strip_prefix(':').ok_or_else(|| {
                ClientError::usage("invalid_resolver", "resolver has text after the bracket")
            })?),
        };
        (host, port)
    } else if value.matches(':').count() == 1 {
        let (host, port) = value.split_once(':').unwrap_or((value, ""));
        (host, Some(port))
    } else {
        (value, None)
    };

    let host = host.trim();
    if host.is_empty() {
        return Err(ClientError::usage("invalid_resolver", "resolver host is empty"));
    }
    let port = match port.map(str::trim) {
        None | Some("") => DEFAULT_DNS_PORT,
        Some(text) => match text.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => {
                return Err(ClientError::usage(
                    "invalid_resolver",
                    format!("resolver port {text:?} is invalid"),
                ))
            }
        },
    };

    (host, port)
        .to_socket_addrs()
        .map_err(|e| ClientError::usage("invalid_resolver", format!("resolver lookup failed: {e}")))?
        .next()
        .ok_or_else(|| ClientError::usage("invalid_resolver", "resolver lookup returned no addresses"))
}

/// The first name server from the system resolver configuration.
///
/// # Errors
/// Returns a transport error if no system resolver can be found.
pub fn discover_system_resolver() -> Result<SocketAddr, ClientError> {
    let (config, _opts) = hickory_resolver::system_conf::read_system_conf().map_err(|e| {
        ClientError::transport("no_system_resolver", format!("cannot read system DNS configuration: {e}"))
    })?;
    config
        .name_servers()
        .first()
        .map(|server| server.socket_addr)
        .ok_or_else(|| ClientError::transport("no_system_resolver", "no system DNS resolver found"))
}

/// Validates a response envelope and returns the target of its one CNAME
/// answer for `qname`.
///
/// # Errors
/// Truncated responses are transport errors; every other rejection is a
/// parse error.
pub fn extract_cname<S: AsRef<str>>(
    response: &[u8],
    expected_id: u16,
    qname: &[S],
) -> Result<Vec<String>, ClientError> {
    let message = dns::parse_message(response)?;
    let header = message.header;

    if header.id != expected_id {
        return Err(ClientError::parse("response_id_mismatch", "response id does not match the query"));
    }
    if !header.has_flag(FLAG_QR) {
        return Err(ClientError::parse("response_missing_qr", "response does not set QR"));
    }
    if header.has_flag(FLAG_TC) {
        return Err(ClientError::transport("response_truncated", "response is truncated"));
    }
    if header.opcode() != OPCODE_QUERY {
        return Err(ClientError::parse("response_opcode", "response opcode is not QUERY"));
    }
    if header.rcode() != dns::Rcode::NoError.as_u16() {
        return Err(ClientError::parse(
            "response_rcode",
            format!("unexpected DNS rcode {}", header.rcode()),
        ));
    }

    let names_match = |labels: &[String]| {
        labels.len() == qname.len()
            && labels
                .iter()
                .zip(qname)
                .all(|(a, b)| a.eq_ignore_ascii_case(b.as_ref()))
    };

    let [question] = message.questions.as_slice() else {
        return Err(ClientError::parse("response_qdcount", "response does not carry exactly one question"));
    };
    if !names_match(&question.labels) {
        return Err(ClientError::parse("response_question_mismatch", "response question name differs"));
    }
    if question.qtype != TYPE_A || question.qclass != CLASS_IN {
        return Err(ClientError::parse("response_question_mismatch", "response question type or class differs"));
    }

    let mut matching = message.answers.into_iter().filter(|record| {
        record.rtype == TYPE_CNAME && record.rclass == CLASS_IN && names_match(&record.labels)
    });
    let target = matching
        .next()
        .and_then(|record| record.cname)
        .ok_or_else(|| ClientError::parse("missing_cname", "response has no matching CNAME answer"))?;
    if matching.next().is_some() {
        return Err(ClientError::parse("multiple_cname", "response has more than one matching CNAME"));
    }
    Ok(target)
}

/// Strips `<response_label>.<domain>` from a CNAME target, returning the
/// payload labels in front of it.
///
/// # Errors
/// Returns a parse error for a missing suffix or malformed payload labels.
pub fn strip_response_suffix<'a>(
    target: &'a [String],
    domain: &Domain,
    response_label: &str,
    max_label_len: usize,
) -> Result<&'a [String], ClientError> {
    let suffix_len = domain.labels.len() + 1;
    if target.len() <= suffix_len {
        return Err(ClientError::parse("cname_too_short", "CNAME target has no payload labels"));
    }
    let (payload, suffix) = target.split_at(target.len() - suffix_len);
    if suffix[0] != response_label || suffix[1..] != domain.labels[..] {
        return Err(ClientError::parse("cname_suffix_mismatch", "CNAME target suffix differs"));
    }
    if payload.iter().any(|label| label.is_empty() || label.len() > max_label_len) {
        return Err(ClientError::parse("invalid_payload_label", "payload label length is out of range"));
    }
    Ok(payload)
}

/// Verified slices of one file, keyed by index.
#[derive(Debug, Clone, Default)]
pub struct SliceStore {
    total_slices: usize,
    slices: BTreeMap<usize, Vec<u8>>,
}

impl SliceStore {
    #[must_use]
    pub fn new(total_slices: usize) -> Self {
        Self {
            total_slices,
            slices: BTreeMap::new(),
        }
    }

    /// Stores a verified slice, returning whether it was new.
    ///
    /// # Errors
    /// Returns a reassembly error when the index is out of range or an
    /// earlier copy of the slice holds different bytes.
    pub fn insert(&mut self, slice_index: usize, bytes: Vec<u8>) -> Result<bool, ClientError> {
        if slice_index >= self.total_slices {
            return Err(ClientError::reassembly(
                "slice_index_out_of_range",
                format!("slice {slice_index} is outside 0..{}", self.total_slices),
            ));
        }
        match self.slices.get(&slice_index) {
            Some(existing) if *existing == bytes => Ok(false),
            Some(_) => Err(ClientError::reassembly(
                "duplicate_slice_mismatch",
                format!("slice {slice_index} arrived twice with different bytes"),
            )),
            None => {
                self.slices.insert(slice_index, bytes);
                Ok(true)
            }
        }
    }

    #[must_use]
    pub fn missing(&self) -> Vec<usize> {
        (0..self.total_slices)
            .filter(|index| !self.slices.contains_key(index))
            .collect()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.slices.len() == self.total_slices
    }

    #[must_use]
    pub fn received(&self) -> usize {
        self.slices.len()
    }

    /// Concatenates, decompresses and checks the plaintext digest.
    ///
    /// # Errors
    /// Returns a reassembly error for a missing slice, a size or digest
    /// mismatch, or a decompression failure.
    pub fn finish(self, compressed_size: usize, plaintext_sha256: &str) -> Result<Vec<u8>, ClientError> {
        if let Some(index) = self.missing().first() {
            return Err(ClientError::reassembly(
                "missing_slice",
                format!("slice {index} was never received"),
            ));
        }
        let compressed: Vec<u8> = self.slices.into_values().flatten().collect();
        if compressed.len() != compressed_size {
            return Err(ClientError::reassembly(
                "compressed_size_mismatch",
                format!("expected {compressed_size} compressed bytes, got {}", compressed.len()),
            ));
        }
        let plaintext = snap::raw::Decoder::new()
            .decompress_vec(&compressed)
            .map_err(|e| ClientError::reassembly("decompress_failed", e.to_string()))?;
        if sha256::digest(plaintext.as_slice()) != plaintext_sha256.to_ascii_lowercase() {
            return Err(ClientError::reassembly(
                "plaintext_sha256_mismatch",
                "reassembled plaintext does not match the published digest",
            ));
        }
        Ok(plaintext)
    }
}

/// Downloads, verifies and reassembles the file a descriptor names.
///
/// # Errors
/// Returns a transport error once the retry limits run out, or the first
/// parse, crypto or reassembly error raised by a delivered slice.
pub async fn fetch<T: Transport>(
    config: &Config,
    descriptor: &Descriptor,
    settings: &ClientSettings,
    transport: &mut T,
) -> Result<Vec<u8>, ClientError> {
    settings.validate()?;
    descriptor.verify(config.file_tag_len)?;

    let cipher = SliceCipher::new(
        &config.psk,
        &descriptor.file_id,
        &descriptor.publish_version,
        descriptor.total_slices,
        descriptor.compressed_size,
    );
    let edns_size = config
        .edns_enabled()
        .then(|| u16::try_from(config.dns_edns_size).unwrap_or(u16::MAX));
    let no_progress = Duration::from_millis(settings.no_progress_timeout_ms);
    let query_interval = Duration::from_millis(settings.query_interval_ms);

    info!(
        file_id = descriptor.file_id,
        total_slices = descriptor.total_slices,
        "fetch started"
    );

    let mut store = SliceStore::new(descriptor.total_slices);
    let mut last_progress = Instant::now();
    let mut domain_index = 0;
    let mut consecutive_failures = 0;
    let mut rounds = 0;

    while !store.is_complete() {
        rounds += 1;
        if rounds > settings.max_rounds {
            return Err(ClientError::transport("max_rounds_exhausted", "max rounds exhausted"));
        }

        for slice_index in store.missing() {
            if last_progress.elapsed() >= no_progress {
                return Err(ClientError::transport("no_progress_timeout", "no-progress timeout"));
            }

            let domain = &config.domains[domain_index];
            let mut qname = vec![
                descriptor.slice_tokens[slice_index].clone(),
                descriptor.file_tag.clone(),
            ];
            qname.extend(domain.labels.iter().cloned());
            let query_id = rand::random::<u16>();
            let query = dns::build_query(query_id, &qname, edns_size)
                .map_err(|e| ClientError::usage("invalid_query_name", e.to_string()))?;

            let exchanged = match transport.exchange(&query).await {
                Ok(response) => extract_cname(&response, query_id, &qname),
                Err(e) => Err(e),
            };
            let target = match exchanged {
                Ok(target) => target,
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        slice_index,
                        domain = domain.name,
                        consecutive_failures,
                        kind = e.kind.as_str(),
                        reason = e.reason,
                        "slice query failed"
                    );
                    if consecutive_failures > settings.max_consecutive_failures {
                        return Err(ClientError::transport(
                            "transport_retries_exhausted",
                            format!("transport retries exhausted: {}", e.message),
                        ));
                    }
                    domain_index = (domain_index + 1) % config.domains.len();
                    tokio::time::sleep(settings.retry_delay()).await;
                    continue;
                }
            };
            consecutive_failures = 0;

            let payload =
                strip_response_suffix(&target, domain, &config.response_label, config.dns_max_label_len)?;
            let record_bytes = decode_payload_labels(payload)?;
            let record = parse_record(&record_bytes)?;
            let plaintext = cipher.open(slice_index, &record)?;

            if store.insert(slice_index, plaintext)? {
                last_progress = Instant::now();
                debug!(
                    slice_index,
                    received = store.received(),
                    missing = descriptor.total_slices - store.received(),
                    "slice verified"
                );
            }

            if !query_interval.is_zero() {
                tokio::time::sleep(query_interval).await;
            }
        }
    }

    let plaintext = store.finish(descriptor.compressed_size, &descriptor.plaintext_sha256)?;
    info!(
        file_id = descriptor.file_id,
        rounds,
        bytes = plaintext.len(),
        "fetch complete"
    );
    Ok(plaintext)
}

/// `dnslice_<file_id>` in the system temp directory.
#[must_use]
pub fn default_output_path(file_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("dnslice_{file_id}"))
}

/// Writes `bytes` to `path` through a temp file in the same directory.
///
/// # Errors
/// Returns a write error if the directory is missing or any write step fails.
pub fn write_output(path: &Path, bytes: &[u8]) -> Result<(), ClientError> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !directory.is_dir() {
        return Err(ClientError::write(
            "output_directory_missing",
            format!("output directory {} does not exist", directory.display()),
        ));
    }

    let failed = |e: std::io::Error| ClientError::write("write_failed", format!("failed to write output: {e}"));
    let mut temp = tempfile::NamedTempFile::new_in(directory).map_err(failed)?;
    temp.write_all(bytes).map_err(failed)?;
    temp.as_file().sync_all().map_err(failed)?;
    temp.persist(path).map_err(|e| failed(e.error))?;
    debug!(path = %path.display(), bytes = bytes.len(), "output written");
    Ok(())
}
