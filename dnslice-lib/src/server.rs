//! Request classification and the UDP serving loop.
//!
//! Every datagram walks a fixed decision path: unparseable datagrams are
//! dropped, envelope violations and unknown keys are misses (`NXDOMAIN`),
//! CNAME-chase follow-ups get a synthetic A answer, mapped slice queries are
//! served a CNAME, and internal inconsistencies are faults (`SERVFAIL`).

#![forbid(unsafe_code)]

use std::{fmt, future::Future, net::SocketAddr};

use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};

use crate::{
    dns::{
        self, Rcode, Request, CLASS_IN, FLAG_QR, FLAG_TC, OPCODE_QUERY, TYPE_A,
    },
    error::{DnsEncodeError, Phase, StartupError, StartupReason},
    state::{MappingKey, RuntimeState},
};

/// Largest UDP datagram the server will read.
pub const DNS_UDP_RECV_MAX: usize = 65535;

/// Why a parseable request was answered with `NXDOMAIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    InvalidQueryFlags,
    UnsupportedOpcode,
    TruncatedQuery,
    InvalidQuerySectionCounts,
    InvalidAdditionalCount,
    MissingQuestion,
    UnsupportedQtypeOrClass,
    UnknownDomain,
    InvalidSliceQnameShape,
    MappingNotFound,
}

impl MissReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidQueryFlags => "invalid_query_flags",
            Self::UnsupportedOpcode => "unsupported_opcode",
            Self::TruncatedQuery => "truncated_query",
            Self::InvalidQuerySectionCounts => "invalid_query_section_counts",
            Self::InvalidAdditionalCount => "invalid_additional_count",
            Self::MissingQuestion => "missing_question",
            Self::UnsupportedQtypeOrClass => "unsupported_qtype_or_class",
            Self::UnknownDomain => "unknown_domain",
            Self::InvalidSliceQnameShape => "invalid_slice_qname_shape",
            Self::MappingNotFound => "mapping_not_found",
        }
    }
}

/// Why a mapped request was answered with `SERVFAIL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    IdentityMissing,
    SliceIndexOutOfBounds,
    SliceTableLengthMismatch,
    EncodeFailure,
}

impl FaultReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IdentityMissing => "identity_missing",
            Self::SliceIndexOutOfBounds => "slice_index_out_of_bounds",
            Self::SliceTableLengthMismatch => "slice_table_length_mismatch",
            Self::EncodeFailure => "encode_failure",
        }
    }
}

/// Classification of one answered datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Served,
    Followup,
    Miss(MissReason),
    Fault(FaultReason),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Served => f.write_str("served"),
            Self::Followup => f.write_str("followup"),
            Self::Miss(reason) => write!(f, "miss ({})", reason.as_str()),
            Self::Fault(reason) => write!(f, "runtime_fault ({})", reason.as_str()),
        }
    }
}

/// Response bytes plus how the request was classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub bytes: Vec<u8>,
    pub outcome: Outcome,
}

fn envelope_miss(request: &Request, edns_enabled: bool) -> Option<MissReason> {
    let header = &request.header;
    if header.has_flag(FLAG_QR) {
        return Some(MissReason::InvalidQueryFlags);
    }
    if header.opcode() != OPCODE_QUERY {
        return Some(MissReason::UnsupportedOpcode);
    }
    if header.has_flag(FLAG_TC) {
        return Some(MissReason::TruncatedQuery);
    }
    if header.qdcount != 1 || header.ancount != 0 || header.nscount != 0 {
        return Some(MissReason::InvalidQuerySectionCounts);
    }
    let additional_ok = if edns_enabled {
        header.arcount <= 1
    } else {
        header.arcount == 0
    };
    if !additional_ok {
        return Some(MissReason::InvalidAdditionalCount);
    }
    None
}

fn respond(
    state: &RuntimeState,
    request: &Request,
    rcode: Rcode,
    answer: Option<&[u8]>,
    outcome: Outcome,
) -> Result<Response, DnsEncodeError> {
    let bytes = dns::build_response(request, rcode, answer, state.edns_size())?;
    Ok(Response { bytes, outcome })
}

fn miss(state: &RuntimeState, request: &Request, reason: MissReason) -> Result<Response, DnsEncodeError> {
    respond(state, request, Rcode::NxDomain, None, Outcome::Miss(reason))
}

fn fault(state: &RuntimeState, request: &Request, reason: FaultReason) -> Result<Response, DnsEncodeError> {
    respond(state, request, Rcode::ServFail, None, Outcome::Fault(reason))
}

fn classify(state: &RuntimeState, request: &Request) -> Result<Response, DnsEncodeError> {
    let config = state.config();

    if let Some(reason) = envelope_miss(request, config.edns_enabled()) {
        return miss(state, request, reason);
    }
    let Some(question) = &request.question else {
        return miss(state, request, MissReason::MissingQuestion);
    };
    if question.qtype != TYPE_A || question.qclass != CLASS_IN {
        return miss(state, request, MissReason::UnsupportedQtypeOrClass);
    }

    let Some((domain, prefix)) = config.select_domain(&question.labels) else {
        return miss(state, request, MissReason::UnknownDomain);
    };

    if prefix.len() >= 2 && prefix[prefix.len() - 1] == config.response_label {
        let answer = dns::a_answer(config.ttl);
        return respond(state, request, Rcode::NoError, Some(&answer), Outcome::Followup);
    }

    let [slice_token, file_tag] = prefix else {
        return miss(state, request, MissReason::InvalidSliceQnameShape);
    };
    let Some(target) = state.resolve(&MappingKey::new(file_tag.as_str(), slice_token.as_str())) else {
        return miss(state, request, MissReason::MappingNotFound);
    };
    trace!(
        domain = domain.name,
        file_tag,
        slice_token,
        file_id = target.identity.file_id,
        slice_index = target.slice_index,
        "mapping resolved"
    );

    let Some(entry) = state.file(&target.identity) else {
        return fault(state, request, FaultReason::IdentityMissing);
    };
    let table = state.slice_table(entry);
    let Some(slice) = table.get(target.slice_index) else {
        return fault(state, request, FaultReason::SliceIndexOutOfBounds);
    };
    if entry.total_slices != table.len() {
        return fault(state, request, FaultReason::SliceTableLengthMismatch);
    }

    let encoded = entry
        .cipher
        .payload_labels(target.slice_index, slice, config.dns_max_label_len)
        .map_err(|e| e.to_string())
        .and_then(|labels| {
            dns::cname_answer(&question.labels, 2, &labels, &config.response_label, config.ttl)
                .map_err(|e| e.to_string())
        });
    match encoded {
        Ok(answer) => respond(state, request, Rcode::NoError, Some(&answer), Outcome::Served),
        Err(message) => {
            warn!(file_id = target.identity.file_id, slice_index = target.slice_index, %message, "slice encoding failed");
            fault(state, request, FaultReason::EncodeFailure)
        }
    }
}

/// Classifies one datagram and builds its response.
///
/// Returns `None` when the datagram is unparseable and must be dropped.
#[must_use]
pub fn handle_datagram(state: &RuntimeState, datagram: &[u8]) -> Option<Response> {
    let request = match dns::parse_request(datagram) {
        Ok(request) => request,
        Err(e) => {
            trace!(len = datagram.len(), error = %e, "dropping unparseable datagram");
            return None;
        }
    };
    match classify(state, &request) {
        Ok(response) => Some(response),
        Err(e) => {
            // The question echo could not be re-encoded.
            warn!(error = %e, "dropping datagram whose response cannot be encoded");
            None
        }
    }
}

/// Per-outcome counters, reported at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub served: u64,
    pub followup: u64,
    pub miss: u64,
    pub runtime_fault: u64,
    pub dropped: u64,
}

impl Counters {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Served => self.served += 1,
            Outcome::Followup => self.followup += 1,
            Outcome::Miss(_) => self.miss += 1,
            Outcome::Fault(_) => self.runtime_fault += 1,
        }
    }
}

/// A bound UDP server over an immutable [`RuntimeState`].
#[derive(Debug)]
pub struct Server {
    state: RuntimeState,
    socket: UdpSocket,
}

impl Server {
    /// Binds the configured listen address.
    ///
    /// # Errors
    /// Returns `bind_failed` if the socket cannot be bound.
    pub async fn bind(state: RuntimeState) -> Result<Self, StartupError> {
        let addr = state.config().listen_addr;
        Self::bind_to(state, addr).await
    }

    /// Binds an explicit address instead of the configured one.
    ///
    /// # Errors
    /// Returns `bind_failed` if the socket cannot be bound.
    pub async fn bind_to(state: RuntimeState, addr: SocketAddr) -> Result<Self, StartupError> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            StartupError::new(
                Phase::Startup,
                StartupReason::BindFailed,
                format!("failed to bind UDP listener on {addr}: {e}"),
            )
        })?;
        Ok(Self { state, socket })
    }

    /// The bound address.
    ///
    /// # Errors
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Answers datagrams one at a time until `shutdown` resolves.
    pub async fn run<F: Future<Output = ()>>(self, shutdown: F) -> Counters {
        let mut counters = Counters::default();
        let mut buf = vec![0u8; DNS_UDP_RECV_MAX];
        tokio::pin!(shutdown);

        info!(
            listen_addr = %self.local_addr().map_or_else(|_| "unknown".to_string(), |a| a.to_string()),
            files = self.state.items().len(),
            edns = self.state.edns_size().is_some(),
            "server started"
        );

        loop {
            let (len, peer) = tokio::select! {
                () = &mut shutdown => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!(error = %e, "recv_error");
                        counters.runtime_fault += 1;
                        continue;
                    }
                },
            };

            let Some(response) = handle_datagram(&self.state, &buf[..len]) else {
                counters.dropped += 1;
                continue;
            };

            if let Err(e) = self.socket.send_to(&response.bytes, peer).await {
                error!(%peer, error = %e, "send_error");
                counters.runtime_fault += 1;
                continue;
            }

            counters.record(response.outcome);
            match response.outcome {
                Outcome::Served | Outcome::Followup => {
                    debug!(%peer, outcome = %response.outcome, "request answered");
                }
                Outcome::Miss(reason) => warn!(%peer, reason = reason.as_str(), "miss"),
                Outcome::Fault(reason) => warn!(%peer, reason = reason.as_str(), "runtime_fault"),
            }
        }

        info!(
            served = counters.served,
            followup = counters.followup,
            miss = counters.miss,
            runtime_fault = counters.runtime_fault,
            dropped = counters.dropped,
            "server shutdown"
        );
        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{tests::test_settings, Config, Settings},
        dns::{build_query, parse_message, FLAG_RD, TYPE_CNAME},
        publish::SourceFile,
    };

    fn state_with(settings: Settings) -> RuntimeState {
        let config = Config::from_settings(&settings).expect("Should build config");
        RuntimeState::build(
            config,
            &[SourceFile::from_bytes("hello", b"hello world".repeat(1000))],
        )
        .expect("Should build state")
    }

    fn slice_query(state: &RuntimeState, index: usize) -> Vec<u8> {
        let item = &state.items()[0];
        build_query(
            7,
            &[item.slice_tokens[index].as_str(), item.file_tag.as_str(), "example", "com"],
            state.edns_size(),
        )
        .expect("Should build query")
    }

    fn with_header(mut query: Vec<u8>, offset: usize, value: u16) -> Vec<u8> {
        query[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
        query
    }

    #[test]
    fn test_slice_query_is_served() {
        let state = state_with(test_settings());
        let response = handle_datagram(&state, &slice_query(&state, 0)).expect("Should respond");
        assert_eq!(response.outcome, Outcome::Served);

        let message = parse_message(&response.bytes).expect("Should parse");
        assert_eq!(message.header.id, 7);
        assert!(message.header.has_flag(FLAG_RD));
        assert_eq!(message.answers.len(), 1);
        assert_eq!(message.answers[0].rtype, TYPE_CNAME);
        assert_eq!(message.answers[0].ttl, 30);
        assert!(response.bytes.len() <= state.budget().response_size_limit);
    }

    #[test]
    fn test_repeated_queries_are_identical() {
        let state = state_with(test_settings());
        let query = slice_query(&state, 1);
        let first = handle_datagram(&state, &query).expect("Should respond");
        let second = handle_datagram(&state, &query).expect("Should respond");
        assert_eq!(first, second);
    }

    #[test]
    fn test_followup_gets_synthetic_a() {
        let state = state_with(test_settings());
        let query = build_query(9, &["abc", "r-x", "example", "com"], state.edns_size())
            .expect("Should build query");
        let response = handle_datagram(&state, &query).expect("Should respond");
        assert_eq!(response.outcome, Outcome::Followup);
        let message = parse_message(&response.bytes).expect("Should parse");
        assert_eq!(message.answers[0].rtype, TYPE_A);
        assert_eq!(message.answers[0].rdata, [0, 0, 0, 0]);
    }

    #[test]
    fn test_envelope_rejection_matrix() {
        let state = state_with(test_settings());
        let query = slice_query(&state, 0);
        let flags = u16::from_be_bytes([query[2], query[3]]);

        let cases = [
            (with_header(query.clone(), 2, flags | FLAG_QR), MissReason::InvalidQueryFlags),
            (with_header(query.clone(), 2, flags | (2 << 11)), MissReason::UnsupportedOpcode),
            (with_header(query.clone(), 2, flags | FLAG_TC), MissReason::TruncatedQuery),
            (with_header(query.clone(), 4, 2), MissReason::InvalidQuerySectionCounts),
            (with_header(query.clone(), 6, 1), MissReason::InvalidQuerySectionCounts),
            (with_header(query.clone(), 8, 1), MissReason::InvalidQuerySectionCounts),
            (with_header(query.clone(), 10, 2), MissReason::InvalidAdditionalCount),
        ];
        for (datagram, reason) in cases {
            let response = handle_datagram(&state, &datagram).expect("Should respond");
            assert_eq!(response.outcome, Outcome::Miss(reason));
            let header = parse_message(&response.bytes).expect("Should parse").header;
            assert_eq!(header.rcode(), Rcode::NxDomain.as_u16());
            assert_eq!(header.ancount, 0);
        }
    }

    #[test]
    fn test_additional_count_without_edns() {
        let state = state_with(Settings {
            dns_edns_size: 512,
            ..test_settings()
        });
        let query = with_header(slice_query(&state, 0), 10, 1);
        let response = handle_datagram(&state, &query).expect("Should respond");
        assert_eq!(response.outcome, Outcome::Miss(MissReason::InvalidAdditionalCount));
    }

    #[test]
    fn test_question_misses() {
        let state = state_with(test_settings());
        let edns = state.edns_size();

        let mut query = build_query(1, &["a", "b", "example", "com"], edns).expect("Should build");
        // qtype sits right after the question name
        let qtype_offset = 12 + 1 + 1 + 1 + 1 + 8 + 4 + 1;
        query[qtype_offset..qtype_offset + 2].copy_from_slice(&TYPE_CNAME.to_be_bytes());
        let response = handle_datagram(&state, &query).expect("Should respond");
        assert_eq!(response.outcome, Outcome::Miss(MissReason::UnsupportedQtypeOrClass));

        for (labels, reason) in [
            (vec!["a", "b", "example", "org"], MissReason::UnknownDomain),
            (vec!["a", "example", "com"], MissReason::InvalidSliceQnameShape),
            (vec!["a", "b", "c", "example", "com"], MissReason::InvalidSliceQnameShape),
            (vec!["zzzzzzzz", "zzzzzz", "example", "com"], MissReason::MappingNotFound),
        ] {
            let query = build_query(1, &labels, edns).expect("Should build");
            let response = handle_datagram(&state, &query).expect("Should respond");
            assert_eq!(response.outcome, Outcome::Miss(reason));
            let message = parse_message(&response.bytes).expect("Should parse");
            assert_eq!(message.header.rcode(), Rcode::NxDomain.as_u16());
            assert!(message.answers.is_empty());
        }
    }

    #[test]
    fn test_header_only_and_garbage() {
        let state = state_with(test_settings());
        let header_only = vec![0u8; 12];
        assert_eq!(
            handle_datagram(&state, &header_only).map(|r| r.outcome),
            Some(Outcome::Miss(MissReason::InvalidQuerySectionCounts))
        );
        assert!(handle_datagram(&state, &[1, 2, 3]).is_none());
    }

    #[tokio::test]
    async fn test_server_answers_over_udp() {
        let state = state_with(test_settings());
        let query = slice_query(&state, 0);
        let expected = handle_datagram(&state, &query).expect("Should respond");

        let server = Server::bind_to(state, "127.0.0.1:0".parse().expect("Should parse addr"))
            .await
            .expect("Should bind");
        let addr = server.local_addr().expect("Should have addr");
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("Should bind client");
        client.send_to(&query, addr).await.expect("Should send");
        let mut buf = vec![0u8; 4096];
        let (len, _) = client.recv_from(&mut buf).await.expect("Should receive");
        assert_eq!(&buf[..len], expected.bytes.as_slice());

        stop_tx.send(()).expect("Should stop");
        let counters = handle.await.expect("Should join");
        assert_eq!(counters.served, 1);
    }
}
