//! DNS wire codec.
//!
//! Only the subset the protocol needs: the header, questions, compressed
//! names, CNAME and A answers, and an empty EDNS OPT record. Anything that
//! does not decode cleanly is a [`DnsParseError`] and the datagram is
//! treated as unparseable as a whole.

#![forbid(unsafe_code)]

use std::collections::HashSet;

use tracing::trace;

use crate::{
    error::{DnsEncodeError, DnsParseError},
    wire::{MAX_DNS_LABEL_LENGTH, MAX_DNS_NAME_WIRE_LENGTH},
};

pub const DNS_HEADER_LEN: usize = 12;

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_OPT: u16 = 41;
pub const CLASS_IN: u16 = 1;

pub const FLAG_QR: u16 = 0x8000;
pub const FLAG_AA: u16 = 0x0400;
pub const FLAG_TC: u16 = 0x0200;
pub const FLAG_RD: u16 = 0x0100;
pub const OPCODE_MASK: u16 = 0x7800;
pub const RCODE_MASK: u16 = 0x000f;
pub const OPCODE_QUERY: u16 = 0;

/// RDATA of the synthetic answer to CNAME-chase follow-ups.
pub const SYNTHETIC_A_RDATA: [u8; 4] = [0, 0, 0, 0];

const POINTER_TAG: u8 = 0xc0;
const MAX_POINTER_OFFSET: usize = 0x3fff;
const MAX_NAME_LABELS: usize = 127;
/// Answer owner names point at the question name right after the header.
const QUESTION_NAME_POINTER: [u8; 2] = [0xc0, DNS_HEADER_LEN as u8];

/// Response codes the server produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError = 0,
    ServFail = 2,
    NxDomain = 3,
}

impl Rcode {
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    fn parse(message: &[u8]) -> Result<Self, DnsParseError> {
        if message.len() < DNS_HEADER_LEN {
            return Err(DnsParseError("message shorter than DNS header"));
        }
        let word = |i: usize| u16::from_be_bytes([message[i], message[i + 1]]);
        Ok(Self {
            id: word(0),
            flags: word(2),
            qdcount: word(4),
            ancount: word(6),
            nscount: word(8),
            arcount: word(10),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        for word in [
            self.id,
            self.flags,
            self.qdcount,
            self.ancount,
            self.nscount,
            self.arcount,
        ] {
            out.extend_from_slice(&word.to_be_bytes());
        }
    }

    /// Opcode, already shifted down.
    #[must_use]
    pub const fn opcode(&self) -> u16 {
        (self.flags & OPCODE_MASK) >> 11
    }

    #[must_use]
    pub const fn rcode(&self) -> u16 {
        self.flags & RCODE_MASK
    }

    #[must_use]
    pub const fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Lower-cased labels of the question name.
    pub labels: Vec<String>,
    pub qtype: u16,
    pub qclass: u16,
}

/// A request as seen by the server: the header and the first question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub header: Header,
    pub question: Option<Question>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub labels: Vec<String>,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
    /// Decoded target labels, for CNAME records only.
    pub cname: Option<Vec<String>>,
}

/// A fully parsed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

/// Decodes a possibly compressed name starting at `start`.
///
/// Returns the labels and the offset just past the name as written at
/// `start`. Every pointer target is visited at most once.
fn decode_name(message: &[u8], start: usize) -> Result<(Vec<String>, usize), DnsParseError> {
    let mut labels = Vec::new();
    let mut offset = start;
    let mut end = None;
    let mut visited = HashSet::new();
    let mut wire_len = 1;

    loop {
        let Some(&first) = message.get(offset) else {
            return Err(DnsParseError("name extends past message"));
        };

        if first & POINTER_TAG == POINTER_TAG {
            let Some(&second) = message.get(offset + 1) else {
                return Err(DnsParseError("truncated name pointer"));
            };
            let pointer = usize::from(first & 0x3f) << 8 | usize::from(second);
            if pointer >= message.len() {
                return Err(DnsParseError("name pointer is out of bounds"));
            }
            if !visited.insert(pointer) {
                return Err(DnsParseError("name pointer loop detected"));
            }
            if end.is_none() {
                end = Some(offset + 2);
            }
            offset = pointer;
            continue;
        }
        if first & POINTER_TAG != 0 {
            return Err(DnsParseError("invalid name label type"));
        }

        offset += 1;
        if first == 0 {
            break;
        }

        let label_end = offset + usize::from(first);
        let Some(raw) = message.get(offset..label_end) else {
            return Err(DnsParseError("label extends past message"));
        };
        if !raw.is_ascii() {
            return Err(DnsParseError("label is not ASCII"));
        }
        wire_len += 1 + raw.len();
        if wire_len > MAX_DNS_NAME_WIRE_LENGTH {
            return Err(DnsParseError("name exceeds DNS name-length limits"));
        }
        labels.push(String::from_utf8_lossy(raw).to_ascii_lowercase());
        if labels.len() > MAX_NAME_LABELS {
            return Err(DnsParseError("name has too many labels"));
        }
        offset = label_end;
    }

    Ok((labels, end.unwrap_or(offset)))
}

fn read_u16(message: &[u8], offset: usize) -> Option<u16> {
    message
        .get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn decode_question(message: &[u8], start: usize) -> Result<(Question, usize), DnsParseError> {
    let (labels, offset) = decode_name(message, start)?;
    let (Some(qtype), Some(qclass)) = (read_u16(message, offset), read_u16(message, offset + 2))
    else {
        return Err(DnsParseError("truncated DNS question"));
    };
    Ok((
        Question {
            labels,
            qtype,
            qclass,
        },
        offset + 4,
    ))
}

fn decode_record(message: &[u8], start: usize) -> Result<(ResourceRecord, usize), DnsParseError> {
    let (labels, offset) = decode_name(message, start)?;
    let Some(fixed) = message.get(offset..offset + 10) else {
        return Err(DnsParseError("truncated resource record"));
    };
    let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
    let rclass = u16::from_be_bytes([fixed[2], fixed[3]]);
    let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
    let rdlength = usize::from(u16::from_be_bytes([fixed[8], fixed[9]]));

    let rdata_start = offset + 10;
    let rdata_end = rdata_start + rdlength;
    let Some(rdata) = message.get(rdata_start..rdata_end) else {
        return Err(DnsParseError("truncated resource record rdata"));
    };

    let cname = if rtype == TYPE_CNAME {
        let (target, target_end) = decode_name(message, rdata_start)?;
        if target_end != rdata_end {
            return Err(DnsParseError("cname rdata length mismatch"));
        }
        Some(target)
    } else {
        None
    };

    Ok((
        ResourceRecord {
            labels,
            rtype,
            rclass,
            ttl,
            rdata: rdata.to_vec(),
            cname,
        },
        rdata_end,
    ))
}

fn decode_records(
    message: &[u8],
    mut offset: usize,
    count: u16,
) -> Result<(Vec<ResourceRecord>, usize), DnsParseError> {
    let mut records = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let (record, next) = decode_record(message, offset)?;
        records.push(record);
        offset = next;
    }
    Ok((records, offset))
}

/// Parses the header and the first question of a request.
///
/// Sections after the first question are not inspected.
///
/// # Errors
/// Returns an error if the header or the first question does not decode.
pub fn parse_request(message: &[u8]) -> Result<Request, DnsParseError> {
    let header = Header::parse(message)?;
    let question = if header.qdcount >= 1 {
        Some(decode_question(message, DNS_HEADER_LEN)?.0)
    } else {
        None
    };
    trace!(
        qdcount = header.qdcount,
        ancount = header.ancount,
        nscount = header.nscount,
        arcount = header.arcount,
        has_question = question.is_some(),
        "dns request parsed"
    );
    Ok(Request { header, question })
}

/// Parses a complete message, rejecting trailing bytes.
///
/// # Errors
/// Returns an error if any section fails to decode.
pub fn parse_message(message: &[u8]) -> Result<Message, DnsParseError> {
    let header = Header::parse(message)?;
    let mut offset = DNS_HEADER_LEN;

    let mut questions = Vec::with_capacity(usize::from(header.qdcount));
    for _ in 0..header.qdcount {
        let (question, next) = decode_question(message, offset)?;
        questions.push(question);
        offset = next;
    }
    let (answers, offset) = decode_records(message, offset, header.ancount)?;
    let (authorities, offset) = decode_records(message, offset, header.nscount)?;
    let (additionals, offset) = decode_records(message, offset, header.arcount)?;

    if offset != message.len() {
        return Err(DnsParseError("trailing bytes in message"));
    }

    Ok(Message {
        header,
        questions,
        answers,
        authorities,
        additionals,
    })
}

/// Appends an uncompressed name without its root byte.
fn write_labels<S: AsRef<str>>(labels: &[S], out: &mut Vec<u8>) -> Result<(), DnsEncodeError> {
    for label in labels {
        let raw = label.as_ref().as_bytes();
        if raw.is_empty() {
            return Err(DnsEncodeError("label must be non-empty"));
        }
        if raw.len() > MAX_DNS_LABEL_LENGTH {
            return Err(DnsEncodeError("label exceeds DNS max label length"));
        }
        out.push(raw.len() as u8);
        out.extend_from_slice(raw);
    }
    Ok(())
}

/// Encodes an uncompressed name.
///
/// # Errors
/// Returns an error for an empty or oversized label, or a name longer than
/// 255 wire bytes.
pub fn encode_name<S: AsRef<str>>(labels: &[S]) -> Result<Vec<u8>, DnsEncodeError> {
    let mut out = Vec::new();
    write_labels(labels, &mut out)?;
    out.push(0);
    if out.len() > MAX_DNS_NAME_WIRE_LENGTH {
        return Err(DnsEncodeError("name exceeds DNS name-length limits"));
    }
    Ok(out)
}

fn pointer(offset: usize) -> Result<[u8; 2], DnsEncodeError> {
    if offset > MAX_POINTER_OFFSET {
        return Err(DnsEncodeError("pointer offset is out of range"));
    }
    Ok((0xc000 | offset as u16).to_be_bytes())
}

fn write_record_head(out: &mut Vec<u8>, rtype: u16, ttl: u32, rdlength: u16) {
    out.extend_from_slice(&QUESTION_NAME_POINTER);
    out.extend_from_slice(&rtype.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out.extend_from_slice(&ttl.to_be_bytes());
    out.extend_from_slice(&rdlength.to_be_bytes());
}

/// Builds a CNAME answer whose target is `<payload>.<response_label>` followed
/// by a pointer to the question's label at `domain_label_index`.
///
/// # Errors
/// Returns an error if a label or the expanded target exceeds DNS limits.
pub fn cname_answer<S: AsRef<str>, P: AsRef<str>>(
    question_labels: &[S],
    domain_label_index: usize,
    payload_labels: &[P],
    response_label: &str,
    ttl: u32,
) -> Result<Vec<u8>, DnsEncodeError> {
    if domain_label_index >= question_labels.len() {
        return Err(DnsEncodeError("domain label index is out of range"));
    }
    let domain_offset = DNS_HEADER_LEN
        + question_labels[..domain_label_index]
            .iter()
            .map(|label| 1 + label.as_ref().len())
            .sum::<usize>();
    let domain_wire_len = 1 + question_labels[domain_label_index..]
        .iter()
        .map(|label| 1 + label.as_ref().len())
        .sum::<usize>();

    let mut rdata = Vec::new();
    write_labels(payload_labels, &mut rdata)?;
    write_labels(&[response_label], &mut rdata)?;
    if rdata.len() + domain_wire_len > MAX_DNS_NAME_WIRE_LENGTH {
        return Err(DnsEncodeError("cname target exceeds DNS name-length limits"));
    }
    rdata.extend_from_slice(&pointer(domain_offset)?);

    let rdlength =
        u16::try_from(rdata.len()).map_err(|_| DnsEncodeError("rdata exceeds u16 length field"))?;
    let mut out = Vec::with_capacity(12 + rdata.len());
    write_record_head(&mut out, TYPE_CNAME, ttl, rdlength);
    out.extend_from_slice(&rdata);
    Ok(out)
}

/// Builds the synthetic `A 0.0.0.0` answer for the question name.
#[must_use]
pub fn a_answer(ttl: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    write_record_head(&mut out, TYPE_A, ttl, SYNTHETIC_A_RDATA.len() as u16);
    out.extend_from_slice(&SYNTHETIC_A_RDATA);
    out
}

fn write_opt(out: &mut Vec<u8>, udp_size: u16) {
    out.push(0);
    out.extend_from_slice(&TYPE_OPT.to_be_bytes());
    out.extend_from_slice(&udp_size.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
}

fn write_question(out: &mut Vec<u8>, question: &Question) -> Result<(), DnsEncodeError> {
    out.extend_from_slice(&encode_name(&question.labels)?);
    out.extend_from_slice(&question.qtype.to_be_bytes());
    out.extend_from_slice(&question.qclass.to_be_bytes());
    Ok(())
}

/// Builds a response echoing the request's id, opcode, RD flag and question.
///
/// `answer` is a pre-encoded resource record; `edns_size` adds an OPT record
/// advertising that UDP payload size.
///
/// # Errors
/// Returns an error if the echoed question cannot be re-encoded.
pub fn build_response(
    request: &Request,
    rcode: Rcode,
    answer: Option<&[u8]>,
    edns_size: Option<u16>,
) -> Result<Vec<u8>, DnsEncodeError> {
    let flags = FLAG_QR
        | FLAG_AA
        | (request.header.flags & FLAG_RD)
        | (request.header.flags & OPCODE_MASK)
        | rcode.as_u16();
    let header = Header {
        id: request.header.id,
        flags,
        qdcount: u16::from(request.question.is_some()),
        ancount: u16::from(answer.is_some()),
        nscount: 0,
        arcount: u16::from(edns_size.is_some()),
    };

    let mut out = Vec::with_capacity(512);
    header.write(&mut out);
    if let Some(question) = &request.question {
        write_question(&mut out, question)?;
    }
    if let Some(answer) = answer {
        out.extend_from_slice(answer);
    }
    if let Some(size) = edns_size {
        write_opt(&mut out, size);
    }
    trace!(
        rcode = rcode.as_u16(),
        ancount = header.ancount,
        include_opt = edns_size.is_some(),
        response_len = out.len(),
        "dns response built"
    );
    Ok(out)
}

/// Builds a recursion-desired `A IN` query for `labels`.
///
/// # Errors
/// Returns an error if the name cannot be encoded.
pub fn build_query<S: AsRef<str>>(
    id: u16,
    labels: &[S],
    edns_size: Option<u16>,
) -> Result<Vec<u8>, DnsEncodeError> {
    let header = Header {
        id,
        flags: FLAG_RD,
        qdcount: 1,
        ancount: 0,
        nscount: 0,
        arcount: u16::from(edns_size.is_some()),
    };
    let mut out = Vec::with_capacity(DNS_HEADER_LEN + MAX_DNS_NAME_WIRE_LENGTH + 15);
    header.write(&mut out);
    out.extend_from_slice(&encode_name(labels)?);
    out.extend_from_slice(&TYPE_A.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    if let Some(size) = edns_size {
        write_opt(&mut out, size);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(labels: &[&str]) -> Request {
        let query = build_query(0x1234, labels, Some(1232)).expect("Should build query");
        parse_request(&query).expect("Should parse query")
    }

    #[test]
    fn test_query_layout() {
        let query = build_query(0xbeef, &["tok", "tag", "example", "com"], Some(1232))
            .expect("Should build query");
        let message = parse_message(&query).expect("Should parse");

        assert_eq!(message.header.id, 0xbeef);
        assert_eq!(message.header.flags, FLAG_RD);
        assert_eq!(message.questions.len(), 1);
        assert_eq!(message.questions[0].labels, ["tok", "tag", "example", "com"]);
        assert_eq!(message.questions[0].qtype, TYPE_A);
        assert_eq!(message.additionals.len(), 1);
        assert_eq!(message.additionals[0].rtype, TYPE_OPT);
        assert_eq!(message.additionals[0].rclass, 1232);

        let plain = build_query(1, &["a", "com"], None).expect("Should build query");
        assert_eq!(parse_message(&plain).expect("Should parse").header.arcount, 0);
    }

    #[test]
    fn test_cname_response_uses_pointers() {
        let request = request(&["tok", "tag", "example", "com"]);
        let question = request.question.clone().expect("Should have question");
        let answer = cname_answer(&question.labels, 2, &["payload1", "payload2"], "r-x", 30)
            .expect("Should build answer");
        let response =
            build_response(&request, Rcode::NoError, Some(&answer), Some(1232)).expect("Should build");

        let message = parse_message(&response).expect("Should parse");
        assert!(message.header.has_flag(FLAG_QR));
        assert!(message.header.has_flag(FLAG_AA));
        assert!(message.header.has_flag(FLAG_RD));
        assert_eq!(message.header.rcode(), 0);
        assert_eq!(message.questions[0], question);

        let cname = &message.answers[0];
        assert_eq!(cname.labels, question.labels);
        assert_eq!(cname.ttl, 30);
        assert_eq!(
            cname.cname.as_deref().expect("Should decode target"),
            ["payload1", "payload2", "r-x", "example", "com"]
        );
        // 2 + 10 fixed bytes, two payload labels, response label, pointer
        assert_eq!(answer.len(), 12 + 9 + 9 + 4 + 2);
        assert_eq!(message.additionals[0].rtype, TYPE_OPT);
    }

    #[test]
    fn test_a_answer_and_nxdomain() {
        let request = request(&["x", "r-x", "example", "com"]);
        let answer = a_answer(30);
        let response =
            build_response(&request, Rcode::NoError, Some(&answer), None).expect("Should build");
        let message = parse_message(&response).expect("Should parse");
        assert_eq!(message.answers[0].rtype, TYPE_A);
        assert_eq!(message.answers[0].rdata, SYNTHETIC_A_RDATA);
        assert!(message.additionals.is_empty());

        let response = build_response(&request, Rcode::NxDomain, None, None).expect("Should build");
        let message = parse_message(&response).expect("Should parse");
        assert_eq!(message.header.rcode(), 3);
        assert!(message.answers.is_empty());
    }

    #[test]
    fn test_pointer_loop_rejected() {
        let mut message = build_query(1, &["a", "com"], None).expect("Should build query");
        // Replace the question name with a pointer to itself.
        message.truncate(DNS_HEADER_LEN);
        message.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1]);
        assert_eq!(
            parse_request(&message),
            Err(DnsParseError("name pointer loop detected"))
        );
    }

    #[test]
    fn test_out_of_bounds_pointer_rejected() {
        let mut message = build_query(1, &["a", "com"], None).expect("Should build query");
        message.truncate(DNS_HEADER_LEN);
        message.extend_from_slice(&[0xc0, 0xff, 0, 1, 0, 1]);
        assert!(parse_request(&message).is_err());
    }

    #[test]
    fn test_truncated_messages_rejected() {
        let query = build_query(1, &["tok", "example", "com"], None).expect("Should build query");
        for len in 0..query.len() {
            assert!(parse_message(&query[..len]).is_err(), "len={len}");
        }
        let mut trailing = query.clone();
        trailing.push(0);
        assert_eq!(
            parse_message(&trailing),
            Err(DnsParseError("trailing bytes in message"))
        );
    }

    #[test]
    fn test_labels_are_lowercased() {
        let query = build_query(1, &["TOK", "Example", "COM"], None).expect("Should build query");
        let request = parse_request(&query).expect("Should parse");
        assert_eq!(
            request.question.expect("Should have question").labels,
            ["tok", "example", "com"]
        );
    }

    #[test]
    fn test_encode_name_limits() {
        assert!(encode_name(&[""]).is_err());
        assert!(encode_name(&["a".repeat(64)]).is_err());
        let long: Vec<String> = (0..5).map(|_| "a".repeat(63)).collect();
        assert!(encode_name(&long).is_err());
        assert_eq!(encode_name(&["example", "com"]).expect("Should encode").len(), 13);
    }
}
