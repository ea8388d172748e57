//! Wire primitives shared by every layer of the protocol.
//!
//! Lowercase unpadded base32, HMAC-SHA256, DNS name arithmetic and the
//! fixed protocol constants live here.

#![forbid(unsafe_code)]

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::PayloadError;

/// Maximum wire length of a DNS name, root byte included.
pub const MAX_DNS_NAME_WIRE_LENGTH: usize = 255;
/// Maximum textual length of a DNS name without the trailing dot.
pub const MAX_DNS_NAME_TEXT_LENGTH: usize = 253;
/// Hard DNS label limit.
pub const MAX_DNS_LABEL_LENGTH: usize = 63;
/// Packet size every resolver must accept.
pub const CLASSIC_DNS_PACKET_LIMIT: usize = 512;

/// Characters of lowercase base32 text produced from a SHA-256 digest.
pub const DIGEST_TEXT_CAPACITY: usize = 52;

/// Profile byte + flags byte + u16 length, plus the 8-byte truncated MAC.
pub const BINARY_RECORD_OVERHEAD: usize = 12;
pub const PAYLOAD_PROFILE_V1: u8 = 0x01;
pub const PAYLOAD_FLAGS_V1: u8 = 0x00;
pub const PAYLOAD_MAC_TRUNC_LEN: usize = 8;

pub const FILE_ID_LABEL: &str = "file-id:v1|";
pub const MAPPING_FILE_LABEL: &[u8] = b"file:v1|";
pub const MAPPING_SLICE_LABEL: &[u8] = b"slice:v1|";
pub const ENC_KEY_LABEL: &[u8] = b"enc-key|";
pub const ENC_STREAM_LABEL: &[u8] = b"enc-stream|";
pub const MAC_KEY_LABEL: &[u8] = b"mac-key|";
pub const MAC_MESSAGE_LABEL: &[u8] = b"mac-msg|";

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Encodes bytes as lowercase RFC 4648 base32 without padding.
#[must_use]
pub fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u16 = 0;
    let mut bits = 0u32;
    for &byte in data {
        buffer = (buffer << 8) | u16::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let index = usize::from((buffer >> bits) & 0x1f);
            out.push(char::from(BASE32_ALPHABET[index]));
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 {
        let index = usize::from((buffer << (5 - bits)) & 0x1f);
        out.push(char::from(BASE32_ALPHABET[index]));
    }
    out
}

/// Decodes lowercase unpadded base32.
///
/// # Errors
///
/// Returns an error for empty input, padding, uppercase or foreign
/// characters, or a length no byte sequence can encode to.
pub fn base32_decode(text: &str) -> Result<Vec<u8>, PayloadError> {
    if text.is_empty() {
        return Err(PayloadError::InvalidBase32("empty text"));
    }
    if matches!(text.len() % 8, 1 | 3 | 6) {
        return Err(PayloadError::InvalidBase32("impossible length"));
    }

    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut buffer: u16 = 0;
    let mut bits = 0u32;
    for byte in text.bytes() {
        let value = match byte {
            b'a'..=b'z' => byte - b'a',
            b'2'..=b'7' => byte - b'2' + 26,
            b'=' => return Err(PayloadError::InvalidBase32("padding is not allowed")),
            _ => return Err(PayloadError::InvalidBase32("character outside alphabet")),
        };
        buffer = (buffer << 5) | u16::from(value);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    if buffer != 0 {
        return Err(PayloadError::InvalidBase32("non-zero trailing bits"));
    }
    Ok(out)
}

/// HMAC-SHA256 over the concatenation of `parts`.
#[must_use]
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    // HMAC accepts keys of any length
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).unwrap_or_else(|_| unreachable!("HMAC key rejected"));
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Wire length of a name made of `labels`, root byte included.
pub fn name_wire_length<S: AsRef<str>>(labels: &[S]) -> usize {
    1 + labels
        .iter()
        .map(|label| 1 + label.as_ref().len())
        .sum::<usize>()
}

/// Whether `suffix` is a label-boundary suffix of `labels`.
pub fn labels_is_suffix<S: AsRef<str>, T: AsRef<str>>(suffix: &[S], labels: &[T]) -> bool {
    if suffix.len() > labels.len() {
        return false;
    }
    let offset = labels.len() - suffix.len();
    suffix
        .iter()
        .zip(&labels[offset..])
        .all(|(a, b)| a.as_ref() == b.as_ref())
}

/// Whether `label` is a lowercase LDH hostname label.
#[must_use]
pub fn is_valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_DNS_LABEL_LENGTH {
        return false;
    }
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    alnum(&bytes[0])
        && alnum(&bytes[bytes.len() - 1])
        && bytes.iter().all(|b| alnum(b) || *b == b'-')
}

/// Whether `text` only uses the query token alphabet `[a-z0-9]`.
#[must_use]
pub fn is_token_text(text: &str) -> bool {
    !text.is_empty()
        && text
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// Splits `text` into consecutive chunks of at most `cap` characters.
///
/// `text` must be ASCII.
pub fn split_labels(text: &str, cap: usize) -> Vec<String> {
    text.as_bytes()
        .chunks(cap.max(1))
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}
