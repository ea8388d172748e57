//! Per-slice authenticated encryption.
//!
//! Every slice is sealed into a binary payload record with
//! encrypt-then-MAC over HMAC-SHA256:
//!
//! ```text
//! profile (1) | flags (1) | ciphertext length (u16, BE) | ciphertext | mac (8)
//! ```
//!
//! # Security Features
//!
//! - **File-bound keys**: encryption and MAC keys are derived from the
//!   pre-shared key, the file id and the publish version
//! - **Bound metadata**: the MAC covers slice index, slice count and
//!   compressed size, so a record cannot be replayed under another slot
//! - **Verify-then-decrypt**: ciphertext is never decrypted before its MAC
//!   is checked in constant time
//! - **Deterministic**: identical inputs always produce an identical record

#![forbid(unsafe_code)]

use subtle::ConstantTimeEq;

use crate::{
    error::PayloadError,
    wire::{
        base32_decode, base32_encode, hmac_sha256, split_labels, ENC_KEY_LABEL,
        ENC_STREAM_LABEL, MAC_KEY_LABEL, MAC_MESSAGE_LABEL, PAYLOAD_FLAGS_V1,
        PAYLOAD_MAC_TRUNC_LEN, PAYLOAD_PROFILE_V1,
    },
};

/// Profile, flags and length bytes in front of the ciphertext.
const RECORD_HEADER_LEN: usize = 4;

/// Seals and opens the slices of one published file.
///
/// # Example
///
/// ```
/// use dnslice_lib::payload::{parse_record, SliceCipher};
///
/// let cipher = SliceCipher::new("s3cr3t", "0123456789abcdef", "version", 2, 10);
/// let record = cipher.seal(1, b"hello").unwrap();
/// let parsed = parse_record(&record).unwrap();
/// assert_eq!(cipher.open(1, &parsed).unwrap(), b"hello");
/// ```
#[derive(Clone)]
pub struct SliceCipher {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
    file_id: String,
    publish_version: String,
    total_slices: usize,
    compressed_size: usize,
}

impl std::fmt::Debug for SliceCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceCipher")
            .field("keys", &"[REDACTED]")
            .field("file_id", &self.file_id)
            .field("publish_version", &self.publish_version)
            .field("total_slices", &self.total_slices)
            .field("compressed_size", &self.compressed_size)
            .finish()
    }
}

/// A parsed payload record borrowing from the decoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadRecord<'a> {
    pub ciphertext: &'a [u8],
    pub mac: &'a [u8],
}

impl SliceCipher {
    #[must_use]
    pub fn new(
        psk: &str,
        file_id: &str,
        publish_version: &str,
        total_slices: usize,
        compressed_size: usize,
    ) -> Self {
        let derive = |label: &[u8]| {
            hmac_sha256(
                psk.as_bytes(),
                &[
                    label,
                    file_id.as_bytes(),
                    b"|".as_slice(),
                    publish_version.as_bytes(),
                ],
            )
        };
        let enc_key = derive(ENC_KEY_LABEL);
        let mac_key = derive(MAC_KEY_LABEL);
        Self {
            enc_key,
            mac_key,
            file_id: file_id.to_string(),
            publish_version: publish_version.to_string(),
            total_slices,
            compressed_size,
        }
    }

    fn check_index(&self, slice_index: usize) -> Result<(), PayloadError> {
        if slice_index >= self.total_slices {
            return Err(PayloadError::IndexOutOfRange {
                index: u32::try_from(slice_index).unwrap_or(u32::MAX),
                total: u32::try_from(self.total_slices).unwrap_or(u32::MAX),
            });
        }
        Ok(())
    }

    /// XORs `data` with the keystream of `slice_index`.
    fn apply_keystream(&self, slice_index: usize, data: &[u8]) -> Vec<u8> {
        let index = slice_index.to_string();
        let mut out = Vec::with_capacity(data.len());
        for (counter, chunk) in data.chunks(32).enumerate() {
            let counter = counter.to_string();
            let block = hmac_sha256(
                &self.enc_key,
                &[
                    ENC_STREAM_LABEL,
                    index.as_bytes(),
                    b"|".as_slice(),
                    counter.as_bytes(),
                ],
            );
            out.extend(chunk.iter().zip(block).map(|(byte, key)| byte ^ key));
        }
        out
    }

    fn mac(&self, slice_index: usize, ciphertext: &[u8]) -> [u8; PAYLOAD_MAC_TRUNC_LEN] {
        let index = slice_index.to_string();
        let total = self.total_slices.to_string();
        let size = self.compressed_size.to_string();
        let sep = b"|".as_slice();
        let digest = hmac_sha256(
            &self.mac_key,
            &[
                MAC_MESSAGE_LABEL,
                self.file_id.as_bytes(),
                sep,
                self.publish_version.as_bytes(),
                sep,
                index.as_bytes(),
                sep,
                total.as_bytes(),
                sep,
                size.as_bytes(),
                sep,
                ciphertext,
            ],
        );
        let mut mac = [0u8; PAYLOAD_MAC_TRUNC_LEN];
        mac.copy_from_slice(&digest[..PAYLOAD_MAC_TRUNC_LEN]);
        mac
    }

    /// Encrypts and authenticates one slice into a binary payload record.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is empty, does not fit the u16 length
    /// field, or the index is out of range.
    pub fn seal(&self, slice_index: usize, plaintext: &[u8]) -> Result<Vec<u8>, PayloadError> {
        if plaintext.is_empty() {
            return Err(PayloadError::EmptySlice);
        }
        let length = u16::try_from(plaintext.len())
            .map_err(|_| PayloadError::SliceTooLarge(plaintext.len()))?;
        self.check_index(slice_index)?;

        let ciphertext = self.apply_keystream(slice_index, plaintext);
        let mac = self.mac(slice_index, &ciphertext);

        let mut record =
            Vec::with_capacity(RECORD_HEADER_LEN + ciphertext.len() + PAYLOAD_MAC_TRUNC_LEN);
        record.push(PAYLOAD_PROFILE_V1);
        record.push(PAYLOAD_FLAGS_V1);
        record.extend_from_slice(&length.to_be_bytes());
        record.extend_from_slice(&ciphertext);
        record.extend_from_slice(&mac);
        Ok(record)
    }

    /// Seals a slice and splits its base32 text into DNS labels.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`SliceCipher::seal`].
    pub fn payload_labels(
        &self,
        slice_index: usize,
        plaintext: &[u8],
        label_cap: usize,
    ) -> Result<Vec<String>, PayloadError> {
        let record = self.seal(slice_index, plaintext)?;
        Ok(split_labels(&base32_encode(&record), label_cap))
    }

    /// Verifies a record's MAC and only then decrypts it.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::MacMismatch`] when the record was not sealed
    /// for this file and slice, or an index error.
    pub fn open(&self, slice_index: usize, record: &PayloadRecord<'_>) -> Result<Vec<u8>, PayloadError> {
        self.check_index(slice_index)?;
        let expected = self.mac(slice_index, record.ciphertext);
        if !bool::from(expected.as_slice().ct_eq(record.mac)) {
            return Err(PayloadError::MacMismatch);
        }
        Ok(self.apply_keystream(slice_index, record.ciphertext))
    }
}

/// Splits a binary payload record into its ciphertext and MAC.
///
/// # Errors
///
/// Returns an error for a short record, an unknown profile, reserved flags,
/// a zero length field or a length that disagrees with the record size.
pub fn parse_record(bytes: &[u8]) -> Result<PayloadRecord<'_>, PayloadError> {
    if bytes.len() <= RECORD_HEADER_LEN + PAYLOAD_MAC_TRUNC_LEN {
        return Err(PayloadError::RecordTooShort(bytes.len()));
    }
    if bytes[0] != PAYLOAD_PROFILE_V1 {
        return Err(PayloadError::UnsupportedProfile(bytes[0]));
    }
    if bytes[1] != PAYLOAD_FLAGS_V1 {
        return Err(PayloadError::ReservedFlags(bytes[1]));
    }
    let cipher_len = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
    if cipher_len == 0 {
        return Err(PayloadError::EmptySlice);
    }
    let expected = RECORD_HEADER_LEN + cipher_len + PAYLOAD_MAC_TRUNC_LEN;
    if bytes.len() != expected {
        return Err(PayloadError::LengthMismatch {
            expected,
            actual: bytes.len(),
        });
    }
    let (ciphertext, mac) = bytes[RECORD_HEADER_LEN..].split_at(cipher_len);
    Ok(PayloadRecord { ciphertext, mac })
}

/// Joins payload labels and decodes them back into record bytes.
///
/// # Errors
///
/// Returns [`PayloadError::InvalidBase32`] for malformed label text.
pub fn decode_payload_labels<S: AsRef<str>>(labels: &[S]) -> Result<Vec<u8>, PayloadError> {
    let text: String = labels.iter().map(AsRef::as_ref).collect();
    base32_decode(&text)
}
