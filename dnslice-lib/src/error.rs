//! Error types for dnslice operations.
//!
//! Startup errors are fatal and carry a phase plus a stable reason code.
//! Payload and DNS parse errors describe a single record or datagram.
//! Client errors map onto distinct process exit statuses.

#![forbid(unsafe_code)]

use std::fmt;

use thiserror::Error;

/// The startup phase in which a fatal error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Config,
    Budget,
    Publish,
    Mapping,
    Startup,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Budget => "budget",
            Self::Publish => "publish",
            Self::Mapping => "mapping",
            Self::Startup => "startup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable reason codes for startup failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupReason {
    InvalidConfig,
    UnreadableFile,
    BudgetUnusable,
    DuplicateSource,
    DuplicatePlaintextSha256,
    CompressionFailed,
    CompressionEmpty,
    FileIdCollision,
    InvalidSliceCount,
    MappingCapacityExceeded,
    MappingCollision,
    DuplicatePublishIdentity,
    StartupNotConverged,
    ServerRuntimeInvalid,
    BindFailed,
}

impl StartupReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid_config",
            Self::UnreadableFile => "unreadable_file",
            Self::BudgetUnusable => "budget_unusable",
            Self::DuplicateSource => "duplicate_source",
            Self::DuplicatePlaintextSha256 => "duplicate_plaintext_sha256",
            Self::CompressionFailed => "compression_failed",
            Self::CompressionEmpty => "compression_empty",
            Self::FileIdCollision => "file_id_collision",
            Self::InvalidSliceCount => "invalid_slice_count",
            Self::MappingCapacityExceeded => "mapping_capacity_exceeded",
            Self::MappingCollision => "mapping_collision",
            Self::DuplicatePublishIdentity => "duplicate_publish_identity",
            Self::StartupNotConverged => "startup_not_converged",
            Self::ServerRuntimeInvalid => "server_runtime_invalid",
            Self::BindFailed => "bind_failed",
        }
    }
}

impl fmt::Display for StartupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fatal error raised before the server binds its socket.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{phase} failed ({reason}): {message}")]
pub struct StartupError {
    /// Phase that detected the violation.
    pub phase: Phase,
    /// Stable reason code.
    pub reason: StartupReason,
    /// Human-readable detail.
    pub message: String,
}

impl StartupError {
    pub fn new(phase: Phase, reason: StartupReason, message: impl Into<String>) -> Self {
        Self {
            phase,
            reason,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(Phase::Config, StartupReason::InvalidConfig, message)
    }
}

/// A DNS datagram that cannot be parsed at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unparseable DNS message: {0}")]
pub struct DnsParseError(pub &'static str);

/// A DNS message that cannot be encoded within wire limits.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot encode DNS message: {0}")]
pub struct DnsEncodeError(pub &'static str);

/// Errors building, parsing, or verifying a binary payload record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// Slices always carry at least one byte.
    #[error("slice bytes must be non-empty")]
    EmptySlice,

    /// The ciphertext length must fit the u16 length field.
    #[error("slice of {0} bytes exceeds the u16 length field")]
    SliceTooLarge(usize),

    /// `slice_index` must be below `total_slices`.
    #[error("slice index {index} is outside 0..{total}")]
    IndexOutOfRange {
        /// The offending index.
        index: u32,
        /// The slice count it was checked against.
        total: u32,
    },

    /// Payload labels are not lowercase unpadded base32.
    #[error("payload labels are not valid base32: {0}")]
    InvalidBase32(&'static str),

    #[error("payload record of {0} bytes is shorter than the minimum")]
    RecordTooShort(usize),

    #[error("unsupported payload profile {0:#04x}")]
    UnsupportedProfile(u8),

    #[error("reserved payload flags are set: {0:#04x}")]
    ReservedFlags(u8),

    /// The length field disagrees with the record size.
    #[error("payload record length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Length implied by the ciphertext length field.
        expected: usize,
        /// Actual record length.
        actual: usize,
    },

    #[error("payload MAC verification failed")]
    MacMismatch,
}

impl PayloadError {
    /// Stable reason code for logs and client errors.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::EmptySlice => "empty_slice",
            Self::SliceTooLarge(_) => "slice_too_large",
            Self::IndexOutOfRange { .. } => "slice_index_out_of_range",
            Self::InvalidBase32(_) => "invalid_payload_base32",
            Self::RecordTooShort(_) => "record_too_short",
            Self::UnsupportedProfile(_) => "unsupported_profile",
            Self::ReservedFlags(_) => "unsupported_flags",
            Self::LengthMismatch { .. } => "record_length_mismatch",
            Self::MacMismatch => "mac_mismatch",
        }
    }
}

/// Category of a client failure. Each maps to its own exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    Usage,
    Transport,
    Parse,
    Crypto,
    Reassembly,
    Write,
}

impl ClientErrorKind {
    /// Process exit status for this category.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Usage => 2,
            Self::Transport => 3,
            Self::Parse => 4,
            Self::Crypto => 5,
            Self::Reassembly => 6,
            Self::Write => 7,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::Transport => "transport",
            Self::Parse => "parse",
            Self::Crypto => "crypto",
            Self::Reassembly => "reassembly",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client-side failure with a category and a stable reason code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error ({reason}): {message}")]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub reason: &'static str,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            reason,
            message: message.into(),
        }
    }

    pub fn usage(reason: &'static str, message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Usage, reason, message)
    }

    pub fn transport(reason: &'static str, message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Transport, reason, message)
    }

    pub fn parse(reason: &'static str, message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Parse, reason, message)
    }

    pub fn reassembly(reason: &'static str, message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Reassembly, reason, message)
    }

    pub fn write(reason: &'static str, message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Write, reason, message)
    }

    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }
}

impl From<PayloadError> for ClientError {
    fn from(err: PayloadError) -> Self {
        let kind = match err {
            PayloadError::MacMismatch => ClientErrorKind::Crypto,
            _ => ClientErrorKind::Parse,
        };
        Self::new(kind, err.reason(), err.to_string())
    }
}

impl From<DnsParseError> for ClientError {
    fn from(err: DnsParseError) -> Self {
        Self::parse("dns_parse_error", err.to_string())
    }
}
