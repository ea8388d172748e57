//! Slice budget arithmetic.
//!
//! A CNAME target is `<payload labels>.<response label>.<domain>`. Every
//! payload label costs its characters plus one length byte, so the target's
//! wire length grows linearly in the payload character count and the
//! largest payload that fits both the 255-byte name limit and the packet
//! size is found directly.

#![forbid(unsafe_code)]

use tracing::debug;

use crate::{
    config::Config,
    error::{Phase, StartupError, StartupReason},
    wire::{
        name_wire_length, BINARY_RECORD_OVERHEAD, CLASSIC_DNS_PACKET_LIMIT,
        MAX_DNS_NAME_TEXT_LENGTH, MAX_DNS_NAME_WIRE_LENGTH,
    },
};

pub const DNS_HEADER_BYTES: usize = 12;
/// QTYPE + QCLASS.
pub const QUESTION_FIXED_BYTES: usize = 4;
/// Owner pointer + TYPE + CLASS + TTL + RDLENGTH.
pub const ANSWER_FIXED_BYTES: usize = 12;
/// Root owner + TYPE + CLASS + TTL + RDLENGTH.
pub const OPT_RR_BYTES: usize = 11;

/// Result of the budget computation for one query token length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Budget {
    /// Query token length the query name was sized for.
    pub query_token_len: usize,
    /// Largest ciphertext a single slice may carry.
    pub max_ciphertext_slice_bytes: usize,
    /// Base32 characters available for payload labels.
    pub max_payload_chars: usize,
    /// Binary record bytes those characters can carry.
    pub max_record_bytes: usize,
    /// Packet size ceiling the response was sized against.
    pub response_size_limit: usize,
}

fn unusable(message: impl Into<String>) -> StartupError {
    StartupError::new(Phase::Budget, StartupReason::BudgetUnusable, message)
}

/// Wire length of `<token>.<tag>.<longest domain>` for a token length.
#[must_use]
pub fn query_name_wire_len(config: &Config, query_token_len: usize) -> usize {
    // One length byte per label on top of the domain's own wire length.
    1 + query_token_len + 1 + config.file_tag_len + config.longest_domain().wire_len()
}

/// Largest character count `c` with `c + ceil(c / label_cap) <= room`.
const fn max_chars_for_room(room: usize, label_cap: usize) -> usize {
    let full_labels = room / (label_cap + 1);
    let remainder = room % (label_cap + 1);
    full_labels * label_cap + remainder.saturating_sub(1)
}

/// Computes the maximum ciphertext bytes per slice.
///
/// # Errors
///
/// Returns `budget_unusable` when the token length does not fit a label or
/// the query name, or when no positive ciphertext budget remains.
pub fn compute_budget(config: &Config, query_token_len: usize) -> Result<Budget, StartupError> {
    if query_token_len == 0 {
        return Err(unusable("query token length must be positive"));
    }
    if query_token_len > config.dns_max_label_len {
        return Err(unusable(format!(
            "query token length {query_token_len} exceeds dns_max_label_len {}",
            config.dns_max_label_len
        )));
    }

    let qname_wire_len = query_name_wire_len(config, query_token_len);
    if qname_wire_len > MAX_DNS_NAME_WIRE_LENGTH {
        return Err(unusable(format!(
            "query name of {qname_wire_len} wire bytes cannot fit token and file tag labels"
        )));
    }

    let response_size_limit = config.dns_edns_size.max(CLASSIC_DNS_PACKET_LIMIT);
    let opt_bytes = if config.edns_enabled() { OPT_RR_BYTES } else { 0 };
    let fixed_bytes =
        DNS_HEADER_BYTES + qname_wire_len + QUESTION_FIXED_BYTES + ANSWER_FIXED_BYTES + opt_bytes;

    // The CNAME target is sized fully expanded; compression is not credited.
    let target_wire_limit =
        MAX_DNS_NAME_WIRE_LENGTH.min(response_size_limit.saturating_sub(fixed_bytes));

    let mut suffix = vec![config.response_label.as_str()];
    suffix.extend(config.longest_domain().labels.iter().map(String::as_str));
    let suffix_wire_len = name_wire_length(&suffix);

    let room = target_wire_limit.saturating_sub(suffix_wire_len);
    let max_payload_chars =
        max_chars_for_room(room, config.dns_max_label_len).min(MAX_DNS_NAME_TEXT_LENGTH);
    if max_payload_chars == 0 {
        return Err(unusable(
            "no payload capacity available within DNS name and packet limits",
        ));
    }

    let max_record_bytes = max_payload_chars * 5 / 8;
    if max_record_bytes <= BINARY_RECORD_OVERHEAD {
        return Err(unusable(format!(
            "max_ciphertext_slice_bytes is not positive ({max_payload_chars} payload chars)"
        )));
    }

    let budget = Budget {
        query_token_len,
        max_ciphertext_slice_bytes: max_record_bytes - BINARY_RECORD_OVERHEAD,
        max_payload_chars,
        max_record_bytes,
        response_size_limit,
    };
    debug!(
        phase = "budget",
        query_token_len,
        max_payload_chars,
        max_record_bytes,
        max_ciphertext_slice_bytes = budget.max_ciphertext_slice_bytes,
        response_size_limit,
        "budget computed"
    );
    Ok(budget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{tests::test_settings, Settings};
    use crate::wire::split_labels;

    fn config_with(settings: Settings) -> Config {
        Config::from_settings(&settings).expect("Should build config")
    }

    /// Brute-force reference: largest `c` whose labelled form fits `room`.
    fn reference_max_chars(room: usize, cap: usize) -> usize {
        (0..=room)
            .filter(|c| c + c.div_ceil(cap) <= room)
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn test_closed_form_matches_search() {
        for cap in [16, 40, 63] {
            for room in 0..300 {
                assert_eq!(
                    max_chars_for_room(room, cap),
                    reference_max_chars(room, cap),
                    "room={room} cap={cap}"
                );
            }
        }
    }

    #[test]
    fn test_default_budget_fills_target_name() {
        let config = config_with(test_settings());
        let budget = compute_budget(&config, 1).expect("Should compute budget");

        let payload = "a".repeat(budget.max_payload_chars);
        let mut labels = split_labels(&payload, config.dns_max_label_len);
        labels.push(config.response_label.clone());
        labels.extend(config.longest_domain().labels.iter().cloned());
        assert!(name_wire_length(&labels) <= MAX_DNS_NAME_WIRE_LENGTH);

        // One more character would not fit.
        let payload = "a".repeat(budget.max_payload_chars + 1);
        let mut labels = split_labels(&payload, config.dns_max_label_len);
        labels.push(config.response_label.clone());
        labels.extend(config.longest_domain().labels.iter().cloned());
        assert!(name_wire_length(&labels) > MAX_DNS_NAME_WIRE_LENGTH);

        assert_eq!(
            budget.max_ciphertext_slice_bytes,
            budget.max_payload_chars * 5 / 8 - BINARY_RECORD_OVERHEAD
        );
    }

    #[test]
    fn test_classic_packet_limit_constrains_budget() {
        let wide = config_with(test_settings());
        let narrow = config_with(Settings {
            dns_edns_size: 512,
            ..test_settings()
        });
        let wide = compute_budget(&wide, 1).expect("Should compute budget");
        let narrow = compute_budget(&narrow, 1).expect("Should compute budget");
        assert_eq!(narrow.response_size_limit, 512);
        assert!(narrow.max_ciphertext_slice_bytes <= wide.max_ciphertext_slice_bytes);
    }

    #[test]
    fn test_longer_token_never_grows_budget() {
        let config = config_with(Settings {
            dns_edns_size: 512,
            domains: vec![format!("{}.example.com", "d".repeat(60))],
            ..test_settings()
        });
        let mut previous = usize::MAX;
        for token_len in 1..=20 {
            let budget = compute_budget(&config, token_len).expect("Should compute budget");
            assert!(budget.max_ciphertext_slice_bytes <= previous);
            previous = budget.max_ciphertext_slice_bytes;
        }
    }

    #[test]
    fn test_invalid_token_lengths_are_unusable() {
        let config = config_with(test_settings());
        for token_len in [0, config.dns_max_label_len + 1] {
            let err = compute_budget(&config, token_len).expect_err("Should fail");
            assert_eq!(err.reason, StartupReason::BudgetUnusable);
            assert_eq!(err.phase, Phase::Budget);
        }
    }

    #[test]
    fn test_long_domain_is_unusable() {
        // Four 60-character labels leave no room for the payload labels.
        let domain = ["a", "b", "c", "d"]
            .iter()
            .map(|c| c.repeat(60))
            .collect::<Vec<_>>()
            .join(".");
        let config = config_with(Settings {
            domains: vec![domain],
            ..test_settings()
        });
        let err = compute_budget(&config, 1).expect_err("Should fail");
        assert_eq!(err.reason, StartupReason::BudgetUnusable);
    }
}
