//! Idempotency keys and the job identities derived from them.
//!
//! A key is a lowercase token over `[a-z0-9_-]`. Anything else collapses into a single
//! `-`, and over-long keys keep a readable prefix plus a digest of the full key so two
//! keys sharing a prefix never collide after truncation.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DomainError, DomainResult};
use crate::payload::Trigger;

/// Maximum length of a normalized key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 96;

/// Hex digits of the SHA-256 digest appended to truncated keys.
const DIGEST_HEX_LEN: usize = 16;

/// Prefix of job ids derived from an idempotency key.
pub const JOB_ID_PREFIX: &str = "retention-";

/// A normalized idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Normalize a caller-supplied key.
    ///
    /// Fails when nothing of the input survives normalization.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return Err(DomainError::invalid_idempotency_key(format!(
                "{raw:?} must contain at least one valid character [a-z0-9_-]"
            )));
        }
        Ok(Self(truncate_with_digest(normalized)))
    }

    /// Key shared by every cron-triggered sweep of one mode on one UTC day.
    pub fn for_cron(date: NaiveDate, dry_run: bool) -> Self {
        let mode = if dry_run { "dry-run" } else { "run" };
        Self(format!("cron-{}-{mode}", date.format("%Y-%m-%d")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Job id the queue uses for this key.
    pub fn job_id(&self) -> String {
        format!("{JOB_ID_PREFIX}{}", self.0)
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resolve the key for an enqueue request.
///
/// - explicit (non-blank) key: normalized, rejected if empty afterwards
/// - no key, cron trigger: one key per UTC day and mode
/// - no key, manual trigger: none (the queue assigns an id)
pub fn resolve_idempotency_key(
    explicit: Option<&str>,
    trigger: Trigger,
    dry_run: bool,
    now: DateTime<Utc>,
) -> DomainResult<Option<IdempotencyKey>> {
    match explicit.filter(|raw| !raw.trim().is_empty()) {
        Some(raw) => IdempotencyKey::parse(raw).map(Some),
        None if trigger == Trigger::Cron => {
            Ok(Some(IdempotencyKey::for_cron(now.date_naive(), dry_run)))
        }
        None => Ok(None),
    }
}

fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;

    for ch in raw.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            // '-' and every out-of-alphabet character fold into one separator.
            pending_dash = true;
        }
    }

    out
}

fn truncate_with_digest(normalized: String) -> String {
    if normalized.len() <= MAX_IDEMPOTENCY_KEY_LEN {
        return normalized;
    }

    let digest = hex::encode(Sha256::digest(normalized.as_bytes()));
    let head_len = MAX_IDEMPOTENCY_KEY_LEN - DIGEST_HEX_LEN - 1;
    // `normalize` only emits ASCII, so byte slicing is on a char boundary.
    let head = normalized[..head_len].trim_end_matches('-');

    format!("{head}-{}", &digest[..DIGEST_HEX_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn normalizes_to_lowercase_token() {
        let key = IdempotencyKey::parse("  Nightly Sweep / EU  ").unwrap();
        assert_eq!(key.as_str(), "nightly-sweep-eu");
    }

    #[test]
    fn keeps_underscores_and_collapses_dashes() {
        let key = IdempotencyKey::parse("--ops__run--2--").unwrap();
        assert_eq!(key.as_str(), "ops__run-2");
    }

    #[test]
    fn rejects_key_without_valid_characters() {
        let err = IdempotencyKey::parse("!!!").unwrap_err();
        assert!(err.to_string().contains("at least one valid character"));
    }

    #[test]
    fn long_keys_are_truncated_with_digest() {
        let a = format!("{}a", "k".repeat(200));
        let b = format!("{}b", "k".repeat(200));

        let ka = IdempotencyKey::parse(&a).unwrap();
        let kb = IdempotencyKey::parse(&b).unwrap();

        assert_eq!(ka.as_str().len(), MAX_IDEMPOTENCY_KEY_LEN);
        assert_ne!(ka, kb);
        assert!(ka.as_str().starts_with(&"k".repeat(79)));
    }

    #[test]
    fn cron_key_is_per_day_and_mode() {
        let dry = resolve_idempotency_key(None, Trigger::Cron, true, at(2026, 2, 21, 0, 1))
            .unwrap()
            .unwrap();
        let run = resolve_idempotency_key(None, Trigger::Cron, false, at(2026, 2, 21, 10, 22))
            .unwrap()
            .unwrap();

        assert_eq!(dry.as_str(), "cron-2026-02-21-dry-run");
        assert_eq!(run.job_id(), "retention-cron-2026-02-21-run");
    }

    #[test]
    fn same_day_cron_requests_collapse() {
        let morning = resolve_idempotency_key(None, Trigger::Cron, false, at(2026, 2, 21, 0, 0));
        let evening = resolve_idempotency_key(None, Trigger::Cron, false, at(2026, 2, 21, 23, 59));
        assert_eq!(morning.unwrap(), evening.unwrap());
    }

    #[test]
    fn manual_without_key_has_no_identity() {
        let key = resolve_idempotency_key(None, Trigger::Manual, false, Utc::now()).unwrap();
        assert!(key.is_none());

        let blank = resolve_idempotency_key(Some("   "), Trigger::Manual, false, Utc::now());
        assert!(blank.unwrap().is_none());
    }

    #[test]
    fn explicit_key_wins_over_cron_default() {
        let key = resolve_idempotency_key(Some("Backfill"), Trigger::Cron, true, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(key.job_id(), "retention-backfill");
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: normalization is a fixed point and stays within the alphabet.
            #[test]
            fn normalization_is_idempotent(raw in "\\PC{1,200}") {
                if let Ok(key) = IdempotencyKey::parse(&raw) {
                    prop_assert!(key.as_str().len() <= MAX_IDEMPOTENCY_KEY_LEN);
                    prop_assert!(key
                        .as_str()
                        .chars()
                        .all(|c| c.is_ascii_lowercase()
                            || c.is_ascii_digit()
                            || c == '_'
                            || c == '-'));

                    let again = IdempotencyKey::parse(key.as_str()).unwrap();
                    prop_assert_eq!(again, key);
                }
            }

            /// Property: case and separator noise never changes the derived job id.
            #[test]
            fn equivalent_keys_share_job_id(
                word in "[a-z0-9]{1,30}",
                other in "[a-z0-9]{1,30}"
            ) {
                let plain = IdempotencyKey::parse(&format!("{word}-{other}")).unwrap();
                let noisy = format!("  {}  !! {} ", word.to_uppercase(), other);
                let noisy = IdempotencyKey::parse(&noisy).unwrap();
                prop_assert_eq!(plain.job_id(), noisy.job_id());
            }
        }
    }
}
