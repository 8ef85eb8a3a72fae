//! Small helpers shared across crates.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Length of the random suffix appended to a template id.
pub const INSTANCE_SUFFIX_LEN: usize = 8;

/// Current wall-clock time. All persisted timestamps come from here.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// `{template}-{8 lowercase alphanumerics}`, usable as a pod name.
pub fn generate_instance_id(template_id: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(INSTANCE_SUFFIX_LEN)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("{template_id}-{suffix}")
}

/// SHA-256 over the canonical JSON form of `value`.
///
/// `serde_json::Value` maps are ordered, so re-serializing through a `Value`
/// yields the same bytes regardless of field declaration order.
pub fn spec_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_value(value)?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// RFC 1123 label: lowercase alphanumerics and `-`, alnum at both ends, at most 63 chars.
pub fn is_dns_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    ok(bytes[0])
        && ok(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| ok(b) || b == b'-')
}
