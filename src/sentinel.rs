//! Negative-infinity sentinel handling
//!
//! The grammar engine prints masked logits as a bare `-inf`, which is not
//! valid JSON. Before any parse the literal is replaced by `null`. The
//! substitution is lossy: a recovered `null` logit is read back as negative
//! infinity, i.e. a zero-probability candidate.

use std::borrow::Cow;

/// Literal the engine writes for a masked logit
pub const NEG_INF_SENTINEL: &str = "-inf";

/// Replace bare `-inf` (and `-infinity`) tokens with `null`
///
/// Occurrences inside JSON strings are left alone, so a token whose text
/// happens to be `"-info"` survives intact.
#[must_use]
pub fn substitute_neg_inf(raw: &str) -> Cow<'_, str> {
    if !raw.contains(NEG_INF_SENTINEL) {
        return Cow::Borrowed(raw);
    }

    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut copied_to = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if b == b'"' {
            in_string = true;
            i += 1;
            continue;
        }

        if bytes[i..].starts_with(NEG_INF_SENTINEL.as_bytes()) {
            let mut end = i + NEG_INF_SENTINEL.len();
            if bytes[end..].starts_with(b"inity") {
                end += "inity".len();
            }
            out.push_str(&raw[copied_to..i]);
            out.push_str("null");
            copied_to = end;
            i = end;
            continue;
        }

        i += 1;
    }

    out.push_str(&raw[copied_to..]);
    Cow::Owned(out)
}

/// Deserialize an optional float where `null` means negative infinity
pub(crate) fn nullable_logit<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<f64> = serde::Deserialize::deserialize(deserializer)?;
    Ok(value.unwrap_or(f64::NEG_INFINITY))
}
