//! Lenient field readers for engine-written documents
//!
//! The inference server and the decoding engine are not strict about field
//! types: an id may arrive as a number, a step as a string, a timestamp as
//! a float. A field of the wrong shape must cost that field, never the
//! whole document, so these readers accept any JSON value and map what
//! they cannot use to `None`.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Text form of a scalar; `None` for null
pub(crate) fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Non-negative integer step; `None` for anything else
pub(crate) fn value_to_step(value: &Value) -> Option<usize> {
    value.as_u64().and_then(|n| usize::try_from(n).ok())
}

/// Read any value as an optional string, stringifying numbers and booleans
pub(crate) fn optional_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_to_string))
}

/// Read any value as an optional step number
pub(crate) fn optional_step<'de, D>(deserializer: D) -> std::result::Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_to_step))
}

/// Read any value as an optional integer; floats are truncated
pub(crate) fn optional_i64<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))))
}

/// Read any value as an optional float
pub(crate) fn optional_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_f64()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Fields {
        #[serde(default, deserialize_with = "optional_string")]
        id: Option<String>,
        #[serde(default, deserialize_with = "optional_step")]
        step: Option<usize>,
        #[serde(default, deserialize_with = "optional_i64")]
        created: Option<i64>,
        #[serde(default, deserialize_with = "optional_f64")]
        logprob: Option<f64>,
    }

    fn fields(value: Value) -> Fields {
        serde_json::from_value(value).expect("lenient fields never fail")
    }

    #[test]
    fn test_numeric_id_is_stringified() {
        assert_eq!(fields(json!({"id": 17})).id.as_deref(), Some("17"));
        assert_eq!(fields(json!({"id": "chatcmpl-1"})).id.as_deref(), Some("chatcmpl-1"));
        assert_eq!(fields(json!({"id": null})).id, None);
        assert_eq!(fields(json!({})).id, None);
    }

    #[test]
    fn test_only_non_negative_integer_steps() {
        assert_eq!(fields(json!({"step": 3})).step, Some(3));
        assert_eq!(fields(json!({"step": -1})).step, None);
        assert_eq!(fields(json!({"step": "2"})).step, None);
        assert_eq!(fields(json!({"step": 1.5})).step, None);
    }

    #[test]
    fn test_numbers_of_the_wrong_kind() {
        assert_eq!(fields(json!({"created": 1.7e9})).created, Some(1_700_000_000));
        assert_eq!(fields(json!({"created": "soon"})).created, None);
        assert_eq!(fields(json!({"logprob": "x"})).logprob, None);
        assert_eq!(fields(json!({"logprob": -0.25})).logprob, Some(-0.25));
    }
}
