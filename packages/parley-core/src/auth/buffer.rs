//! Buffer-JSON codec for byte fields.
//!
//! The protocol client persists binary data as
//! `{"type": "Buffer", "data": "<base64>"}`. Older files carry the same
//! bytes as a bare base64 string or as a list of numbers, with or without
//! the wrapper object. Everything decodes; only the canonical form is
//! written.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};

/// Encode bytes in the canonical buffer-JSON shape
pub fn encode(bytes: &[u8]) -> Value {
    json!({ "type": "Buffer", "data": STANDARD.encode(bytes) })
}

/// Decode any accepted byte representation
pub fn decode(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => STANDARD.decode(s).ok(),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect(),
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) != Some("Buffer") {
                return None;
            }
            map.get("data").and_then(decode)
        }
        _ => None,
    }
}

/// `#[serde(with = "buffer::bytes")]` for `Vec<u8>` fields
pub mod bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde::Serialize::serialize(&super::encode(bytes), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        super::decode(&value).ok_or_else(|| serde::de::Error::custom("invalid buffer encoding"))
    }
}

/// `#[serde(with = "buffer::key32")]` for 32-byte key fields
pub mod key32 {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        super::bytes::serialize(bytes, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = super::bytes::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid length"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_shape() {
        assert_eq!(encode(&[1, 2, 3]), json!({"type": "Buffer", "data": "AQID"}));
    }

    #[test]
    fn test_accepts_legacy_shapes() {
        let expected = Some(vec![1u8, 2, 3]);
        assert_eq!(decode(&json!("AQID")), expected);
        assert_eq!(decode(&json!([1, 2, 3])), expected);
        assert_eq!(decode(&json!({"type": "Buffer", "data": [1, 2, 3]})), expected);
        assert_eq!(decode(&json!({"type": "Buffer", "data": "AQID"})), expected);
    }

    #[test]
    fn test_rejects_non_bytes() {
        assert_eq!(decode(&json!([1, 300])), None);
        assert_eq!(decode(&json!({"type": "Other", "data": "AQID"})), None);
        assert_eq!(decode(&json!("not base64!")), None);
        assert_eq!(decode(&json!(7)), None);
    }
}
