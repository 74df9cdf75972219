//! MessagePack codec using `rmp-serde`.
//!
//! Always uses `to_vec_named` so structs are serialized as maps (with
//! field names) rather than positional arrays. Workers in dynamic
//! languages expect the map format; positional encoding would break
//! them silently.

use crate::error::Result;

/// Binary MessagePack codec.
///
/// Uses `rmp_serde::to_vec_named` for struct-as-map format so the logical
/// field layout matches the JSON codec exactly.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MessagePack bytes.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MessagePack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: TestStruct = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_named_encoding_produces_map_format() {
        let test = TestStruct {
            id: 1,
            name: "x".to_string(),
            active: false,
        };

        let encoded = MsgPackCodec::encode(&test).unwrap();

        // Map format starts with 0x8X (fixmap); array format would be 0x9X.
        assert_eq!(
            encoded[0] & 0xF0,
            0x80,
            "expected map format (0x8X), got {:02X}",
            encoded[0]
        );
    }

    #[test]
    fn test_json_value_round_trip() {
        // The message layer carries bodies as serde_json::Value; both
        // codecs must round-trip it.
        let value = serde_json::json!({"a": 10, "b": [1, 2], "c": "text"});
        let encoded = MsgPackCodec::encode(&value).unwrap();
        let decoded: serde_json::Value = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let invalid = b"\xc1\xc1\xc1"; // 0xc1 is never used in msgpack
        let result: Result<TestStruct> = MsgPackCodec::decode(invalid);
        assert!(result.is_err());
    }
}
