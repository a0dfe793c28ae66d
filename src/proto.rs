//! Multiplexer wire codec: the three pull-protocol messages.
//!
//! | Method | Params                    | Result            |
//! |--------|---------------------------|-------------------|
//! | `n`    | `{ id }`                  | empty (ack)       |
//! | `gbi`  | `{ id }`                  | `{ s }` (length)  |
//! | `gbs`  | `{ id, start, end }`      | `{ data }` (b64)  |
//!
//! Slice payloads are base64 (standard alphabet, no padding) so they stay
//! JSON-clean.  Integer fields are unsigned on the Rust side, which makes
//! deserialization reject fractional or negative JSON numbers outright.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Announce a new pullable buffer.
pub const METHOD_NEW_BUFFER_AVAILABLE: &str = "n";
/// Query a buffer's byte length.
pub const METHOD_GET_BUFFER_INFO: &str = "gbi";
/// Pull one slice of a buffer.
pub const METHOD_GET_BUFFER_SLICE: &str = "gbs";

/// Fixed slice size for the pull loop.
pub const SLICE_SIZE: u64 = 1024;

/// Inbound frame ceiling.  The largest frame the protocol itself produces is
/// a full slice response: 1024 payload bytes expand to 1366 base64
/// characters, plus the JSON-RPC response envelope.  Anything at or above
/// this ceiling is rejected before it reaches the RPC node.
pub const MAX_INBOUND_FRAME: usize = 1500;

// ---------------------------------------------------------------------------
// Message bodies
// ---------------------------------------------------------------------------

/// Params of `n` and `gbi`: the buffer being announced or queried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferIdParams {
    pub id: String,
}

/// Result of `gbi`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferInfoResult {
    /// Byte length of the buffer.
    pub s: u64,
}

/// Params of `gbs`: one contiguous byte range of a buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSliceParams {
    pub id: String,
    pub start: u64,
    pub end: u64,
}

/// Result of `gbs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSliceResult {
    /// base64 (standard alphabet, no padding) of exactly `end - start` bytes.
    pub data: String,
}

// ---------------------------------------------------------------------------
// Strict decoding
// ---------------------------------------------------------------------------

/// Decode a params or result object into its typed form.
///
/// Any mismatch (missing key, wrong type, fractional or negative integer
/// field) comes back as the reason string of a protocol error.
pub fn parse<T: DeserializeOwned>(value: &Value) -> Result<T, String> {
    serde_json::from_value(value.clone()).map_err(|e| format!("malformed message body: {e}"))
}

/// Encode a typed message body into a JSON value.
pub fn body<T: Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("json encode error: {e}"))
}

// ---------------------------------------------------------------------------
// Slice payload encoding
// ---------------------------------------------------------------------------

pub fn encode_slice(data: &[u8]) -> String {
    STANDARD_NO_PAD.encode(data)
}

pub fn decode_slice(text: &str) -> Result<Vec<u8>, String> {
    STANDARD_NO_PAD
        .decode(text)
        .map_err(|e| format!("invalid base64 payload: {e}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_slice_params() {
        let params: BufferSliceParams =
            parse(&json!({"id": "b1", "start": 0, "end": 1024})).unwrap();
        assert_eq!(params.id, "b1");
        assert_eq!(params.start, 0);
        assert_eq!(params.end, 1024);
    }

    #[test]
    fn parse_rejects_missing_and_mistyped_keys() {
        assert!(parse::<BufferIdParams>(&json!({})).is_err());
        assert!(parse::<BufferIdParams>(&json!({"id": 7})).is_err());
        assert!(parse::<BufferSliceParams>(&json!({"id": "b1", "start": 0})).is_err());
        assert!(parse::<BufferSliceParams>(&json!({"id": "b1", "start": "0", "end": 5})).is_err());
    }

    #[test]
    fn parse_rejects_non_integer_numbers() {
        assert!(parse::<BufferSliceParams>(&json!({"id": "b1", "start": 1.5, "end": 5})).is_err());
        assert!(parse::<BufferSliceParams>(&json!({"id": "b1", "start": -1, "end": 5})).is_err());
        assert!(parse::<BufferInfoResult>(&json!({"s": 2.25})).is_err());
        assert!(parse::<BufferInfoResult>(&json!({"s": -3})).is_err());
    }

    #[test]
    fn slice_payload_roundtrip() {
        let data: Vec<u8> = (0..=255).collect();
        let text = encode_slice(&data);
        assert!(!text.contains('='));
        assert_eq!(decode_slice(&text).unwrap(), data);
    }

    #[test]
    fn decode_rejects_padded_input() {
        // Both sides agree on the unpadded alphabet; padded payloads are a
        // contract violation.
        assert_eq!(decode_slice("QQ").unwrap(), b"A");
        assert!(decode_slice("QQ==").is_err());
        assert!(decode_slice("!!!").is_err());
    }

    #[test]
    fn full_slice_response_fits_the_frame_ceiling() {
        let slice = vec![0xABu8; SLICE_SIZE as usize];
        let result = body(&BufferSliceResult {
            data: encode_slice(&slice),
        })
        .unwrap();
        let frame =
            serde_json::to_vec(&crate::rpc::Response::ok(u64::MAX, result)).unwrap();
        assert!(frame.len() < MAX_INBOUND_FRAME);
    }
}
