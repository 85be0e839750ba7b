//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! RPC response envelope.
//!
//! Every RPC reply travels as a JSON envelope `{version, result, body}`. When
//! `result` is `true` the body is the handler's return value; when it is
//! `false` the body is a serialized [`IslandError`].
//!
//! Decoding never fails. Malformed or truncated input decodes to
//! `{version: 0, result: false}` with no body.
//!
//! # Examples
//!
//! ```rust
//! use island::codec::RpcResponse;
//! use serde_json::json;
//!
//! let encoded = RpcResponse::success(json!("world")).encode();
//! let decoded = RpcResponse::decode(&encoded);
//! assert!(decoded.result);
//! assert_eq!(decoded.into_result().unwrap(), json!("world"));
//!
//! let broken = RpcResponse::decode(br#"{"result": true, "body": 1"#);
//! assert_eq!(broken.version, 0);
//! assert!(!broken.result);
//! ```

use crate::error::{ErrorCode, ErrorKind, IslandCode, IslandError};
use serde_json::{Map, Value};

/// Envelope version written by this runtime.
pub const RESPONSE_VERSION: u64 = 1;

/// A decoded RPC response envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    /// Envelope version; `0` for envelopes that failed to decode.
    pub version: u64,
    /// Whether the call succeeded.
    pub result: bool,
    /// Success payload or serialized error.
    pub body: Option<Value>,
}

impl RpcResponse {
    /// Creates a successful envelope.
    #[must_use]
    pub fn success(body: Value) -> Self {
        Self {
            version: RESPONSE_VERSION,
            result: true,
            body: Some(body),
        }
    }

    /// Creates a failed envelope carrying a serialized error.
    #[must_use]
    pub fn failure(error: &IslandError) -> Self {
        Self {
            version: RESPONSE_VERSION,
            result: false,
            body: Some(error.to_wire()),
        }
    }

    /// The envelope produced for undecodable input.
    #[must_use]
    pub fn malformed() -> Self {
        Self {
            version: 0,
            result: false,
            body: None,
        }
    }

    /// Encodes the envelope as JSON bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut envelope = Map::new();
        envelope.insert("version".to_string(), Value::from(self.version));
        envelope.insert("result".to_string(), Value::Bool(self.result));
        if let Some(body) = &self.body {
            envelope.insert("body".to_string(), body.clone());
        }
        Value::Object(envelope).to_string().into_bytes()
    }

    /// Decodes an envelope, tolerating malformed input.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Self {
        let Ok(Value::Object(mut envelope)) = serde_json::from_slice::<Value>(bytes) else {
            return Self::malformed();
        };
        Self {
            version: envelope.get("version").and_then(Value::as_u64).unwrap_or(0),
            result: envelope.get("result").and_then(Value::as_bool).unwrap_or(false),
            body: envelope.remove("body"),
        }
    }

    /// Returns the error carried by a failed envelope.
    ///
    /// A failed envelope whose body is not a recognizable error (including a
    /// malformed envelope) yields an uncategorized error.
    #[must_use]
    pub fn error(&self) -> Option<IslandError> {
        if self.result {
            return None;
        }
        Some(
            self.body
                .as_ref()
                .and_then(IslandError::from_wire)
                .unwrap_or_else(|| {
                    IslandError::runtime(
                        ErrorKind::Etc,
                        IslandCode::UNKNOWN,
                        ErrorCode::HandleMessageError,
                        "malformed rpc response",
                    )
                }),
        )
    }

    /// Converts the envelope into the call outcome.
    ///
    /// # Errors
    ///
    /// Returns the carried error when `result` is `false`.
    pub fn into_result(self) -> Result<Value, IslandError> {
        if let Some(error) = self.error() {
            return Err(error);
        }
        Ok(self.body.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_round_trip() {
        let body = json!({"id": 7, "tags": ["a", "b"]});
        let decoded = RpcResponse::decode(&RpcResponse::success(body.clone()).encode());
        assert_eq!(decoded.version, RESPONSE_VERSION);
        assert!(decoded.result);
        assert_eq!(decoded.into_result().unwrap(), body);
    }

    #[test]
    fn test_error_round_trip_preserves_identity() {
        let error = IslandError::runtime(
            ErrorKind::Logic,
            IslandCode::new(101).unwrap(),
            ErrorCode::WrongParameterSchema,
            "bad",
        );
        let decoded = RpcResponse::decode(&RpcResponse::failure(&error).encode());
        let restored = decoded.into_result().unwrap_err();
        assert_eq!(restored.kind(), ErrorKind::Logic);
        assert_eq!(restored.code(), 10110031);
        assert_eq!(restored.name(), "LogicError");
        assert_eq!(restored.uuid(), error.uuid());
    }

    #[test]
    fn test_malformed_input() {
        for input in [
            &b"{\"result\": true, \"body\": 1"[..],
            &b""[..],
            &b"\xff\xfe"[..],
            &b"[1, 2, 3]"[..],
        ] {
            let decoded = RpcResponse::decode(input);
            assert_eq!(decoded, RpcResponse::malformed());
        }
    }

    #[test]
    fn test_malformed_converts_to_error() {
        let error = RpcResponse::malformed().into_result().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Etc);
    }

    #[test]
    fn test_missing_body_on_success_is_null() {
        let decoded = RpcResponse::decode(br#"{"version": 1, "result": true}"#);
        assert_eq!(decoded.into_result().unwrap(), Value::Null);
    }
}
