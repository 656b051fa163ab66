//! Wire protocol for the command channel
//!
//! Both directions use the same shapes: a [`MethodCall`] going out and a
//! [`MethodResponse`] coming back, each wrapped in an [`Envelope`] that
//! carries the correlation ID. Payloads are JSON bytes.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::value::{Arguments, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

/// A named call travelling over the channel.
///
/// For future methods `arguments` is always a map keyed by parameter name,
/// so the receiving side does not depend on parameter order. Stream pushes
/// carry their payload as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodCall {
    pub method_name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            method_name: method_name.into(),
            arguments,
        }
    }

    /// Build a call whose arguments are keyed by name
    pub fn with_arguments(method_name: impl Into<String>, arguments: Arguments) -> Self {
        Self::new(method_name, Value::Map(arguments))
    }

    /// Look up a named argument
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }
}

/// The single terminal response to a [`MethodCall`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum MethodResponse {
    /// The handler ran and produced a value
    Success { value: Value },

    /// The handler ran and reported a structured failure
    #[serde(rename_all = "camelCase")]
    Error {
        error_code: String,
        error_message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_details: Option<Value>,
    },

    /// No handler exists for the method name
    NotImplemented,
}

impl MethodResponse {
    pub fn success(value: impl Into<Value>) -> Self {
        MethodResponse::Success {
            value: value.into(),
        }
    }

    /// Empty acknowledgement
    pub fn ack() -> Self {
        MethodResponse::Success { value: Value::Null }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        MethodResponse::Error {
            error_code: code.into(),
            error_message: message.into(),
            error_details: None,
        }
    }

    pub fn error_with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<Value>,
    ) -> Self {
        MethodResponse::Error {
            error_code: code.into(),
            error_message: message.into(),
            error_details: Some(details.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, MethodResponse::Success { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Direction of an envelope relative to the exchange it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Payload is an encoded [`MethodCall`]
    Call,
    /// Payload is an encoded [`MethodResponse`]
    Reply,
}

/// One framed message on the messenger
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Correlation ID; a reply carries the ID of the call it answers
    pub id: u64,
    pub kind: EnvelopeKind,
    pub payload: Bytes,
}

impl Envelope {
    pub fn call(id: u64, call: &MethodCall) -> Result<Self, WireError> {
        Ok(Self {
            id,
            kind: EnvelopeKind::Call,
            payload: encode(call)?,
        })
    }

    pub fn reply(id: u64, response: &MethodResponse) -> Result<Self, WireError> {
        Ok(Self {
            id,
            kind: EnvelopeKind::Reply,
            payload: encode(response)?,
        })
    }

    pub fn decode_call(&self) -> Result<MethodCall, WireError> {
        decode(&self.payload)
    }

    pub fn decode_reply(&self) -> Result<MethodResponse, WireError> {
        decode(&self.payload)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec
// ─────────────────────────────────────────────────────────────────────────────

/// Encoding or decoding failure on the wire
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Serialize a message into channel bytes
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, WireError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(WireError::Encode)
}

/// Deserialize channel bytes into a message
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(payload).map_err(WireError::Decode)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_shape() {
        let mut args = Arguments::new();
        args.insert("a".into(), Value::Int(2));
        let call = MethodCall::with_arguments("add", args);

        let encoded: serde_json::Value = serde_json::to_value(&call).unwrap();
        assert_eq!(encoded["methodName"], json!("add"));
        assert_eq!(encoded["arguments"]["kind"], json!("Map"));
        assert_eq!(call.arg("a"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_error_response_shape() {
        let encoded = serde_json::to_value(MethodResponse::error("E1", "boom")).unwrap();
        assert_eq!(
            encoded,
            json!({"status": "error", "errorCode": "E1", "errorMessage": "boom"})
        );

        let sentinel = serde_json::to_value(MethodResponse::NotImplemented).unwrap();
        assert_eq!(sentinel, json!({"status": "notImplemented"}));
    }

    #[test]
    fn test_envelope_carries_correlation_id() {
        let env = Envelope::reply(41, &MethodResponse::success(5)).unwrap();
        assert_eq!(env.id, 41);
        assert_eq!(env.kind, EnvelopeKind::Reply);
        assert_eq!(env.decode_reply().unwrap(), MethodResponse::success(5));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let env = Envelope {
            id: 1,
            kind: EnvelopeKind::Call,
            payload: Bytes::from_static(b"not json"),
        };
        assert!(matches!(env.decode_call(), Err(WireError::Decode(_))));
    }
}
