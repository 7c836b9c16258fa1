//! Envelope encoding.
//!
//! The session engine and client only see [`Codec`]; [`JsonCodec`] is the
//! default and matches the camelCase JSON shapes in [`crate::message`].

use crate::message::{Invocation, Response};

/// Failure to turn text into an envelope or back.
///
/// Codec failures are never attributed to a single invocation: a message
/// that cannot be decoded may not even yield a usable invocation id.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Incoming text is not a valid envelope.
    #[error("failed to decode message: {0}")]
    Decode(String),
    /// Outgoing envelope could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Encodes and decodes protocol envelopes.
pub trait Codec: Send + Sync + 'static {
    /// Decode a client request (server side).
    fn decode_invocation(&self, message: &str) -> Result<Invocation, CodecError>;
    /// Encode a server response (server side).
    fn encode_response(&self, response: &Response) -> Result<String, CodecError>;
    /// Encode a client request (client side).
    fn encode_invocation(&self, invocation: &Invocation) -> Result<String, CodecError>;
    /// Decode a server response (client side).
    fn decode_response(&self, message: &str) -> Result<Response, CodecError>;
}

/// `serde_json` codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode_invocation(&self, message: &str) -> Result<Invocation, CodecError> {
        serde_json::from_str(message).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode_response(&self, response: &Response) -> Result<String, CodecError> {
        serde_json::to_string(response).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn encode_invocation(&self, invocation: &Invocation) -> Result<String, CodecError> {
        serde_json::to_string(invocation).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_response(&self, message: &str) -> Result<Response, CodecError> {
        serde_json::from_str(message).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
