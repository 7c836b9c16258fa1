//! Client-side error type.

use rxrpc_core::{CodecError, RpcError, TransportError};

/// Failure of a subscription or of the client itself.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The server answered the invocation with an error response.
    #[error("{0}")]
    Rpc(#[from] RpcError),

    /// The connection ended before the invocation terminated.
    #[error("client disconnected")]
    Disconnected,

    /// Arguments did not serialize to a JSON object.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The invocation could not be handed to the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The invocation could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ClientError {
    /// Error code of a server-reported failure.
    pub fn rpc_code(&self) -> Option<&str> {
        match self {
            Self::Rpc(e) => Some(e.code()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_code_only_for_server_errors() {
        let err = ClientError::from(RpcError::invalid_params("Argument name not found"));
        assert_eq!(err.rpc_code(), Some("INVALID_PARAMS"));
        assert_eq!(err.to_string(), "Argument name not found");
        assert_eq!(ClientError::Disconnected.rpc_code(), None);
    }

    #[test]
    fn transport_errors_display_transparently() {
        let err = ClientError::from(TransportError::Closed);
        assert_eq!(err.to_string(), "transport closed");
    }
}
