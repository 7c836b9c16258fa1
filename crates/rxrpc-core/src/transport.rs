//! Transport abstraction: an ordered, bidirectional pipe of encoded messages.
//!
//! Transports carry no protocol semantics. The session engine reads
//! [`Transport::incoming`] and writes with [`Transport::send`]; everything
//! about framing, connection setup, and liveness stays below this line.

pub mod channel;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use channel::{ChannelListener, ChannelTransport};

/// Incoming messages, terminated by end-of-stream (completion) or an `Err`.
pub type IncomingStream = BoxStream<'static, Result<String, TransportError>>;

/// Accepted server-side transports.
pub type TransportStream = BoxStream<'static, Arc<dyn Transport>>;

/// Channel-level failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport was closed or its peer went away.
    #[error("transport closed")]
    Closed,
    /// `incoming()` or `connections()` was already taken.
    #[error("stream already taken")]
    AlreadyTaken,
    /// Could not establish the connection.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The handshake response did not carry a client identifier.
    #[error("handshake response is missing the client identifier")]
    MissingClientId,
    /// A single outgoing message could not be delivered.
    #[error("send failed: {0}")]
    Send(String),
    /// Polling kept failing after every retry.
    #[error("polling failed after {attempts} attempts: {message}")]
    PollRetriesExhausted {
        /// Attempts made in the final round (initial try plus retries).
        attempts: u32,
        /// Last failure.
        message: String,
    },
    /// Anything else reported by a transport implementation.
    #[error("{0}")]
    Other(String),
}

/// One bidirectional message channel.
pub trait Transport: Send + Sync + 'static {
    /// Take the incoming message stream. Can be taken once.
    fn incoming(&self) -> Result<IncomingStream, TransportError>;

    /// Queue one encoded message for delivery to the peer.
    fn send(&self, message: String) -> Result<(), TransportError>;

    /// Signal that no more messages will be sent.
    fn complete(&self);

    /// Release the transport. Best effort; safe to call repeatedly.
    fn close(&self);
}

/// Server-side source of accepted transports.
pub trait TransportListener: Send + Sync + 'static {
    /// Take the stream of accepted transports. Can be taken once.
    fn connections(&self) -> Result<TransportStream, TransportError>;

    /// Stop accepting. Already accepted transports are unaffected.
    fn close(&self);
}

/// Client-side factory for transports.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Connect to `address` and return a ready transport.
    async fn connect(&self, address: &str) -> Result<Arc<dyn Transport>, TransportError>;
}
