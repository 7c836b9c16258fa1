//! # rxrpc-core
//!
//! Foundation types shared by the rxrpc server, client, and transports.
//!
//! - [`message`]: the `Invocation` / `Response` wire envelope
//! - [`codec`]: pluggable encoding of envelopes (JSON by default)
//! - [`errors`]: per-invocation RPC errors and their wire codes
//! - [`transport`]: the bidirectional message channel abstraction
//! - [`retry`]: exponential backoff calculation
//! - [`settings`]: construction-time configuration
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod logging;
pub mod message;
pub mod retry;
pub mod settings;
pub mod transport;

pub use codec::{Codec, CodecError, JsonCodec};
pub use errors::RpcError;
pub use message::{ErrorBody, Invocation, InvocationId, InvocationKind, Response, ResponseKind};
pub use transport::{
    IncomingStream, Transport, TransportConnector, TransportError, TransportListener,
    TransportStream,
};
