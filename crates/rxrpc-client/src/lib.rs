//! # rxrpc-client
//!
//! Client side of the rxrpc protocol: subscribe to a remote method and
//! consume its results as a [`futures::Stream`].
//!
//! - [`client`]: [`RpcClient`] and [`Subscription`]
//! - [`errors`]: [`ClientError`]

#![deny(unsafe_code)]

pub mod client;
pub mod errors;

pub use client::{RpcClient, Subscription};
pub use errors::ClientError;
