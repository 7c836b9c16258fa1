//! # rxrpc-http
//!
//! Emulates a persistent duplex channel over plain HTTP request/response.
//!
//! - [`client`]: [`PollingConnector`] and [`PollingTransport`] (reqwest);
//!   connect handshake, one `POST` per outgoing message, a retrying poll loop
//! - [`server`]: [`PollingListener`] (axum); the matching endpoints, handing
//!   each connected client to the server as a [`rxrpc_core::Transport`]
//!
//! Surface, relative to a base URL:
//!
//! | Request          | Body                      | Response |
//! |------------------|---------------------------|----------|
//! | `POST /connect`  | empty                     | `client-id` header |
//! | `POST /message`  | one message, `text/plain` | status only |
//! | `POST /polling`  | empty                     | queued messages joined by `\n` |
//!
//! Messages must not contain raw newlines. The JSON codec never produces
//! them.

#![deny(unsafe_code)]

pub mod client;
pub mod server;

pub use client::{PollingConnector, PollingTransport};
pub use server::PollingListener;

/// Header carrying the client identifier.
pub const CLIENT_ID_HEADER: &str = "client-id";

/// Handshake path.
pub const CONNECT_PATH: &str = "/connect";

/// Client-to-server message path.
pub const MESSAGE_PATH: &str = "/message";

/// Server-to-client poll path.
pub const POLLING_PATH: &str = "/polling";
