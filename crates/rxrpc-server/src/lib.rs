//! # rxrpc-server
//!
//! Server side of the rxrpc protocol.
//!
//! - [`registry`]: per-session map of running invocations to cancellation handles
//! - [`scope`]: session-scoped endpoint instances
//! - [`dispatch`]: dispatcher traits, argument access, and the method registry
//! - [`session`]: one accepted transport from first message to teardown
//! - [`server`]: accept loop and session tracking

#![deny(unsafe_code)]

pub mod dispatch;
pub mod registry;
pub mod scope;
pub mod server;
pub mod session;

pub use dispatch::{
    DispatcherFactory, EndpointDispatcher, InvocationArguments, MethodHandler, MethodRegistry,
    ResultStream,
};
pub use registry::{InvocationRegistry, Registration};
pub use scope::EndpointScope;
pub use server::{RpcServer, ServerError, SessionSet};
pub use session::{Session, SessionContext, SessionId, SessionState};
