//! Session lifecycle: one accepted transport from first message to teardown.
//!
//! A session decodes the transport's incoming messages on a spawned task and
//! routes each invocation by kind. Every subscription runs on its own task,
//! so a slow producer never delays another id on the same session.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use rxrpc_core::{
    Codec, IncomingStream, Invocation, InvocationId, InvocationKind, Response, RpcError, Transport,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::dispatch::{DispatcherFactory, InvocationArguments, ResultStream};
use crate::registry::{InvocationRegistry, Registration};
use crate::scope::EndpointScope;
use crate::server::SessionSet;

/// Unique identifier of a session within a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting invocations.
    Open,
    /// Teardown in progress.
    Closing,
    /// Torn down. Terminal.
    Closed,
}

/// Collaborators shared by every session of a server.
#[derive(Clone)]
pub struct SessionContext {
    /// Envelope codec.
    pub codec: Arc<dyn Codec>,
    /// Creates a dispatcher per subscription.
    pub factory: Arc<dyn DispatcherFactory>,
}

/// Protocol state for one accepted transport.
pub struct Session {
    id: SessionId,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    factory: Arc<dyn DispatcherFactory>,
    registry: InvocationRegistry,
    /// `None` after teardown.
    scope: Mutex<Option<Arc<EndpointScope>>>,
    state: Mutex<SessionState>,
    /// Stops the decode loop.
    stop: CancellationToken,
    tracker: Weak<SessionSet>,
}

impl Session {
    /// Track a new session for `transport` and start consuming its messages.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        context: &SessionContext,
        tracker: &Arc<SessionSet>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id: SessionId::new(),
            transport,
            codec: Arc::clone(&context.codec),
            factory: Arc::clone(&context.factory),
            registry: InvocationRegistry::new(),
            scope: Mutex::new(Some(Arc::new(EndpointScope::new()))),
            state: Mutex::new(SessionState::Open),
            stop: CancellationToken::new(),
            tracker: Arc::downgrade(tracker),
        });
        tracker.insert(Arc::clone(&session));

        match session.transport.incoming() {
            Ok(incoming) => {
                let _ = tokio::spawn(Arc::clone(&session).run(incoming));
            }
            Err(e) => {
                error!(session_id = %session.id, error = %e, "transport has no incoming stream");
                session.clean();
            }
        }
        session
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Whether teardown has finished.
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Number of invocations currently producing.
    pub fn active_invocations(&self) -> usize {
        self.registry.len()
    }

    /// Whether `id` is currently producing.
    pub fn is_active(&self, id: InvocationId) -> bool {
        self.registry.contains(id)
    }

    /// Complete the outgoing side of the transport, then tear down.
    pub fn close(&self) {
        self.transport.complete();
        self.clean();
    }

    /// Tear the session down. Safe to call any number of times from any
    /// thread; only the first call has an effect. A call racing the first
    /// may return while the session is still [`SessionState::Closing`].
    pub fn clean(&self) {
        let _ = self.teardown();
    }

    /// Returns whether this call performed the teardown.
    ///
    /// The state lock is released while collaborators are torn down, so
    /// they may observe `Closing`.
    fn teardown(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Open {
                return false;
            }
            *state = SessionState::Closing;
        }

        self.stop.cancel();
        if let Some(tracker) = self.tracker.upgrade() {
            let _ = tracker.remove(self.id);
        }
        let cancelled = self.registry.drain();
        let _ = self.scope.lock().take();
        self.transport.close();

        *self.state.lock() = SessionState::Closed;
        info!(session_id = %self.id, cancelled, "session closed");
        true
    }

    #[instrument(skip_all, fields(session_id = %self.id))]
    async fn run(self: Arc<Self>, mut incoming: IncomingStream) {
        info!("session opened");
        loop {
            let next = tokio::select! {
                biased;
                () = self.stop.cancelled() => return,
                next = incoming.next() => next,
            };

            match next {
                Some(Ok(text)) => match self.codec.decode_invocation(&text) {
                    Ok(invocation) => self.handle(invocation),
                    Err(e) => {
                        error!(error = %e, "undecodable message, closing session");
                        self.clean();
                        return;
                    }
                },
                Some(Err(e)) => {
                    warn!(error = %e, "transport failed");
                    self.clean();
                    return;
                }
                None => {
                    debug!("transport completed");
                    self.close();
                    return;
                }
            }
        }
    }

    fn handle(self: &Arc<Self>, invocation: Invocation) {
        let id = invocation.invocation_id;
        match invocation.kind {
            InvocationKind::Subscribe { method, arguments } => {
                self.handle_subscribe(id, &method, arguments);
            }
            InvocationKind::Unsubscribe => self.handle_unsubscribe(id),
            InvocationKind::KeepAlive => trace!(invocation_id = id, "keep-alive"),
        }
    }

    fn handle_subscribe(
        self: &Arc<Self>,
        id: InvocationId,
        method: &str,
        arguments: BTreeMap<String, Value>,
    ) {
        debug!(invocation_id = id, method, "subscribe");
        let Some(scope) = self.scope.lock().clone() else {
            return;
        };

        let arguments = InvocationArguments::new(arguments);
        let setup = panic::catch_unwind(AssertUnwindSafe(|| {
            self.factory.create(&scope)?.dispatch(method, &arguments)
        }));
        let stream = match setup {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(invocation_id = id, method, error = %e, "dispatch failed");
                self.send_response(&Response::error(id, e.to_error_body()));
                return;
            }
            Err(_) => {
                error!(invocation_id = id, method, "endpoint panicked during dispatch");
                let e = RpcError::internal(format!("Method '{method}' failed unexpectedly"));
                self.send_response(&Response::error(id, e.to_error_body()));
                return;
            }
        };

        let Ok(registration) = self.registry.put(id) else {
            debug!(invocation_id = id, "session closing, dropping subscription");
            return;
        };
        let _ = tokio::spawn(Arc::clone(self).drive(id, registration, stream));
    }

    fn handle_unsubscribe(&self, id: InvocationId) {
        if self.registry.cancel(id) {
            debug!(invocation_id = id, "unsubscribed");
        } else {
            trace!(invocation_id = id, "unsubscribe for inactive invocation");
        }
    }

    /// Pull values from `stream` until it ends, fails, or is cancelled.
    #[instrument(skip(self, registration, stream), fields(session_id = %self.id))]
    async fn drive(
        self: Arc<Self>,
        invocation_id: InvocationId,
        registration: Registration,
        mut stream: ResultStream,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                () = registration.cancelled() => {
                    trace!("cancelled");
                    return;
                }
                next = AssertUnwindSafe(stream.next()).catch_unwind() => next,
            };

            let response = match next {
                Ok(Some(Ok(value))) => Response::data(invocation_id, value),
                Ok(Some(Err(e))) => Response::error(invocation_id, e.to_error_body()),
                Ok(None) => Response::complete(invocation_id),
                Err(_) => {
                    error!("endpoint panicked while producing");
                    let e = RpcError::internal("endpoint failed unexpectedly");
                    Response::error(invocation_id, e.to_error_body())
                }
            };
            let terminal = response.is_terminal();

            let encoded = match self.codec.encode_response(&response) {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!(error = %e, "failed to encode response, closing session");
                    let _ = self.registry.remove_if_current(invocation_id, &registration);
                    self.clean();
                    return;
                }
            };

            let send = || self.transport.send(encoded);
            let sent = if terminal {
                self.registry.finish_if_current(invocation_id, &registration, send)
            } else {
                self.registry.emit_if_current(invocation_id, &registration, send)
            };

            match sent {
                // Unsubscribed, replaced, or drained.
                None => return,
                Some(Err(e)) => {
                    warn!(error = %e, "failed to send response, closing session");
                    self.clean();
                    return;
                }
                Some(Ok(())) if terminal => {
                    debug!("finished");
                    return;
                }
                Some(Ok(())) => {}
            }
        }
    }

    /// Encode and send a response outside of any registration.
    fn send_response(&self, response: &Response) {
        let result = self
            .codec
            .encode_response(response)
            .map_err(|e| e.to_string())
            .and_then(|text| self.transport.send(text).map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!(session_id = %self.id, error = %e, "failed to send response, closing session");
            self.clean();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("active_invocations", &self.active_invocations())
            .finish_non_exhaustive()
    }
}
