//! Listener state: connected clients and the accept queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use rxrpc_core::transport::ChannelTransport;
use rxrpc_core::{IncomingStream, Transport, TransportError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// HTTP side of one connected client.
///
/// Holds the peer end of an in-memory pair whose other end was handed to
/// the server as that client's transport.
pub(crate) struct ClientSlot {
    peer: ChannelTransport,
    /// Messages the server sent to this client.
    queued: Mutex<IncomingStream>,
    last_activity: Mutex<Instant>,
}

/// Messages taken from a client's queue.
pub(crate) struct Drained {
    pub messages: Vec<String>,
    /// The server side completed; nothing more will be queued.
    pub finished: bool,
}

impl ClientSlot {
    /// Forward a message from the client to the server.
    pub fn deliver(&self, message: String) -> Result<(), TransportError> {
        self.touch();
        self.peer.send(message)
    }

    /// Take every message queued so far without waiting.
    pub fn drain(&self) -> Drained {
        self.touch();
        let mut queued = self.queued.lock();
        let mut messages = Vec::new();
        let finished = loop {
            match queued.next().now_or_never() {
                Some(Some(Ok(message))) => messages.push(message),
                Some(Some(Err(_)) | None) => break true,
                None => break false,
            }
        };
        Drained { messages, finished }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }
}

/// Shared state behind the listener and its HTTP handlers.
pub(crate) struct ListenerState {
    clients: Mutex<HashMap<String, Arc<ClientSlot>>>,
    /// `None` once the listener is closed.
    accept_tx: Mutex<Option<mpsc::UnboundedSender<Arc<dyn Transport>>>>,
    /// Clients silent for longer are evicted. `None` disables eviction.
    idle_timeout: Option<Duration>,
}

impl ListenerState {
    pub fn new(
        accept_tx: mpsc::UnboundedSender<Arc<dyn Transport>>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            accept_tx: Mutex::new(Some(accept_tx)),
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Register a new client and hand its transport to the server.
    ///
    /// Returns `None` when the listener no longer accepts connections.
    pub fn connect(&self) -> Option<String> {
        let accept = self.accept_tx.lock();
        let tx = accept.as_ref()?;

        let (peer, server_end) = ChannelTransport::pair();
        let queued = peer.incoming().ok()?;
        let client_id = Uuid::now_v7().to_string();
        let slot = Arc::new(ClientSlot {
            peer,
            queued: Mutex::new(queued),
            last_activity: Mutex::new(Instant::now()),
        });

        let _ = self.clients.lock().insert(client_id.clone(), slot);
        if tx.send(Arc::new(server_end)).is_err() {
            let _ = self.clients.lock().remove(&client_id);
            return None;
        }
        info!(client_id, "client connected");
        Some(client_id)
    }

    /// Look up a client. An idle client found here is evicted instead.
    pub fn client(&self, client_id: &str) -> Option<Arc<ClientSlot>> {
        let slot = self.clients.lock().get(client_id).cloned()?;
        if self.is_expired(&slot, Instant::now()) {
            self.remove(client_id);
            info!(client_id, "client expired");
            return None;
        }
        Some(slot)
    }

    /// Forget a client and release its peer end.
    ///
    /// Closing the peer completes the server-side transport, so the session
    /// bound to it tears down.
    pub fn remove(&self, client_id: &str) {
        if let Some(slot) = self.clients.lock().remove(client_id) {
            slot.peer.close();
            debug!(client_id, "client removed");
        }
    }

    /// Evict every client idle for longer than the timeout.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Arc<ClientSlot>)> = {
            let mut clients = self.clients.lock();
            let ids: Vec<String> = clients
                .iter()
                .filter(|(_, slot)| self.is_expired(slot, now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| clients.remove(&id).map(|slot| (id, slot)))
                .collect()
        };

        for (client_id, slot) in &expired {
            slot.peer.close();
            info!(client_id, "evicted idle client");
        }
        expired.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn close(&self) {
        if self.accept_tx.lock().take().is_some() {
            info!("listener closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.accept_tx.lock().is_none()
    }

    fn is_expired(&self, slot: &ClientSlot, now: Instant) -> bool {
        self.idle_timeout
            .is_some_and(|timeout| slot.idle_for(now) > timeout)
    }
}
