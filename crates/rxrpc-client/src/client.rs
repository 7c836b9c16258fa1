//! `RpcClient`: issues invocations over a transport and routes responses.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use rxrpc_core::settings::ClientConfig;
use rxrpc_core::{
    Codec, IncomingStream, Invocation, InvocationId, JsonCodec, Response, ResponseKind, RpcError,
    Transport, TransportConnector,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::errors::ClientError;

type Item = Result<Value, ClientError>;

struct Inner {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    next_id: AtomicI64,
    /// Live subscriptions. `None` once disconnected.
    pending: Mutex<Option<HashMap<InvocationId, mpsc::UnboundedSender<Item>>>>,
    shutdown: CancellationToken,
}

/// Client side of one rxrpc connection.
///
/// Dropping the client closes its transport; every live subscription then
/// ends with [`ClientError::Disconnected`].
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    /// Start a client over `transport` using the JSON codec.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: &ClientConfig) -> Result<Self, ClientError> {
        Self::with_codec(transport, Arc::new(JsonCodec), config)
    }

    /// Start a client with a custom codec.
    pub fn with_codec(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let incoming = transport.incoming()?;
        let inner = Arc::new(Inner {
            transport,
            codec,
            next_id: AtomicI64::new(1),
            pending: Mutex::new(Some(HashMap::new())),
            shutdown: CancellationToken::new(),
        });

        let _ = tokio::spawn(route_responses(Arc::clone(&inner), incoming));
        if let Some(period) = config.keep_alive_interval() {
            let _ = tokio::spawn(keep_alive(Arc::downgrade(&inner), period));
        }
        Ok(Self { inner })
    }

    /// Connect through `connector` and start a client on the new transport.
    pub async fn connect(
        connector: &dyn TransportConnector,
        address: &str,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let transport = connector.connect(address).await?;
        info!(address, "connected");
        Self::new(transport, config)
    }

    /// Invoke `method` and stream its results.
    ///
    /// `arguments` must serialize to a JSON object (or `null` for none).
    pub fn subscribe(
        &self,
        method: &str,
        arguments: impl Serialize,
    ) -> Result<Subscription, ClientError> {
        let arguments = to_arguments(arguments)?;
        let id = self.inner.allocate_id();
        let (tx, rx) = mpsc::unbounded_channel();

        match self.inner.pending.lock().as_mut() {
            Some(pending) => {
                let _ = pending.insert(id, tx);
            }
            None => return Err(ClientError::Disconnected),
        }

        if let Err(e) = self.inner.send(&Invocation::subscribe(id, method, arguments)) {
            let _ = self.inner.take_pending(id);
            return Err(e);
        }
        debug!(invocation_id = id, method, "subscribed");

        Ok(Subscription {
            id,
            results: UnboundedReceiverStream::new(rx),
            client: Arc::downgrade(&self.inner),
            finished: false,
        })
    }

    /// Whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.inner.pending.lock().is_some()
    }

    /// Number of subscriptions that have not terminated.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().as_ref().map_or(0, HashMap::len)
    }

    /// Close the transport and fail every live subscription.
    pub fn close(&self) {
        self.inner.disconnect();
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.inner.disconnect();
    }
}

impl Inner {
    fn allocate_id(&self) -> InvocationId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, invocation: &Invocation) -> Result<(), ClientError> {
        let text = self.codec.encode_invocation(invocation)?;
        self.transport.send(text)?;
        Ok(())
    }

    fn take_pending(&self, id: InvocationId) -> Option<mpsc::UnboundedSender<Item>> {
        self.pending.lock().as_mut()?.remove(&id)
    }

    fn deliver(&self, response: Response) {
        let id = response.invocation_id;
        let mut pending = self.pending.lock();
        let Some(pending) = pending.as_mut() else {
            return;
        };
        match response.kind {
            ResponseKind::Data(value) => match pending.get(&id) {
                Some(tx) => {
                    let _ = tx.send(Ok(value));
                }
                None => trace!(invocation_id = id, "data for inactive invocation"),
            },
            ResponseKind::Error(body) => {
                if let Some(tx) = pending.remove(&id) {
                    let _ = tx.send(Err(ClientError::Rpc(RpcError::from(body))));
                }
            }
            ResponseKind::Complete => {
                let _ = pending.remove(&id);
            }
        }
    }

    /// Stop background work, release the transport, fail every pending call.
    fn disconnect(&self) {
        self.shutdown.cancel();
        let Some(pending) = self.pending.lock().take() else {
            return;
        };
        self.transport.close();
        if !pending.is_empty() {
            debug!(pending = pending.len(), "failing pending subscriptions");
        }
        for tx in pending.into_values() {
            let _ = tx.send(Err(ClientError::Disconnected));
        }
    }

    /// Forget `id` and tell the server to stop it, if it was still live.
    fn unsubscribe(&self, id: InvocationId) {
        if self.take_pending(id).is_none() {
            return;
        }
        if let Err(e) = self.send(&Invocation::unsubscribe(id)) {
            debug!(invocation_id = id, error = %e, "failed to send unsubscribe");
        }
    }
}

#[instrument(skip_all)]
async fn route_responses(inner: Arc<Inner>, mut incoming: IncomingStream) {
    loop {
        let next = tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => return,
            next = incoming.next() => next,
        };
        match next {
            Some(Ok(text)) => match inner.codec.decode_response(&text) {
                Ok(response) => inner.deliver(response),
                Err(e) => {
                    error!(error = %e, "undecodable response, disconnecting");
                    break;
                }
            },
            Some(Err(e)) => {
                warn!(error = %e, "transport failed");
                break;
            }
            None => {
                debug!("server completed the connection");
                break;
            }
        }
    }
    inner.disconnect();
}

async fn keep_alive(inner: Weak<Inner>, period: Duration) {
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        let shutdown = match inner.upgrade() {
            Some(inner) => inner.shutdown.clone(),
            None => return,
        };
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            _ = ticks.tick() => {}
        }

        let Some(inner) = inner.upgrade() else { return };
        let id = inner.allocate_id();
        if let Err(e) = inner.send(&Invocation::keep_alive(id)) {
            warn!(error = %e, "keep-alive failed, stopping");
            return;
        }
        trace!(invocation_id = id, "keep-alive sent");
    }
}

fn to_arguments(arguments: impl Serialize) -> Result<BTreeMap<String, Value>, ClientError> {
    match serde_json::to_value(arguments) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(Value::Null) => Ok(BTreeMap::new()),
        Ok(other) => Err(ClientError::InvalidArguments(format!(
            "expected an object, got {other}"
        ))),
        Err(e) => Err(ClientError::InvalidArguments(e.to_string())),
    }
}

/// Results of one invocation.
///
/// Yields each value, then ends after completion or after a single `Err`.
/// Dropping it before the end unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: InvocationId,
    results: UnboundedReceiverStream<Item>,
    client: Weak<Inner>,
    finished: bool,
}

impl Subscription {
    /// Invocation id on the wire.
    pub fn id(&self) -> InvocationId {
        self.id
    }

    /// Stop the invocation. Same as dropping.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Stream for Subscription {
    type Item = Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let next = self.results.poll_next_unpin(cx);
        if matches!(next, Poll::Ready(None)) {
            self.finished = true;
        }
        next
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            client.unsubscribe(self.id);
        }
    }
}
