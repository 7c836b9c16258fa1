//! In-process transport built on unbounded `mpsc` channels.
//!
//! Used for embedding a server and client in one process and as the
//! server-side half of the HTTP polling listener.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{
    IncomingStream, Transport, TransportConnector, TransportError, TransportListener,
    TransportStream,
};

type Item = Result<String, TransportError>;

/// One end of an in-memory duplex pipe.
#[derive(Debug)]
pub struct ChannelTransport {
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Item>>>,
    /// Sender into the peer's incoming queue. `None` once completed.
    outgoing: Mutex<Option<mpsc::UnboundedSender<Item>>>,
    closed: CancellationToken,
}

impl ChannelTransport {
    fn new(incoming: mpsc::UnboundedReceiver<Item>, outgoing: mpsc::UnboundedSender<Item>) -> Self {
        Self {
            incoming: Mutex::new(Some(incoming)),
            outgoing: Mutex::new(Some(outgoing)),
            closed: CancellationToken::new(),
        }
    }

    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_rx, b_tx), Self::new(b_rx, a_tx))
    }

    /// Terminate the peer's incoming stream with `error`.
    pub fn fail(&self, error: TransportError) {
        if let Some(tx) = self.outgoing.lock().take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Whether this end has signalled the end of its outgoing messages.
    pub fn is_completed(&self) -> bool {
        self.outgoing.lock().is_none()
    }
}

impl Transport for ChannelTransport {
    fn incoming(&self) -> Result<IncomingStream, TransportError> {
        let rx = self
            .incoming
            .lock()
            .take()
            .ok_or(TransportError::AlreadyTaken)?;
        let closed = self.closed.clone().cancelled_owned();
        Ok(UnboundedReceiverStream::new(rx).take_until(closed).boxed())
    }

    fn send(&self, message: String) -> Result<(), TransportError> {
        let guard = self.outgoing.lock();
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        tx.send(Ok(message)).map_err(|_| TransportError::Closed)
    }

    fn complete(&self) {
        let _ = self.outgoing.lock().take();
    }

    fn close(&self) {
        self.complete();
        self.closed.cancel();
    }
}

/// Listener handing out [`ChannelTransport`] server ends.
pub struct ChannelListener {
    accept_tx: Mutex<Option<mpsc::UnboundedSender<Arc<dyn Transport>>>>,
    accept_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn Transport>>>>,
}

impl ChannelListener {
    /// Create a listener with no connections yet.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            accept_tx: Mutex::new(Some(tx)),
            accept_rx: Mutex::new(Some(rx)),
        }
    }

    /// Open a connection and return the client end.
    pub fn connect_local(&self) -> Result<ChannelTransport, TransportError> {
        let guard = self.accept_tx.lock();
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        let (client, server) = ChannelTransport::pair();
        tx.send(Arc::new(server))
            .map_err(|_| TransportError::Closed)?;
        Ok(client)
    }
}

impl Default for ChannelListener {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportListener for ChannelListener {
    fn connections(&self) -> Result<TransportStream, TransportError> {
        let rx = self
            .accept_rx
            .lock()
            .take()
            .ok_or(TransportError::AlreadyTaken)?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn close(&self) {
        let _ = self.accept_tx.lock().take();
    }
}

#[async_trait]
impl TransportConnector for ChannelListener {
    async fn connect(&self, _address: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let transport: Arc<dyn Transport> = Arc::new(self.connect_local()?);
        Ok(transport)
    }
}
