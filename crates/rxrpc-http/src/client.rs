//! Long-polling client transport.
//!
//! [`PollingConnector::connect`] performs the `/connect` handshake and returns
//! a [`PollingTransport`] with two background tasks: one posting outgoing
//! messages in order, one polling for incoming messages.

mod poll_loop;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use rxrpc_core::settings::PollingConfig;
use rxrpc_core::{IncomingStream, Transport, TransportConnector, TransportError};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{CLIENT_ID_HEADER, CONNECT_PATH, MESSAGE_PATH, POLLING_PATH};

use poll_loop::poll_loop;

type Item = Result<String, TransportError>;

/// Capacity of the send-failure broadcast channel.
const SEND_FAILURE_CAPACITY: usize = 64;

/// Most messages posted after shutdown that were queued before it.
const FLUSH_LIMIT: usize = 64;

/// Upper bound on the post-shutdown flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolved URLs for one connected client.
#[derive(Debug)]
pub(crate) struct Endpoint {
    client_id: String,
    message_url: String,
    polling_url: String,
}

/// Connects to a polling listener.
#[derive(Clone, Debug)]
pub struct PollingConnector {
    http: Client,
    config: PollingConfig,
}

impl PollingConnector {
    /// Create a connector with its own HTTP client.
    pub fn new(config: PollingConfig) -> Result<Self, TransportError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TransportError::Connect(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(http, config))
    }

    /// Create a connector sharing an existing HTTP client.
    pub fn with_client(http: Client, config: PollingConfig) -> Self {
        Self { http, config }
    }

    /// Perform the handshake against `base_url` and start the transport.
    ///
    /// Must be called from within a Tokio runtime.
    #[instrument(skip(self))]
    pub async fn connect_polling(&self, base_url: &str) -> Result<PollingTransport, TransportError> {
        let base = base_url.trim_end_matches('/');
        let response = self
            .http
            .post(format!("{base}{CONNECT_PATH}"))
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Connect(format!(
                "handshake rejected with status {status}"
            )));
        }

        let client_id = response
            .headers()
            .get(CLIENT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(TransportError::MissingClientId)?
            .to_owned();
        info!(client_id, "connected");

        let endpoint = Endpoint {
            message_url: format!("{base}{MESSAGE_PATH}"),
            polling_url: format!("{base}{POLLING_PATH}"),
            client_id,
        };
        Ok(PollingTransport::start(
            self.http.clone(),
            endpoint,
            &self.config,
        ))
    }
}

#[async_trait]
impl TransportConnector for PollingConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let transport: Arc<dyn Transport> = Arc::new(self.connect_polling(address).await?);
        Ok(transport)
    }
}

/// Client end of a polling duplex channel.
///
/// Incoming messages end normally once the server side is gone or the
/// transport is closed, and with an `Err` when polling exhausted its retries.
#[derive(Debug)]
pub struct PollingTransport {
    client_id: String,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Item>>>,
    /// Queue feeding the send task. `None` once completed.
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    send_failures: broadcast::Sender<TransportError>,
    shutdown: CancellationToken,
}

impl PollingTransport {
    fn start(http: Client, endpoint: Endpoint, config: &PollingConfig) -> Self {
        let endpoint = Arc::new(endpoint);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (send_failures, _) = broadcast::channel(SEND_FAILURE_CAPACITY);
        let shutdown = CancellationToken::new();

        let propagate = config.propagate_send_errors.then(|| incoming_tx.clone());
        let _ = tokio::spawn(send_loop(
            http.clone(),
            Arc::clone(&endpoint),
            outgoing_rx,
            send_failures.clone(),
            propagate,
            shutdown.clone(),
        ));
        let _ = tokio::spawn(poll_loop(
            http,
            Arc::clone(&endpoint),
            incoming_tx,
            config.polling_period(),
            config.retry_policy(),
            shutdown.clone(),
        ));

        Self {
            client_id: endpoint.client_id.clone(),
            incoming: Mutex::new(Some(incoming_rx)),
            outgoing: Mutex::new(Some(outgoing_tx)),
            send_failures,
            shutdown,
        }
    }

    /// Identifier assigned by the server at connect time.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Failures of individual outgoing messages.
    ///
    /// Only failures that happen after subscribing are observed.
    pub fn send_failures(&self) -> broadcast::Receiver<TransportError> {
        self.send_failures.subscribe()
    }

    /// Whether [`close`](Transport::close) was called or the server went away.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Transport for PollingTransport {
    fn incoming(&self) -> Result<IncomingStream, TransportError> {
        let rx = self
            .incoming
            .lock()
            .take()
            .ok_or(TransportError::AlreadyTaken)?;

        Ok(futures::stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            let item = rx.recv().await?;
            // Nothing follows the first error.
            let rest = item.is_ok().then_some(rx);
            Some((item, rest))
        })
        .boxed())
    }

    fn send(&self, message: String) -> Result<(), TransportError> {
        let guard = self.outgoing.lock();
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        tx.send(message).map_err(|_| TransportError::Closed)
    }

    fn complete(&self) {
        let _ = self.outgoing.lock().take();
    }

    fn close(&self) {
        self.complete();
        if !self.shutdown.is_cancelled() {
            debug!(client_id = %self.client_id, "closing polling transport");
            self.shutdown.cancel();
        }
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Post queued messages one at a time, preserving order.
#[instrument(skip_all, fields(client_id = %endpoint.client_id))]
async fn send_loop(
    http: Client,
    endpoint: Arc<Endpoint>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    failures: broadcast::Sender<TransportError>,
    propagate: Option<mpsc::UnboundedSender<Item>>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                flush(&http, &endpoint, &mut outgoing).await;
                break;
            }
            message = outgoing.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if let Err(e) = post_message(&http, &endpoint, message).await {
            let error = TransportError::Send(e.to_string());
            warn!(error = %error, "failed to deliver message");
            let _ = failures.send(error.clone());
            if let Some(incoming) = &propagate {
                let _ = incoming.send(Err(error));
                shutdown.cancel();
                break;
            }
        }
    }
    debug!("send loop exited");
}

/// Post what was queued before shutdown, within [`FLUSH_LIMIT`] and
/// [`FLUSH_TIMEOUT`].
async fn flush(
    http: &Client,
    endpoint: &Endpoint,
    outgoing: &mut mpsc::UnboundedReceiver<String>,
) {
    let mut pending = Vec::new();
    while pending.len() < FLUSH_LIMIT {
        match outgoing.try_recv() {
            Ok(message) => pending.push(message),
            Err(_) => break,
        }
    }
    if pending.is_empty() {
        return;
    }

    let count = pending.len();
    let posted = tokio::time::timeout(FLUSH_TIMEOUT, async {
        for message in pending {
            if let Err(e) = post_message(http, endpoint, message).await {
                debug!(error = %e, "flush stopped");
                break;
            }
        }
    })
    .await;
    if posted.is_err() {
        debug!(count, "flush timed out");
    } else {
        debug!(count, "flushed queued messages");
    }
}

async fn post_message(
    http: &Client,
    endpoint: &Endpoint,
    message: String,
) -> Result<(), reqwest::Error> {
    let _ = http
        .post(&endpoint.message_url)
        .header(CLIENT_ID_HEADER, &endpoint.client_id)
        .header(CONTENT_TYPE, "text/plain")
        .body(message)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
