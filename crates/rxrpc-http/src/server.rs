//! Long-polling listener: the server side of the HTTP surface.
//!
//! Mount [`PollingListener::router`] into an axum application (nest it under
//! a prefix to match the client's base URL) and pass the listener to the
//! rxrpc server as its [`TransportListener`].

mod handlers;
mod state;

use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::Router;
use futures::StreamExt;
use parking_lot::Mutex;
use rxrpc_core::settings::ListenerConfig;
use rxrpc_core::{Transport, TransportError, TransportListener, TransportStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use state::ListenerState;

/// Accepts polling clients over HTTP.
pub struct PollingListener {
    state: Arc<ListenerState>,
    accept_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn Transport>>>>,
}

impl PollingListener {
    /// Create a listener with no clients and the default idle timeout.
    pub fn new() -> Self {
        Self::with_config(&ListenerConfig::default())
    }

    /// Create a listener with no clients.
    pub fn with_config(config: &ListenerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(ListenerState::new(tx, config.idle_timeout())),
            accept_rx: Mutex::new(Some(rx)),
        }
    }

    /// Router serving `/connect`, `/message`, and `/polling`.
    pub fn router(&self) -> Router {
        handlers::router(Arc::clone(&self.state))
    }

    /// Number of clients that connected and were not yet found gone.
    pub fn client_count(&self) -> usize {
        self.state.client_count()
    }

    /// Whether new connections are refused.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Evict clients that stopped polling and sending. Returns how many.
    ///
    /// Runs periodically once [`TransportListener::connections`] is taken
    /// inside a runtime.
    pub fn evict_idle(&self) -> usize {
        self.state.evict_idle()
    }
}

/// Floor for the sweep period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Periodically evict idle clients until the state is dropped.
async fn sweep_loop(state: Weak<ListenerState>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let _ = interval.tick().await;
        let Some(state) = state.upgrade() else {
            break;
        };
        let evicted = state.evict_idle();
        if evicted > 0 {
            debug!(evicted, remaining = state.client_count(), "idle sweep");
        }
    }
}

impl Default for PollingListener {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportListener for PollingListener {
    fn connections(&self) -> Result<TransportStream, TransportError> {
        let rx = self
            .accept_rx
            .lock()
            .take()
            .ok_or(TransportError::AlreadyTaken)?;

        if let (Some(timeout), Ok(handle)) = (
            self.state.idle_timeout(),
            tokio::runtime::Handle::try_current(),
        ) {
            let every = (timeout / 2).max(MIN_SWEEP_INTERVAL);
            drop(handle.spawn(sweep_loop(Arc::downgrade(&self.state), every)));
        }
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn close(&self) {
        self.state.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::CLIENT_ID_HEADER;

    fn post(path: &str, client_id: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(path);
        if let Some(id) = client_id {
            builder = builder.header(CLIENT_ID_HEADER, id);
        }
        builder.body(Body::from(body.to_owned())).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn connect(listener: &PollingListener) -> String {
        let response = listener
            .router()
            .oneshot(post("/connect", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response.headers()[CLIENT_ID_HEADER]
            .to_str()
            .unwrap()
            .to_owned()
    }

    #[tokio::test]
    async fn connect_emits_transport_and_returns_id() {
        let listener = PollingListener::new();
        let mut connections = listener.connections().unwrap();

        let id = connect(&listener).await;
        assert!(!id.is_empty());
        assert_eq!(listener.client_count(), 1);

        let server_end = connections.next().await.unwrap();
        assert!(server_end.incoming().is_ok());
    }

    #[tokio::test]
    async fn message_reaches_server_transport() {
        let listener = PollingListener::new();
        let mut connections = listener.connections().unwrap();
        let id = connect(&listener).await;
        let server_end = connections.next().await.unwrap();
        let mut incoming = server_end.incoming().unwrap();

        let response = listener
            .router()
            .oneshot(post("/message", Some(&id), "hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(incoming.next().await, Some(Ok("hello".to_owned())));
    }

    #[tokio::test]
    async fn polling_returns_queued_messages_joined() {
        let listener = PollingListener::new();
        let mut connections = listener.connections().unwrap();
        let id = connect(&listener).await;
        let server_end = connections.next().await.unwrap();

        server_end.send("a".into()).unwrap();
        server_end.send("b".into()).unwrap();

        let response = listener
            .router()
            .oneshot(post("/polling", Some(&id), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "a\nb");

        // Nothing queued: empty 200.
        let response = listener
            .router()
            .oneshot(post("/polling", Some(&id), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "");
    }

    #[tokio::test]
    async fn completed_server_side_is_gone_after_drain() {
        let listener = PollingListener::new();
        let mut connections = listener.connections().unwrap();
        let id = connect(&listener).await;
        let server_end = connections.next().await.unwrap();

        server_end.send("bye".into()).unwrap();
        server_end.complete();

        let response = listener
            .router()
            .oneshot(post("/polling", Some(&id), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "bye");

        let response = listener
            .router()
            .oneshot(post("/polling", Some(&id), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
        assert_eq!(listener.client_count(), 0);

        let response = listener
            .router()
            .oneshot(post("/polling", Some(&id), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_or_unknown_client_id() {
        let listener = PollingListener::new();
        for path in ["/message", "/polling"] {
            let response = listener.router().oneshot(post(path, None, "")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);

            let response = listener
                .router()
                .oneshot(post(path, Some("nobody"), ""))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn closed_listener_refuses_connect() {
        let listener = PollingListener::new();
        let _connections = listener.connections().unwrap();
        listener.close();
        assert!(listener.is_closed());

        let response = listener
            .router()
            .oneshot(post("/connect", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn message_after_server_side_dropped_is_gone() {
        let listener = PollingListener::new();
        let mut connections = listener.connections().unwrap();
        let id = connect(&listener).await;
        let server_end = connections.next().await.unwrap();
        drop(server_end.incoming().unwrap());

        let response = listener
            .router()
            .oneshot(post("/message", Some(&id), "hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    fn idle_listener(idle_timeout_ms: u64) -> PollingListener {
        PollingListener::with_config(&ListenerConfig { idle_timeout_ms })
    }

    #[tokio::test(start_paused = true)]
    async fn idle_client_is_evicted_and_server_side_ends() {
        let listener = idle_listener(100);
        let mut connections = listener.connections().unwrap();
        let id = connect(&listener).await;
        let server_end = connections.next().await.unwrap();
        let mut incoming = server_end.incoming().unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        let _ = listener.evict_idle();
        assert_eq!(listener.client_count(), 0);
        assert_eq!(incoming.next().await, None);

        let response = listener
            .router()
            .oneshot(post("/polling", Some(&id), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_keeps_client_alive() {
        let listener = idle_listener(100);
        let _connections = listener.connections().unwrap();
        let id = connect(&listener).await;

        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(60)).await;
            let response = listener
                .router()
                .oneshot(post("/polling", Some(&id), ""))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(listener.evict_idle(), 0);
        assert_eq!(listener.client_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_without_requests() {
        let listener = idle_listener(100);
        let _connections = listener.connections().unwrap();
        let _ = connect(&listener).await;
        let _ = connect(&listener).await;
        assert_eq!(listener.client_count(), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(listener.client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_never_evicts() {
        let listener = idle_listener(0);
        let _connections = listener.connections().unwrap();
        let _ = connect(&listener).await;

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(listener.evict_idle(), 0);
        assert_eq!(listener.client_count(), 1);
    }

    #[test]
    fn connections_can_be_taken_once() {
        let listener = PollingListener::new();
        assert!(listener.connections().is_ok());
        assert!(matches!(
            listener.connections(),
            Err(TransportError::AlreadyTaken)
        ));
    }
}
