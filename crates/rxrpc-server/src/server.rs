//! `RpcServer`: accepts transports and runs one session per transport.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use rxrpc_core::settings::ServerConfig;
use rxrpc_core::{Codec, JsonCodec, TransportError, TransportListener, TransportStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::DispatcherFactory;
use crate::session::{Session, SessionContext, SessionId};

/// Errors from starting a server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `start` was already called.
    #[error("server already started")]
    AlreadyStarted,
    /// The listener could not provide its connection stream.
    #[error("listener failed: {0}")]
    Listener(#[from] TransportError),
}

/// Open sessions of one server.
#[derive(Default)]
pub struct SessionSet {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session.
    pub fn insert(&self, session: Arc<Session>) {
        let _ = self.sessions.lock().insert(session.id(), session);
    }

    /// Stop tracking a session.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().remove(&id)
    }

    /// Look up a tracked session.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Copy of every tracked session.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The rxrpc server.
pub struct RpcServer {
    config: ServerConfig,
    listener: Arc<dyn TransportListener>,
    context: SessionContext,
    sessions: Arc<SessionSet>,
    /// Cancels the accept loop. `None` until started.
    accept: Mutex<Option<CancellationToken>>,
}

impl RpcServer {
    /// Create a server using the JSON codec.
    pub fn new(
        config: ServerConfig,
        listener: Arc<dyn TransportListener>,
        factory: Arc<dyn DispatcherFactory>,
    ) -> Self {
        Self::with_codec(config, listener, factory, Arc::new(JsonCodec))
    }

    /// Create a server with a custom codec.
    pub fn with_codec(
        config: ServerConfig,
        listener: Arc<dyn TransportListener>,
        factory: Arc<dyn DispatcherFactory>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            config,
            listener,
            context: SessionContext { codec, factory },
            sessions: Arc::new(SessionSet::new()),
            accept: Mutex::new(None),
        }
    }

    /// Begin accepting transports. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut accept = self.accept.lock();
        if accept.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let connections = self.listener.connections()?;
        let token = CancellationToken::new();
        *accept = Some(token.clone());

        let _ = tokio::spawn(accept_loop(
            connections,
            self.context.clone(),
            Arc::clone(&self.sessions),
            self.config.max_sessions,
            token,
        ));
        info!(max_sessions = self.config.max_sessions, "server started");
        Ok(())
    }

    /// Stop accepting, then close every open session. Idempotent.
    pub fn stop(&self) {
        if let Some(token) = self.accept.lock().as_ref() {
            token.cancel();
        }
        self.listener.close();

        let sessions = self.sessions.snapshot();
        debug!(open = sessions.len(), "stopping server");
        for session in sessions {
            session.close();
        }
    }

    /// Whether `start` has been called.
    pub fn is_started(&self) -> bool {
        self.accept.lock().is_some()
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Tracked sessions.
    pub fn sessions(&self) -> &Arc<SessionSet> {
        &self.sessions
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    mut connections: TransportStream,
    context: SessionContext,
    sessions: Arc<SessionSet>,
    max_sessions: usize,
    stop: CancellationToken,
) {
    loop {
        let transport = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            next = connections.next() => match next {
                Some(transport) => transport,
                None => {
                    debug!("listener stopped producing transports");
                    break;
                }
            },
        };

        if max_sessions > 0 && sessions.len() >= max_sessions {
            warn!(max_sessions, "session limit reached, rejecting transport");
            transport.close();
            continue;
        }
        let session = Session::start(transport, &context, &sessions);
        // stop() may have taken its snapshot before this session was tracked.
        if stop.is_cancelled() {
            debug!(session_id = %session.id(), "server stopped during accept");
            session.close();
            break;
        }
        debug!(session_id = %session.id(), open = sessions.len(), "transport accepted");
    }
    debug!("accept loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use rxrpc_core::transport::{ChannelListener, ChannelTransport};
    use rxrpc_core::{Invocation, Response, Transport};
    use serde_json::json;

    use crate::dispatch::{self, MethodRegistry};

    const WAIT: Duration = Duration::from_secs(2);

    fn registry() -> MethodRegistry {
        let mut reg = MethodRegistry::new();
        reg.register_fn("echo", |a, _| Ok(dispatch::single(a.get::<String>("value")?)));
        reg
    }

    fn server(listener: &Arc<ChannelListener>, config: ServerConfig) -> RpcServer {
        RpcServer::new(
            config,
            Arc::clone(listener) as Arc<dyn TransportListener>,
            Arc::new(registry()),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn echo_roundtrip(client: &ChannelTransport, id: i64) -> Vec<Response> {
        let mut incoming = client.incoming().unwrap();
        let text = JsonCodec
            .encode_invocation(&Invocation::subscribe(
                id,
                "echo",
                [("value".to_owned(), json!("hi"))].into(),
            ))
            .unwrap();
        client.send(text).unwrap();

        let mut out = Vec::new();
        for _ in 0..2 {
            let text = tokio::time::timeout(WAIT, incoming.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            out.push(JsonCodec.decode_response(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn serves_each_transport_in_its_own_session() {
        let listener = Arc::new(ChannelListener::new());
        let server = server(&listener, ServerConfig::default());
        server.start().unwrap();

        let a = listener.connect_local().unwrap();
        let b = listener.connect_local().unwrap();

        assert_eq!(echo_roundtrip(&a, 1).await, vec![
            Response::data(1, json!("hi")),
            Response::complete(1)
        ]);
        assert_eq!(echo_roundtrip(&b, 1).await, vec![
            Response::data(1, json!("hi")),
            Response::complete(1)
        ]);
        assert_eq!(server.session_count(), 2);
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let listener = Arc::new(ChannelListener::new());
        let server = server(&listener, ServerConfig::default());
        server.start().unwrap();
        assert!(server.is_started());
        assert_matches!(server.start(), Err(ServerError::AlreadyStarted));
    }

    #[tokio::test]
    async fn start_fails_when_connections_taken() {
        let listener = Arc::new(ChannelListener::new());
        let _taken = listener.connections().unwrap();
        let server = server(&listener, ServerConfig::default());
        assert_matches!(
            server.start(),
            Err(ServerError::Listener(TransportError::AlreadyTaken))
        );
        assert!(!server.is_started());
    }

    #[tokio::test]
    async fn session_removed_when_client_disconnects() {
        let listener = Arc::new(ChannelListener::new());
        let server = server(&listener, ServerConfig::default());
        server.start().unwrap();

        let client = listener.connect_local().unwrap();
        let sessions = Arc::clone(server.sessions());
        wait_until(|| sessions.len() == 1).await;

        client.complete();
        wait_until(|| sessions.is_empty()).await;
    }

    #[tokio::test]
    async fn stop_closes_sessions_and_refuses_new_transports() {
        let listener = Arc::new(ChannelListener::new());
        let server = server(&listener, ServerConfig::default());
        server.start().unwrap();

        let client = listener.connect_local().unwrap();
        let mut incoming = client.incoming().unwrap();
        let sessions = Arc::clone(server.sessions());
        wait_until(|| sessions.len() == 1).await;
        let session = sessions.snapshot().remove(0);

        server.stop();

        assert!(session.is_closed());
        assert!(server.sessions().is_empty());
        // Outgoing side was completed.
        let end = tokio::time::timeout(WAIT, incoming.next()).await.unwrap();
        assert!(end.is_none());
        assert_matches!(listener.connect_local(), Err(TransportError::Closed));

        // Idempotent.
        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_while_transports_arrive_leaves_no_session_open() {
        let listener = Arc::new(ChannelListener::new());
        let server = server(&listener, ServerConfig::default());
        server.start().unwrap();

        let connecting = Arc::clone(&listener);
        let producer = tokio::spawn(async move {
            let mut clients = Vec::new();
            while let Ok(client) = connecting.connect_local() {
                clients.push(client);
                tokio::task::yield_now().await;
            }
            clients
        });

        let sessions = Arc::clone(server.sessions());
        wait_until(|| sessions.len() >= 3).await;
        server.stop();
        let clients = producer.await.unwrap();

        for client in &clients {
            let mut incoming = client.incoming().unwrap();
            let end = tokio::time::timeout(WAIT, async {
                while let Some(item) = incoming.next().await {
                    drop(item);
                }
            })
            .await;
            assert!(end.is_ok(), "a client stayed connected after stop");
        }
        wait_until(|| sessions.is_empty()).await;
    }

    #[tokio::test]
    async fn session_limit_rejects_extra_transports() {
        let listener = Arc::new(ChannelListener::new());
        let server = server(&listener, ServerConfig { max_sessions: 1 });
        server.start().unwrap();

        let first = listener.connect_local().unwrap();
        let sessions = Arc::clone(server.sessions());
        wait_until(|| sessions.len() == 1).await;

        let second = listener.connect_local().unwrap();
        let mut rejected = second.incoming().unwrap();
        let end = tokio::time::timeout(WAIT, rejected.next()).await.unwrap();
        assert!(end.is_none());
        assert_eq!(server.session_count(), 1);

        assert_eq!(echo_roundtrip(&first, 5).await[1], Response::complete(5));
    }

    #[tokio::test]
    async fn dropping_server_stops_it() {
        let listener = Arc::new(ChannelListener::new());
        let server = server(&listener, ServerConfig::default());
        server.start().unwrap();

        let client = listener.connect_local().unwrap();
        let sessions = Arc::clone(server.sessions());
        wait_until(|| sessions.len() == 1).await;

        drop(server);
        assert!(sessions.is_empty());
        assert!(client.incoming().is_ok());
    }

    #[tokio::test]
    async fn session_set_lookup() {
        let listener = Arc::new(ChannelListener::new());
        let server = server(&listener, ServerConfig::default());
        server.start().unwrap();
        let _client = listener.connect_local().unwrap();

        let sessions = Arc::clone(server.sessions());
        wait_until(|| sessions.len() == 1).await;
        let id = sessions.snapshot()[0].id();
        assert!(sessions.get(id).is_some());
        assert!(sessions.remove(id).is_some());
        assert!(sessions.get(id).is_none());
    }
}
