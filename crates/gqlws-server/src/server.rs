//! GraphQL WebSocket server coordinator
//!
//! Owns the shared configuration, engine and hooks, accepts connections from
//! an [`Acceptor`] and spawns one connection task per transport. Disposal is
//! signalled through a `watch` channel every connection observes, and a
//! `TaskTracker` waits for the connection tasks to finish.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use gqlws_protocol::{CloseCode, GRAPHQL_TRANSPORT_WS_PROTOCOL};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionClosed, Services, ShutdownMode};
use crate::context::ConnectionContext;
use crate::execution::{GraphQLEngine, OperationKind};
use crate::hooks::{NoopHooks, ServerHooks};
use crate::transport::{Acceptor, TcpAcceptor, Transport};
use crate::{Result, ServerError};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A live connection as seen by the coordinator
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub peer_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
}

/// GraphQL over WebSocket server
///
/// Cheap to clone; clones share connections and shutdown state.
#[derive(Clone)]
pub struct GraphQLWsServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    services: Arc<Services>,
    shutdown: watch::Sender<ShutdownMode>,
    tracker: TaskTracker,
    connections: RwLock<HashMap<String, ConnectionInfo>>,
}

impl GraphQLWsServer {
    pub fn builder() -> GraphQLWsServerBuilder {
        GraphQLWsServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.services.config
    }

    /// Run one connection to completion over any transport
    ///
    /// `extra` is exposed to hooks through [`ConnectionContext::extra`].
    pub async fn serve_connection(
        &self,
        transport: Transport,
        extra: Option<Arc<dyn Any + Send + Sync>>,
    ) -> ConnectionClosed {
        self.inner
            .tracker
            .track_future(self.clone().run_connection(transport, extra))
            .await
    }

    async fn run_connection(
        self,
        transport: Transport,
        extra: Option<Arc<dyn Any + Send + Sync>>,
    ) -> ConnectionClosed {
        let Transport { mut sink, source, info } = transport;
        let ctx = ConnectionContext::with_extra(info, extra);
        let connection_id = ctx.connection_id().to_string();

        if ctx.transport().subprotocol.as_deref() != Some(GRAPHQL_TRANSPORT_WS_PROTOCOL) {
            warn!(
                "Connection {} did not negotiate {} (offered: {:?})",
                connection_id,
                GRAPHQL_TRANSPORT_WS_PROTOCOL,
                ctx.transport().subprotocol
            );
            let code = CloseCode::SubprotocolNotAcceptable;
            if let Err(err) = sink.close(code.code(), code.reason()).await {
                debug!("Failed to close connection {}: {}", connection_id, err);
            }
            return ConnectionClosed {
                connection_id,
                code: code.code(),
                reason: code.reason().to_string(),
                was_acknowledged: false,
            };
        }

        self.inner.connections.write().insert(
            connection_id.clone(),
            ConnectionInfo {
                connection_id: connection_id.clone(),
                peer_addr: ctx.transport().peer_addr,
                connected_at: ctx.connected_at(),
            },
        );

        let shutdown = self.inner.shutdown.subscribe();
        let span = info_span!("connection", connection_id = %connection_id);
        let closed = Connection::new(ctx, sink, self.inner.services.clone(), shutdown)
            .run(source)
            .instrument(span)
            .await;

        self.inner.connections.write().remove(&connection_id);
        closed
    }

    /// Bind a TCP listener at the configured address
    pub async fn bind(&self) -> Result<TcpAcceptor> {
        let config = self.config();
        let acceptor = TcpAcceptor::bind(config.bind_address, config.handshake_timeout).await?;
        Ok(acceptor)
    }

    /// Start accepting connections in the background
    pub fn start<A: Acceptor + 'static>(&self, acceptor: A) -> ServerHandle {
        let local_addr = acceptor.local_addr();
        if let Some(addr) = local_addr {
            info!("GraphQL WebSocket server listening on {}", addr);
        }
        let accept_task = tokio::spawn(self.clone().accept_loop(acceptor));
        ServerHandle {
            server: self.clone(),
            local_addr,
            accept_task,
        }
    }

    /// Serve on the configured address until Ctrl-C, then dispose gracefully
    pub async fn run(&self) -> Result<()> {
        let handle = self.start(self.bind().await?);
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received, draining connections");
        handle.dispose(true).await;
        Ok(())
    }

    async fn accept_loop<A: Acceptor>(self, mut acceptor: A) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() != ShutdownMode::Running {
                break;
            }
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                accepted = acceptor.accept() => match accepted {
                    Ok(Some(pending)) => {
                        let server = self.clone();
                        self.inner.tracker.spawn(async move {
                            match pending.await {
                                Ok(transport) => {
                                    server.run_connection(transport, None).await;
                                }
                                Err(err) => warn!("Connection upgrade failed: {}", err),
                            }
                        });
                    }
                    Ok(None) => {
                        debug!("Acceptor exhausted");
                        break;
                    }
                    Err(err) => {
                        error!("Failed to accept connection: {}", err);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
        info!("Accept loop stopped");
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.connections.read().values().cloned().collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow() != ShutdownMode::Running
    }

    /// Signal every connection and the accept loop; never downgrades a
    /// forceful request to a graceful one
    fn request_shutdown(&self, graceful: bool) {
        let mode = if graceful {
            ShutdownMode::Graceful
        } else {
            ShutdownMode::Forceful
        };
        self.inner.shutdown.send_if_modified(|current| {
            if *current == mode || *current == ShutdownMode::Forceful {
                return false;
            }
            *current = mode;
            true
        });
    }

    /// Dispose the server
    ///
    /// Graceful: stop accepting, let in-flight operations finish, close each
    /// connection with `1000` once it is idle. Forceful: cancel everything and
    /// close with `1001`. Resolves once every connection task has finished.
    pub async fn dispose(&self, graceful: bool) {
        info!(
            "Disposing server ({}, {} connection(s))",
            if graceful { "graceful" } else { "forceful" },
            self.connection_count()
        );
        self.request_shutdown(graceful);
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Server disposed");
    }
}

/// Handle to a running accept loop
pub struct ServerHandle {
    server: GraphQLWsServer,
    local_addr: Option<SocketAddr>,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }

    pub fn server(&self) -> &GraphQLWsServer {
        &self.server
    }

    /// Stop the accept loop, then dispose every connection
    pub async fn dispose(self, graceful: bool) {
        self.server.request_shutdown(graceful);
        if let Err(err) = self.accept_task.await {
            error!("Accept loop failed: {}", err);
        }
        self.server.dispose(graceful).await;
    }
}

/// Builder for [`GraphQLWsServer`]
pub struct GraphQLWsServerBuilder {
    config: ServerConfig,
    engine: Option<Arc<dyn GraphQLEngine>>,
    hooks: Arc<dyn ServerHooks>,
    roots: HashMap<OperationKind, Value>,
}

impl GraphQLWsServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            engine: None,
            hooks: Arc::new(NoopHooks),
            roots: HashMap::new(),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine(mut self, engine: impl GraphQLEngine + 'static) -> Self {
        self.engine = Some(Arc::new(engine));
        self
    }

    pub fn shared_engine(mut self, engine: Arc<dyn GraphQLEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn hooks(mut self, hooks: impl ServerHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn shared_hooks(mut self, hooks: Arc<dyn ServerHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.config.bind_address = addr;
        self
    }

    /// Zero disables the init deadline
    pub fn connection_init_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_init_wait_timeout = Some(timeout);
        self
    }

    /// Zero disables server pings
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = Some(interval);
        self
    }

    pub fn disable_keep_alive(mut self) -> Self {
        self.config.keep_alive_interval = None;
        self
    }

    pub fn outbound_buffer_size(mut self, size: usize) -> Self {
        self.config.outbound_buffer_size = size;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Root value passed to every operation of the given kind
    pub fn root_value(mut self, kind: OperationKind, value: Value) -> Self {
        self.roots.insert(kind, value);
        self
    }

    pub fn build(self) -> Result<GraphQLWsServer> {
        let engine = self
            .engine
            .ok_or_else(|| ServerError::Config("A GraphQL engine is required".to_string()))?;
        if self.config.outbound_buffer_size == 0 {
            return Err(ServerError::Config(
                "outbound_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.config.handshake_timeout.is_zero() {
            return Err(ServerError::Config(
                "handshake_timeout must be greater than zero".to_string(),
            ));
        }

        let (shutdown, _) = watch::channel(ShutdownMode::Running);
        Ok(GraphQLWsServer {
            inner: Arc::new(ServerInner {
                services: Arc::new(Services {
                    engine,
                    hooks: self.hooks,
                    config: self.config,
                    roots: self.roots,
                }),
                shutdown,
                tracker: TaskTracker::new(),
                connections: RwLock::new(HashMap::new()),
            }),
        })
    }
}

impl Default for GraphQLWsServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestEngine, memory_acceptor, memory_transport, memory_transport_with};
    use crate::transport::TransportInfo;
    use gqlws_protocol::{Message, SubscribePayload};

    fn server() -> GraphQLWsServer {
        GraphQLWsServer::builder()
            .engine(TestEngine::new())
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_engine() {
        let result = GraphQLWsServer::builder().build();
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[test]
    fn test_builder_rejects_empty_buffer() {
        let result = GraphQLWsServer::builder()
            .engine(TestEngine::new())
            .outbound_buffer_size(0)
            .build();
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[test]
    fn test_builder_applies_settings() {
        let server = GraphQLWsServer::builder()
            .engine(TestEngine::new())
            .connection_init_wait_timeout(Duration::from_secs(1))
            .disable_keep_alive()
            .build()
            .unwrap();
        assert_eq!(
            server.config().connection_init_wait_timeout,
            Some(Duration::from_secs(1))
        );
        assert_eq!(server.config().keep_alive_interval, None);
    }

    #[tokio::test]
    async fn test_rejects_missing_subprotocol() {
        let server = server();
        let (transport, mut client) = memory_transport_with(TransportInfo::default());

        let closed = server.serve_connection(transport, None).await;
        assert_eq!(closed.code, 4406);
        assert_eq!(client.expect_close().await.0, 4406);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_subprotocol_rejection_is_logged() {
        let server = server();
        let (transport, _client) = memory_transport_with(TransportInfo::default());

        server.serve_connection(transport, None).await;
        assert!(logs_contain("did not negotiate graphql-transport-ws"));
    }

    #[tokio::test]
    async fn test_serve_connection_tracks_live_connections() {
        let server = server();
        let (transport, mut client) = memory_transport();

        let task = tokio::spawn({
            let server = server.clone();
            async move { server.serve_connection(transport, None).await }
        });

        client.init().await;
        assert_eq!(server.connection_count(), 1);

        client.disconnect();
        let closed = task.await.unwrap();
        assert!(closed.was_acknowledged);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_dispose_stops_accepting() {
        let server = server();
        let (acceptor, connector) = memory_acceptor();
        let handle = server.start(acceptor);

        let mut client = connector.connect();
        client.init().await;
        client
            .send(&Message::subscribe("1", SubscribePayload::new("{ getValue }")))
            .await;
        assert!(matches!(client.recv_message().await, Message::Next { .. }));
        assert_eq!(client.recv_message().await, Message::complete("1"));

        handle.dispose(true).await;
        assert_eq!(client.expect_close().await.0, 1000);
        assert!(server.is_shutting_down());
        assert!(connector.try_connect().is_none());
    }
}
