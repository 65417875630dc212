//! # GraphQL WebSocket Server
//!
//! Server-side engine for the `graphql-transport-ws` protocol. It drives the
//! per-connection handshake, multiplexes concurrent operations by id, enforces
//! keep-alive and init deadlines, and disposes connections gracefully or
//! forcefully. GraphQL itself is delegated to a pluggable [`GraphQLEngine`].
//!
//! ## Features
//! - Connection state machine with the full close-code taxonomy
//! - Per-operation tasks with cancellation that reaches the engine's stream
//! - Ordered outbound writes through a single bounded queue per connection
//! - Lifecycle hooks for auth, argument rewriting and result transformation
//! - WebSocket transport on `tokio-tungstenite` with sub-protocol negotiation
//!
//! ```rust,ignore
//! use gqlws_server::prelude::*;
//!
//! let server = GraphQLWsServer::builder()
//!     .engine(MyEngine::new())
//!     .hooks(MyHooks)
//!     .build()?;
//! server.run().await?;
//! ```

pub mod cancellation;
pub mod config;
pub mod connection;
pub mod context;
pub mod execution;
pub mod hooks;
pub mod keepalive;
mod operation;
pub mod prelude;
pub mod registry;
pub mod sequencer;
pub mod server;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export main types
pub use cancellation::{CancelHandle, CancelReason};
pub use config::ServerConfig;
pub use connection::{ConnectionClosed, ConnectionState};
pub use context::ConnectionContext;
pub use execution::{
    BoxedResultSequence, ChannelSequence, ExecutionArgs, ExecutionOutcome, GraphQLEngine,
    OperationKind, ParsedDocument, ResultSequence, SequenceItem, SequenceSender, SingleResult,
    StreamSequence,
};
pub use hooks::{ConnectDecision, HookError, NoopHooks, PingReply, ServerHooks, SubscribeDecision};
pub use registry::{RegistryError, SubscriptionRegistry};
pub use server::{ConnectionInfo, GraphQLWsServer, GraphQLWsServerBuilder, ServerHandle};
pub use transport::{
    Acceptor, PendingTransport, TcpAcceptor, Transport, TransportError, TransportFrame,
    TransportInfo, TransportSink, TransportSource,
};

// Re-export the protocol layer
pub use gqlws_protocol;

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
