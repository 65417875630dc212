//! Transport abstraction
//!
//! The protocol engine never touches sockets directly. A [`Transport`] is a
//! text-frame sink, an inbound frame stream and some metadata about the
//! upgrade. [`websocket`] adapts `tokio-tungstenite`; tests use the in-memory
//! transport from `test_utils`.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use thiserror::Error;

pub mod websocket;

pub use websocket::{TcpAcceptor, websocket_transport};

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake timed out")]
    HandshakeTimeout,
}

/// A frame received from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Text(String),
    Binary(Vec<u8>),
    /// Peer-initiated close; `code` is `None` when the frame carried no status
    Close { code: Option<u16>, reason: String },
}

/// Write half of a transport
#[async_trait]
pub trait TransportSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a close frame. The sink is unusable afterwards.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;

    /// Write out anything the transport queued on its own, such as the reply
    /// to a peer's close frame
    async fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Read half of a transport; ends when the peer is gone
pub type TransportSource = BoxStream<'static, Result<TransportFrame, TransportError>>;

/// What the upgrade told us about the peer
#[derive(Debug, Clone, Default)]
pub struct TransportInfo {
    pub peer_addr: Option<SocketAddr>,
    /// Negotiated WebSocket sub-protocol, if any
    pub subprotocol: Option<String>,
    /// Request path of the upgrade
    pub path: Option<String>,
    /// Upgrade request headers, names lowercased
    pub headers: HashMap<String, String>,
}

impl TransportInfo {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// An established, upgraded connection
pub struct Transport {
    pub sink: Box<dyn TransportSink>,
    pub source: TransportSource,
    pub info: TransportInfo,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("info", &self.info).finish()
    }
}

/// A transport still completing its upgrade handshake
pub type PendingTransport = BoxFuture<'static, Result<Transport, TransportError>>;

/// Source of incoming connections for the server accept loop
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next connection. `Ok(None)` means the acceptor is exhausted.
    ///
    /// The returned future completes the handshake and is driven on the
    /// connection's own task so slow upgrades never stall the accept loop.
    async fn accept(&mut self) -> Result<Option<PendingTransport>, TransportError>;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
