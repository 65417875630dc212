//! WebSocket transport over `tokio-tungstenite`

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, warn};

use gqlws_protocol::GRAPHQL_TRANSPORT_WS_PROTOCOL;
use gqlws_protocol::close_code::clamp_reason;

use super::{
    Acceptor, PendingTransport, Transport, TransportError, TransportFrame, TransportInfo,
    TransportSink,
};

/// Sink half of a split [`WebSocketStream`]
pub struct WebSocketSink<S> {
    inner: SplitSink<WebSocketStream<S>, WsMessage>,
}

#[async_trait]
impl<S> TransportSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner.send(WsMessage::text(text)).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: code.into(),
            reason: clamp_reason(reason).to_string().into(),
        };
        match self.inner.send(WsMessage::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Tungstenite queues the reply to a peer's close frame; flushing writes it
    /// and completes the closing handshake.
    async fn flush(&mut self) -> Result<(), TransportError> {
        match self.inner.flush().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Wrap an upgraded WebSocket stream as a protocol transport
///
/// Ping and pong control frames are answered by tungstenite itself and never
/// reach the protocol engine.
pub fn websocket_transport<S>(stream: WebSocketStream<S>, info: TransportInfo) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = stream.split();
    let source = source
        .filter_map(|frame| async move {
            match frame {
                Ok(WsMessage::Text(text)) => Some(Ok(TransportFrame::Text(text.as_str().to_owned()))),
                Ok(WsMessage::Binary(data)) => Some(Ok(TransportFrame::Binary(data.to_vec()))),
                Ok(WsMessage::Close(frame)) => Some(Ok(match frame {
                    Some(frame) => TransportFrame::Close {
                        code: Some(frame.code.into()),
                        reason: frame.reason.as_str().to_owned(),
                    },
                    None => TransportFrame::Close {
                        code: None,
                        reason: String::new(),
                    },
                })),
                Ok(_) => None,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => None,
                Err(err) => Some(Err(TransportError::from(err))),
            }
        })
        .boxed();

    Transport {
        sink: Box::new(WebSocketSink { inner: sink }),
        source,
        info,
    }
}

/// Perform the HTTP upgrade, negotiating `graphql-transport-ws` when offered
///
/// A client that does not offer the sub-protocol is still upgraded; the
/// connection is then closed with `4406` by the server.
pub async fn upgrade<S>(
    stream: S,
    peer_addr: Option<SocketAddr>,
) -> Result<Transport, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut info = TransportInfo {
        peer_addr,
        ..Default::default()
    };

    let negotiate = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        info.path = Some(request.uri().path().to_string());
        info.headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect::<HashMap<_, _>>();

        let offered = request
            .headers()
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|protocol| protocol.trim() == GRAPHQL_TRANSPORT_WS_PROTOCOL);

        if offered {
            response.headers_mut().insert(
                SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(GRAPHQL_TRANSPORT_WS_PROTOCOL),
            );
            info.subprotocol = Some(GRAPHQL_TRANSPORT_WS_PROTOCOL.to_string());
        }
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, negotiate).await?;
    debug!(
        "WebSocket upgrade complete (peer: {:?}, subprotocol: {:?})",
        info.peer_addr, info.subprotocol
    );
    Ok(websocket_transport(ws, info))
}

/// Accepts TCP connections and upgrades them to WebSocket transports
pub struct TcpAcceptor {
    listener: TcpListener,
    handshake_timeout: Duration,
}

impl TcpAcceptor {
    pub async fn bind(addr: SocketAddr, handshake_timeout: Duration) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, handshake_timeout))
    }

    pub fn from_listener(listener: TcpListener, handshake_timeout: Duration) -> Self {
        Self {
            listener,
            handshake_timeout,
        }
    }

    async fn handshake(
        stream: TcpStream,
        peer_addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Transport, TransportError> {
        match tokio::time::timeout(timeout, upgrade(stream, Some(peer_addr))).await {
            Ok(result) => result,
            Err(_) => {
                warn!("WebSocket handshake with {} timed out", peer_addr);
                Err(TransportError::HandshakeTimeout)
            }
        }
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<Option<PendingTransport>, TransportError> {
        let (stream, peer_addr) = self.listener.accept().await?;
        debug!("New connection from {}", peer_addr);
        if let Err(err) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, err);
        }
        Ok(Some(
            Self::handshake(stream, peer_addr, self.handshake_timeout).boxed(),
        ))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}
