//! Test utilities: an in-memory transport and a small reference engine
//!
//! Enabled with the `test-utils` feature. The memory transport stands in for
//! a WebSocket so protocol behavior can be exercised without sockets, and
//! [`TestEngine`] serves a handful of fixed fields:
//!
//! | operation | result |
//! |---|---|
//! | `{ getValue }` | `{"getValue": "value"}` |
//! | `{ context }` | the connection context state |
//! | `{ root }` | the configured root value |
//! | `{ error }` | request error, sent as `error` |
//! | `mutation { setValue }` | echoes the `value` variable |
//! | `subscription { greetings }` | Hi, Bonjour, Hola, Ciao, Zdravo |
//! | `subscription { ticks }` | `{"ticks": n}` every tick interval, `count` variable caps it |
//! | `subscription { failing }` | one `next`, then a terminal error |

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use gqlws_protocol::{
    ExecutionResult, GRAPHQL_TRANSPORT_WS_PROTOCOL, GraphQLError, Message, SubscribePayload,
    decode, encode,
};

use crate::execution::{
    BoxedResultSequence, ExecutionArgs, GraphQLEngine, OperationKind, ParsedDocument,
    SequenceItem, StreamSequence,
};
use crate::transport::{
    Acceptor, PendingTransport, Transport, TransportError, TransportFrame, TransportInfo,
    TransportSink,
};

/// How long client helpers wait for a server frame before giving up
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A frame written by the server, as seen by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Text(String),
    Close { code: u16, reason: String },
}

struct MemorySink {
    tx: mpsc::UnboundedSender<ServerFrame>,
    closed: bool,
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(ServerFrame::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.closed = true;
        self.tx
            .send(ServerFrame::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| TransportError::Closed)
    }
}

/// Sink of a peer that stopped reading: no write ever completes
pub struct StalledSink;

#[async_trait]
impl TransportSink for StalledSink {
    async fn send_text(&mut self, _text: String) -> Result<(), TransportError> {
        futures::future::pending().await
    }

    async fn close(&mut self, _code: u16, _reason: &str) -> Result<(), TransportError> {
        futures::future::pending().await
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        futures::future::pending().await
    }
}

/// A memory transport whose peer keeps sending but never reads
///
/// The returned client only works for sending; nothing the server writes
/// reaches it.
pub fn stalled_transport() -> (Transport, MemoryClient) {
    let (mut transport, client) = memory_transport();
    transport.sink = Box::new(StalledSink);
    (transport, client)
}

/// A transport that negotiated `graphql-transport-ws`
pub fn memory_transport() -> (Transport, MemoryClient) {
    memory_transport_with(TransportInfo {
        subprotocol: Some(GRAPHQL_TRANSPORT_WS_PROTOCOL.to_string()),
        path: Some("/graphql".to_string()),
        ..Default::default()
    })
}

pub fn memory_transport_with(info: TransportInfo) -> (Transport, MemoryClient) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();

    let transport = Transport {
        sink: Box::new(MemorySink {
            tx: server_tx,
            closed: false,
        }),
        source: UnboundedReceiverStream::new(server_rx).map(Ok).boxed(),
        info,
    };
    let client = MemoryClient {
        tx: Some(client_tx),
        rx: client_rx,
    };
    (transport, client)
}

/// Client end of a memory transport
pub struct MemoryClient {
    tx: Option<mpsc::UnboundedSender<TransportFrame>>,
    rx: mpsc::UnboundedReceiver<ServerFrame>,
}

impl MemoryClient {
    fn push(&self, frame: TransportFrame) {
        if let Some(tx) = &self.tx {
            // The server may already have hung up
            let _ = tx.send(frame);
        }
    }

    pub async fn send(&self, message: &Message) {
        self.push(TransportFrame::Text(encode(message)));
    }

    pub async fn send_text(&self, text: impl Into<String>) {
        self.push(TransportFrame::Text(text.into()));
    }

    pub async fn send_binary(&self, data: Vec<u8>) {
        self.push(TransportFrame::Binary(data));
    }

    /// Send a close frame, as a browser would
    pub async fn close(&self, code: u16, reason: &str) {
        self.push(TransportFrame::Close {
            code: Some(code),
            reason: reason.to_string(),
        });
    }

    /// Drop the connection without a close frame
    pub fn disconnect(&mut self) {
        self.tx = None;
    }

    /// Next server frame, `None` once the server hung up or nothing arrived in time
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.recv_within(RECV_TIMEOUT).await
    }

    pub async fn recv_within(&mut self, timeout: Duration) -> Option<ServerFrame> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next server frame, which must be a protocol message
    pub async fn recv_message(&mut self) -> Message {
        match self.recv().await {
            Some(ServerFrame::Text(text)) => decode(&text)
                .unwrap_or_else(|err| panic!("server sent an invalid message {text}: {err}")),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    /// Read until the close frame; returns its code and reason
    pub async fn expect_close(&mut self) -> (u16, String) {
        let (_, code, reason) = self.recv_until_close().await;
        (code, reason)
    }

    /// Collect every message up to the close frame
    pub async fn recv_until_close(&mut self) -> (Vec<Message>, u16, String) {
        let mut messages = Vec::new();
        loop {
            match self.recv().await {
                Some(ServerFrame::Text(text)) => match decode(&text) {
                    Ok(message) => messages.push(message),
                    Err(err) => panic!("server sent an invalid message {text}: {err}"),
                },
                Some(ServerFrame::Close { code, reason }) => return (messages, code, reason),
                None => panic!("connection ended without a close frame after {messages:?}"),
            }
        }
    }

    /// Send `connection_init` and wait for the ack
    pub async fn init(&mut self) -> Message {
        self.send(&Message::connection_init(None)).await;
        let ack = self.recv_message().await;
        assert!(
            matches!(ack, Message::ConnectionAck { .. }),
            "expected connection_ack, got {ack:?}"
        );
        ack
    }

    /// Subscribe and collect messages for `id` until its `complete` or `error`
    pub async fn run_operation(&mut self, id: &str, query: &str) -> Vec<Message> {
        self.send(&Message::subscribe(id, SubscribePayload::new(query)))
            .await;
        let mut messages = Vec::new();
        loop {
            let message = self.recv_message().await;
            if message.id() != Some(id) {
                continue;
            }
            let terminal = matches!(message, Message::Complete { .. } | Message::Error { .. });
            messages.push(message);
            if terminal {
                return messages;
            }
        }
    }
}

/// Acceptor fed by a [`MemoryConnector`]
pub struct MemoryAcceptor {
    rx: mpsc::UnboundedReceiver<Transport>,
}

/// Opens memory connections to a running server
#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<Transport>,
}

pub fn memory_acceptor() -> (MemoryAcceptor, MemoryConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryAcceptor { rx }, MemoryConnector { tx })
}

impl MemoryConnector {
    /// Open a connection; `None` once the accept loop has stopped
    pub fn try_connect(&self) -> Option<MemoryClient> {
        let (transport, client) = memory_transport();
        self.tx.send(transport).ok().map(|_| client)
    }

    pub fn connect(&self) -> MemoryClient {
        self.try_connect().expect("accept loop is not running")
    }
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&mut self) -> Result<Option<PendingTransport>, TransportError> {
        Ok(self
            .rx
            .recv()
            .await
            .map(|transport| futures::future::ready(Ok(transport)).boxed()))
    }
}

/// Parsed form stored in [`ParsedDocument`] by [`TestEngine`]
#[derive(Debug, Clone)]
struct TestOperation {
    field: String,
}

const QUERY_FIELDS: &[&str] = &["getValue", "context", "root", "error"];
const MUTATION_FIELDS: &[&str] = &["setValue"];
const SUBSCRIPTION_FIELDS: &[&str] = &["greetings", "ticks", "failing"];

pub const GREETINGS: [&str; 5] = ["Hi", "Bonjour", "Hola", "Ciao", "Zdravo"];

/// Reference engine with a fixed schema, see the module docs
#[derive(Clone)]
pub struct TestEngine {
    tick_interval: Duration,
    started: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self {
            tick_interval: Duration::from_millis(20),
            started: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Number of subscription streams started
    pub fn started_streams(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Number of subscription streams released, by exhaustion or cancellation
    pub fn released_streams(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn stream(
        &self,
        stream: impl futures::Stream<Item = SequenceItem> + Send + 'static,
    ) -> BoxedResultSequence {
        self.started.fetch_add(1, Ordering::SeqCst);
        let released = self.released.clone();
        Box::new(StreamSequence::new(stream).on_release(move || {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn field_of(document: &ParsedDocument) -> &str {
    document
        .downcast_ref::<TestOperation>()
        .map(|op| op.field.as_str())
        .unwrap_or_default()
}

#[async_trait]
impl GraphQLEngine for TestEngine {
    fn parse(&self, request: &SubscribePayload) -> Result<ParsedDocument, Vec<GraphQLError>> {
        let query = request.query.trim();
        let syntax_error = |message: &str| vec![GraphQLError::new(format!("Syntax Error: {message}"))];

        let Some(open) = query.find('{') else {
            return Err(syntax_error("Expected '{'"));
        };
        let Some(close) = query.rfind('}') else {
            return Err(syntax_error("Expected '}'"));
        };
        if close < open {
            return Err(syntax_error("Unexpected '}'"));
        }

        let head = query[..open].split_whitespace().next().unwrap_or("query");
        let kind = match head {
            "query" => OperationKind::Query,
            "mutation" => OperationKind::Mutation,
            "subscription" => OperationKind::Subscription,
            other => return Err(syntax_error(&format!("Unexpected Name \"{other}\""))),
        };

        let field = query[open + 1..close]
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .find(|token| !token.is_empty())
            .ok_or_else(|| syntax_error("Expected Name, found '}'"))?;

        Ok(ParsedDocument::new(kind, query).with_inner(TestOperation {
            field: field.to_string(),
        }))
    }

    fn validate(&self, document: &ParsedDocument) -> Vec<GraphQLError> {
        let (type_name, fields) = match document.kind() {
            OperationKind::Query => ("Query", QUERY_FIELDS),
            OperationKind::Mutation => ("Mutation", MUTATION_FIELDS),
            OperationKind::Subscription => ("Subscription", SUBSCRIPTION_FIELDS),
        };
        let field = field_of(document);
        if fields.contains(&field) {
            Vec::new()
        } else {
            vec![GraphQLError::new(format!(
                "Cannot query field \"{field}\" on type \"{type_name}\"."
            ))]
        }
    }

    async fn execute(&self, args: ExecutionArgs) -> ExecutionResult {
        let field = field_of(&args.document).to_string();
        match field.as_str() {
            "getValue" => ExecutionResult::from_data(json!({ "getValue": "value" })),
            "context" => ExecutionResult::from_data(json!({ "context": args.context_value })),
            "root" => ExecutionResult::from_data(json!({ "root": args.root_value })),
            "setValue" => {
                let value = args.variables.get("value").cloned().unwrap_or(Value::Null);
                ExecutionResult::from_data(json!({ "setValue": value }))
            }
            "error" => ExecutionResult::from_errors(vec![GraphQLError::new("Query failed")]),
            field => ExecutionResult::from_errors(vec![GraphQLError::new(format!(
                "Field \"{field}\" cannot be executed"
            ))]),
        }
    }

    async fn subscribe(&self, args: ExecutionArgs) -> Result<BoxedResultSequence, ExecutionResult> {
        let field = field_of(&args.document).to_string();
        match field.as_str() {
            "greetings" => Ok(self.stream(futures::stream::iter(
                GREETINGS.map(|greeting| Ok(ExecutionResult::from_data(json!({ "greetings": greeting })))),
            ))),
            "ticks" => {
                let interval = self.tick_interval;
                let count = args.variables.get("count").and_then(Value::as_u64);
                let ticks = futures::stream::unfold(0u64, move |n| async move {
                    if count.is_some_and(|count| n >= count) {
                        return None;
                    }
                    tokio::time::sleep(interval).await;
                    Some((Ok(ExecutionResult::from_data(json!({ "ticks": n }))), n + 1))
                });
                Ok(self.stream(ticks))
            }
            "failing" => Ok(self.stream(futures::stream::iter(vec![
                Ok(ExecutionResult::from_data(json!({ "failing": 1 }))),
                Err(vec![GraphQLError::new("Stream failed")]),
            ]))),
            _ => Err(self.execute(args).await),
        }
    }
}
