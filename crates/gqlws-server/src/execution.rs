//! Operation execution adapter
//!
//! The server does not implement GraphQL itself. A host plugs in a
//! [`GraphQLEngine`]; this module normalizes whatever the engine produces into
//! a [`ResultSequence`] so every operation, single-result or streaming, is
//! driven the same way by the connection.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use gqlws_protocol::{ExecutionResult, GraphQLError, SubscribePayload};

/// Kind of the selected operation in a parsed document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Query => f.write_str("query"),
            OperationKind::Mutation => f.write_str("mutation"),
            OperationKind::Subscription => f.write_str("subscription"),
        }
    }
}

/// A parsed GraphQL document
///
/// The server only needs the operation kind; engines stash their own AST in
/// `inner` and get it back with [`ParsedDocument::downcast_ref`].
#[derive(Clone)]
pub struct ParsedDocument {
    kind: OperationKind,
    source: String,
    inner: Option<Arc<dyn Any + Send + Sync>>,
}

impl ParsedDocument {
    pub fn new(kind: OperationKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            inner: None,
        }
    }

    pub fn with_inner<T: Any + Send + Sync>(mut self, inner: T) -> Self {
        self.inner = Some(Arc::new(inner));
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.as_deref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for ParsedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedDocument")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Everything the engine needs to run one operation
#[derive(Debug, Clone)]
pub struct ExecutionArgs {
    pub document: ParsedDocument,
    pub operation_name: Option<String>,
    pub variables: Map<String, Value>,
    pub extensions: Map<String, Value>,
    /// Root value configured for this operation kind
    pub root_value: Option<Value>,
    /// Snapshot of the connection context state
    pub context_value: Map<String, Value>,
}

impl ExecutionArgs {
    pub fn new(document: ParsedDocument) -> Self {
        Self {
            document,
            operation_name: None,
            variables: Map::new(),
            extensions: Map::new(),
            root_value: None,
            context_value: Map::new(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.document.kind()
    }
}

/// Item yielded by a result sequence: a result to forward as `next`, or a
/// terminal failure to forward as `error`
pub type SequenceItem = Result<ExecutionResult, Vec<GraphQLError>>;

/// A lazy, cancellable sequence of execution results
///
/// `next` returning `None` means the sequence is exhausted. `cancel` must
/// release any underlying producer and is safe to call more than once.
#[async_trait]
pub trait ResultSequence: Send {
    async fn next(&mut self) -> Option<SequenceItem>;

    async fn cancel(&mut self);

    fn is_active(&self) -> bool;
}

pub type BoxedResultSequence = Box<dyn ResultSequence>;

/// What an engine produced for an operation, before normalization
pub enum ExecutionOutcome {
    Single(ExecutionResult),
    Stream(BoxedResultSequence),
}

impl ExecutionOutcome {
    /// Normalize into a sequence
    ///
    /// A single result with errors and no data is a request error and becomes
    /// a terminal failure.
    pub fn into_sequence(self) -> BoxedResultSequence {
        match self {
            ExecutionOutcome::Single(result) => Box::new(SingleResult::new(result)),
            ExecutionOutcome::Stream(sequence) => sequence,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, ExecutionOutcome::Stream(_))
    }
}

impl fmt::Debug for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionOutcome::Single(result) => f.debug_tuple("Single").field(result).finish(),
            ExecutionOutcome::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Pluggable GraphQL engine
#[async_trait]
pub trait GraphQLEngine: Send + Sync {
    /// Parse the request text; errors become the operation's `error` message
    fn parse(&self, request: &SubscribePayload) -> Result<ParsedDocument, Vec<GraphQLError>>;

    /// Validate a parsed document. An empty list means valid.
    fn validate(&self, document: &ParsedDocument) -> Vec<GraphQLError> {
        let _ = document;
        Vec::new()
    }

    /// Execute a query or mutation
    async fn execute(&self, args: ExecutionArgs) -> ExecutionResult;

    /// Start a subscription
    ///
    /// `Err` carries an immediate result (typically a request error) instead
    /// of a stream. Engines without subscription support get the single
    /// result of `execute` as a one-element sequence.
    async fn subscribe(&self, args: ExecutionArgs) -> Result<BoxedResultSequence, ExecutionResult> {
        Ok(Box::new(SingleResult::new(self.execute(args).await)))
    }
}

/// Dispatch to `execute` or `subscribe` by operation kind
pub(crate) async fn run_operation(engine: &dyn GraphQLEngine, args: ExecutionArgs) -> ExecutionOutcome {
    match args.kind() {
        OperationKind::Subscription => match engine.subscribe(args).await {
            Ok(sequence) => ExecutionOutcome::Stream(sequence),
            Err(result) => ExecutionOutcome::Single(result),
        },
        OperationKind::Query | OperationKind::Mutation => {
            ExecutionOutcome::Single(engine.execute(args).await)
        }
    }
}

/// One-element sequence around a single result
pub struct SingleResult {
    result: Option<ExecutionResult>,
}

impl SingleResult {
    pub fn new(result: ExecutionResult) -> Self {
        Self {
            result: Some(result),
        }
    }
}

#[async_trait]
impl ResultSequence for SingleResult {
    async fn next(&mut self) -> Option<SequenceItem> {
        let result = self.result.take()?;
        if result.is_request_error() {
            Some(Err(result.errors))
        } else {
            Some(Ok(result))
        }
    }

    async fn cancel(&mut self) {
        self.result = None;
    }

    fn is_active(&self) -> bool {
        self.result.is_some()
    }
}

/// Sequence over an async stream
///
/// Cancelling drops the stream, which releases whatever the producer holds,
/// and runs the optional release callback.
pub struct StreamSequence {
    stream: Option<BoxStream<'static, SequenceItem>>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamSequence {
    pub fn new(stream: impl Stream<Item = SequenceItem> + Send + 'static) -> Self {
        Self {
            stream: Some(stream.boxed()),
            on_release: None,
        }
    }

    /// Stream of plain results, none of them terminal failures
    pub fn from_results(stream: impl Stream<Item = ExecutionResult> + Send + 'static) -> Self {
        Self::new(stream.map(Ok))
    }

    /// Run `release` exactly once when the sequence ends or is cancelled
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(release));
        self
    }

    fn release(&mut self) {
        self.stream = None;
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

#[async_trait]
impl ResultSequence for StreamSequence {
    async fn next(&mut self) -> Option<SequenceItem> {
        let item = self.stream.as_mut()?.next().await;
        match &item {
            None | Some(Err(_)) => self.release(),
            Some(Ok(_)) => {}
        }
        item
    }

    async fn cancel(&mut self) {
        self.release();
    }

    fn is_active(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for StreamSequence {
    fn drop(&mut self) {
        self.release();
    }
}

/// Sequence fed by a producer task through a bounded channel
pub struct ChannelSequence {
    rx: Option<mpsc::Receiver<SequenceItem>>,
}

/// Producer half of a [`ChannelSequence`]
#[derive(Clone)]
pub struct SequenceSender {
    tx: mpsc::Sender<SequenceItem>,
}

impl ChannelSequence {
    pub fn channel(buffer: usize) -> (SequenceSender, ChannelSequence) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (SequenceSender { tx }, ChannelSequence { rx: Some(rx) })
    }
}

impl SequenceSender {
    /// Push a result. Returns `false` once the consumer has gone away.
    pub async fn send(&self, result: ExecutionResult) -> bool {
        self.tx.send(Ok(result)).await.is_ok()
    }

    /// End the sequence with a terminal failure
    pub async fn fail(self, errors: Vec<GraphQLError>) -> bool {
        self.tx.send(Err(errors)).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the consumer cancels or is dropped
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

#[async_trait]
impl ResultSequence for ChannelSequence {
    async fn next(&mut self) -> Option<SequenceItem> {
        let item = self.rx.as_mut()?.recv().await;
        match &item {
            None | Some(Err(_)) => self.rx = None,
            Some(Ok(_)) => {}
        }
        item
    }

    async fn cancel(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
        }
    }

    fn is_active(&self) -> bool {
        self.rx.is_some()
    }
}
