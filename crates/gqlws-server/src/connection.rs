//! Connection state machine
//!
//! One task per connection owns the handshake state, the subscription
//! registry, the keep-alive monitor and the outbound sequencer. Inbound frames,
//! timer events, operation events and shutdown requests are all handled on
//! that task, one at a time, which keeps every state transition and the
//! ordering of connection-level messages deterministic.

use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, debug_span, error, info, warn};

use gqlws_protocol::{CloseCode, GraphQLError, Message, Payload, SubscribePayload, decode};

use crate::cancellation::{CancelHandle, CancelReason};
use crate::config::ServerConfig;
use crate::context::ConnectionContext;
use crate::execution::{GraphQLEngine, OperationKind};
use crate::hooks::{ConnectDecision, HookError, PingReply, ServerHooks};
use crate::keepalive::{KeepAliveEvent, KeepAliveMonitor};
use crate::operation::{ConnectionEvent, OperationEnd, OperationTask};
use crate::registry::{RegistryError, SubscriptionRegistry};
use crate::sequencer::OutboundSequencer;
use crate::transport::{TransportError, TransportFrame, TransportSink, TransportSource};

/// Close code reported to hooks when the peer vanished without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code reported to hooks when the peer's close frame had no status
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Everything a connection needs from its server
pub(crate) struct Services {
    pub engine: Arc<dyn GraphQLEngine>,
    pub hooks: Arc<dyn ServerHooks>,
    pub config: ServerConfig,
    pub roots: HashMap<OperationKind, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    Acknowledged,
    Closed,
}

/// Server-wide shutdown request observed by every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownMode {
    Running,
    Graceful,
    Forceful,
}

/// How a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClosed {
    pub connection_id: String,
    pub code: u16,
    pub reason: String,
    pub was_acknowledged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseMode {
    /// Write what is already queued, then the close frame
    Flush,
    /// Abandon queued messages and close right away
    Immediate,
    /// The peer sent a close frame; only the transport's reply goes out
    PeerClosed,
    /// The peer is gone; nothing more can be written
    PeerGone,
}

#[derive(Debug)]
struct CloseRequest {
    code: u16,
    reason: String,
    mode: CloseMode,
    cancel_reason: CancelReason,
}

impl CloseRequest {
    fn with_reason(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            reason: reason.into(),
            mode: CloseMode::Flush,
            cancel_reason: CancelReason::ConnectionClosed,
        }
    }

    fn canonical(code: CloseCode) -> Self {
        Self::with_reason(code, code.reason())
    }

    fn immediate(code: CloseCode, reason: impl Into<String>, cancel_reason: CancelReason) -> Self {
        Self {
            mode: CloseMode::Immediate,
            cancel_reason,
            ..Self::with_reason(code, reason)
        }
    }

    fn peer(code: u16, reason: impl Into<String>, mode: CloseMode) -> Self {
        Self {
            code,
            reason: reason.into(),
            mode,
            cancel_reason: CancelReason::ConnectionClosed,
        }
    }

    fn shutdown() -> Self {
        Self::immediate(
            CloseCode::GoingAway,
            "Server is shutting down",
            CancelReason::ServerShutdown,
        )
    }

    fn unresponsive() -> Self {
        Self::immediate(
            CloseCode::GoingAway,
            "Keep-alive timeout",
            CancelReason::ConnectionClosed,
        )
    }

    fn hook_failure(error: &HookError) -> Self {
        Self::with_reason(CloseCode::InternalServerError, error.to_string())
    }
}

enum Step {
    Continue,
    Close(CloseRequest),
}

/// Server shutdown requests as seen by one connection
struct ShutdownSignal {
    rx: watch::Receiver<ShutdownMode>,
    open: bool,
}

impl ShutdownSignal {
    fn new(rx: watch::Receiver<ShutdownMode>) -> Self {
        Self { rx, open: true }
    }

    fn mode(&self) -> ShutdownMode {
        *self.rx.borrow()
    }

    /// Next requested mode; pends forever once the server is gone
    async fn changed(&mut self) -> ShutdownMode {
        if self.open {
            match self.rx.changed().await {
                Ok(()) => return *self.rx.borrow_and_update(),
                Err(_) => self.open = false,
            }
        }
        pending().await
    }

    /// Resolves once a forceful shutdown has been requested
    async fn forceful(&mut self) {
        if self.mode() == ShutdownMode::Forceful {
            return;
        }
        while self.changed().await != ShutdownMode::Forceful {}
    }
}

pub(crate) struct Connection {
    ctx: ConnectionContext,
    state: ConnectionState,
    init_received: bool,
    draining: bool,
    registry: SubscriptionRegistry,
    outbound: OutboundSequencer,
    keep_alive: KeepAliveMonitor,
    shutdown: ShutdownSignal,
    services: Arc<Services>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Connection {
    pub(crate) fn new(
        ctx: ConnectionContext,
        sink: Box<dyn TransportSink>,
        services: Arc<Services>,
        shutdown: watch::Receiver<ShutdownMode>,
    ) -> Self {
        let config = &services.config;
        let outbound = OutboundSequencer::spawn(sink, config.outbound_buffer_size);
        let keep_alive = KeepAliveMonitor::new(config.init_wait_timeout(), config.keep_alive());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            ctx,
            state: ConnectionState::Initializing,
            init_received: false,
            draining: false,
            registry: SubscriptionRegistry::new(),
            outbound,
            keep_alive,
            shutdown: ShutdownSignal::new(shutdown),
            services,
            events_tx,
            events_rx,
        }
    }

    /// Drive the connection until it closes
    pub(crate) async fn run(mut self, mut source: TransportSource) -> ConnectionClosed {
        info!(
            "Connection {} opened (peer: {:?})",
            self.ctx.connection_id(),
            self.ctx.transport().peer_addr
        );

        let mut step = Step::Continue;
        let close = loop {
            // A request may have been observed while a handler was waiting
            if let Step::Continue = step {
                step = self.apply_shutdown(self.shutdown.mode());
            }
            if let Step::Close(close) = step {
                break close;
            }
            step = tokio::select! {
                biased;

                Some(event) = self.events_rx.recv() => self.handle_event(event).await,

                mode = self.shutdown.changed() => self.apply_shutdown(mode),

                event = self.keep_alive.tick() => self.handle_keep_alive(event).await,

                frame = source.next() => self.handle_frame(frame).await,
            };
        };

        drop(source);
        self.close(close).await
    }

    fn apply_shutdown(&mut self, mode: ShutdownMode) -> Step {
        match mode {
            ShutdownMode::Running => Step::Continue,
            ShutdownMode::Graceful => {
                if !self.draining {
                    debug!(
                        "Connection {} draining {} operation(s)",
                        self.ctx.connection_id(),
                        self.registry.len()
                    );
                    self.draining = true;
                }
                self.close_if_drained()
            }
            ShutdownMode::Forceful => Step::Close(CloseRequest::shutdown()),
        }
    }

    fn close_if_drained(&self) -> Step {
        if self.draining && self.registry.is_empty() {
            Step::Close(CloseRequest::canonical(CloseCode::NormalClosure))
        } else {
            Step::Continue
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<TransportFrame, TransportError>>) -> Step {
        match frame {
            None => Step::Close(CloseRequest::peer(
                ABNORMAL_CLOSURE,
                "Connection lost",
                CloseMode::PeerGone,
            )),
            Some(Err(err)) => {
                warn!("Transport error on connection {}: {}", self.ctx.connection_id(), err);
                Step::Close(CloseRequest::peer(
                    ABNORMAL_CLOSURE,
                    err.to_string(),
                    CloseMode::PeerGone,
                ))
            }
            Some(Ok(TransportFrame::Close { code, reason })) => {
                debug!(
                    "Connection {} closed by peer ({:?}: {})",
                    self.ctx.connection_id(),
                    code,
                    reason
                );
                Step::Close(CloseRequest::peer(
                    code.unwrap_or(NO_STATUS_RECEIVED),
                    reason,
                    CloseMode::PeerClosed,
                ))
            }
            Some(Ok(TransportFrame::Binary(_))) => Step::Close(CloseRequest::with_reason(
                CloseCode::BadRequest,
                "Binary messages are not supported",
            )),
            Some(Ok(TransportFrame::Text(text))) => {
                self.keep_alive.record_activity();
                match decode(&text) {
                    Ok(message) => self.dispatch(message).await,
                    Err(err) => {
                        warn!("Invalid message on connection {}: {}", self.ctx.connection_id(), err);
                        Step::Close(CloseRequest::with_reason(CloseCode::BadRequest, err.to_string()))
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, message: Message) -> Step {
        debug!(
            "Connection {} received {}",
            self.ctx.connection_id(),
            message.message_type()
        );

        match (self.state, message) {
            (_, Message::ConnectionInit { payload }) => self.on_connection_init(payload).await,
            (ConnectionState::Initializing, Message::Subscribe { .. }) => {
                Step::Close(CloseRequest::canonical(CloseCode::Unauthorized))
            }
            (ConnectionState::Initializing, other) => Step::Close(CloseRequest::with_reason(
                CloseCode::BadRequest,
                format!("Unexpected '{}' message before connection_init", other.message_type()),
            )),
            (ConnectionState::Acknowledged, Message::Ping { payload }) => self.on_ping(payload).await,
            (ConnectionState::Acknowledged, Message::Pong { payload }) => {
                match self.services.hooks.on_pong(&self.ctx, payload.as_ref()).await {
                    Ok(()) => Step::Continue,
                    Err(err) => self.hook_failed("on_pong", err),
                }
            }
            (ConnectionState::Acknowledged, Message::Subscribe { id, payload }) => {
                self.on_subscribe(id, payload).await
            }
            (ConnectionState::Acknowledged, Message::Complete { id }) => self.on_complete(id).await,
            (ConnectionState::Acknowledged, other) => Step::Close(CloseRequest::with_reason(
                CloseCode::BadRequest,
                format!("Unexpected '{}' message from client", other.message_type()),
            )),
            (ConnectionState::Closed, _) => Step::Continue,
        }
    }

    async fn on_connection_init(&mut self, payload: Option<Payload>) -> Step {
        if self.init_received {
            return Step::Close(CloseRequest::canonical(CloseCode::TooManyInitialisationRequests));
        }
        self.init_received = true;
        self.ctx.set_connection_params(payload.clone());

        let hooks = self.services.hooks.clone();
        let decision = tokio::select! {
            biased;
            () = self.shutdown.forceful() => return Step::Close(CloseRequest::shutdown()),
            event = self.keep_alive.tick() => Err(event),
            decision = hooks.on_connect(&self.ctx, payload.as_ref()) => Ok(decision),
        };

        let ack_payload = match decision {
            Err(event) => return self.handle_keep_alive(event).await,
            Ok(Err(err)) => return self.hook_failed("on_connect", err),
            Ok(Ok(ConnectDecision::Reject(reason))) => {
                info!(
                    "Connection {} rejected by on_connect: {}",
                    self.ctx.connection_id(),
                    reason
                );
                return Step::Close(CloseRequest::with_reason(CloseCode::Unauthorized, reason));
            }
            Ok(Ok(ConnectDecision::Accept)) => None,
            Ok(Ok(ConnectDecision::Augment(entries))) => {
                self.ctx.extend(entries);
                None
            }
            Ok(Ok(ConnectDecision::AcknowledgeWith(payload))) => Some(payload),
        };

        if let Step::Close(close) = self.send(Message::connection_ack(ack_payload)).await {
            return Step::Close(close);
        }
        self.ctx.mark_acknowledged();
        self.keep_alive.acknowledged();
        self.state = ConnectionState::Acknowledged;
        info!("Connection {} acknowledged", self.ctx.connection_id());
        Step::Continue
    }

    async fn on_ping(&mut self, payload: Option<Payload>) -> Step {
        match self.services.hooks.on_ping(&self.ctx, payload.as_ref()).await {
            Ok(PingReply::Pong(reply)) => self.send(Message::pong(reply)).await,
            Ok(PingReply::Suppress) => Step::Continue,
            Err(err) => self.hook_failed("on_ping", err),
        }
    }

    async fn on_subscribe(&mut self, id: String, payload: SubscribePayload) -> Step {
        if self.draining {
            if self.registry.contains(&id) {
                return Step::Close(CloseRequest::with_reason(
                    CloseCode::SubscriberAlreadyExists,
                    format!("Subscriber for {} already exists", id),
                ));
            }
            debug!("Refusing operation {} while draining", id);
            return self
                .send(Message::error(id, vec![GraphQLError::new("Server is shutting down")]))
                .await;
        }

        let cancel = CancelHandle::new();
        let generation = match self.registry.register(&id, cancel.clone()) {
            Ok(generation) => generation,
            Err(err @ RegistryError::AlreadyExists(_)) => {
                warn!("Connection {}: {}", self.ctx.connection_id(), err);
                return Step::Close(CloseRequest::with_reason(
                    CloseCode::SubscriberAlreadyExists,
                    err.to_string(),
                ));
            }
            Err(err) => {
                error!("Failed to register operation {}: {}", id, err);
                return Step::Close(CloseRequest::canonical(CloseCode::InternalServerError));
            }
        };

        let task = OperationTask {
            id: id.clone(),
            generation,
            payload,
            ctx: self.ctx.clone(),
            services: self.services.clone(),
            outbound: self.outbound.operation_sender(cancel.clone()),
            events: self.events_tx.clone(),
            cancel,
        };
        let span = debug_span!("operation", connection_id = %self.ctx.connection_id(), id = %id);
        let handle = tokio::spawn(task.run().instrument(span));
        self.registry.attach_task(&id, generation, handle);
        Step::Continue
    }

    async fn on_complete(&mut self, id: String) -> Step {
        match self.registry.cancel(&id, CancelReason::ClientComplete) {
            Ok(()) => {
                debug!("Operation {} completed by client", id);
                if let Err(err) = self.services.hooks.on_complete(&self.ctx, &id).await {
                    return self.hook_failed("on_complete", err);
                }
                self.close_if_drained()
            }
            Err(_) => {
                debug!("Ignoring complete for inactive operation {}", id);
                Step::Continue
            }
        }
    }

    async fn handle_event(&mut self, event: ConnectionEvent) -> Step {
        match event {
            ConnectionEvent::OperationFinished { id, generation, end } => {
                if !self.registry.finish(&id, generation) {
                    // Cancelled by the client in the meantime; stay silent
                    return self.close_if_drained();
                }
                match end {
                    OperationEnd::Completed => {
                        if let Step::Close(close) = self.send(Message::complete(id.as_str())).await {
                            return Step::Close(close);
                        }
                        if let Err(err) = self.services.hooks.on_complete(&self.ctx, &id).await {
                            return self.hook_failed("on_complete", err);
                        }
                    }
                    OperationEnd::Failed(errors) => {
                        debug!("Operation {} failed with {} error(s)", id, errors.len());
                        if let Step::Close(close) = self.send(Message::error(id, errors)).await {
                            return Step::Close(close);
                        }
                    }
                }
                self.close_if_drained()
            }
            ConnectionEvent::HookFailed { id, error } => {
                error!("Operation {} aborted: {}", id, error);
                Step::Close(CloseRequest::hook_failure(&error))
            }
        }
    }

    async fn handle_keep_alive(&mut self, event: KeepAliveEvent) -> Step {
        match event {
            KeepAliveEvent::InitTimeout if self.state == ConnectionState::Initializing => {
                info!("Connection {} initialisation timed out", self.ctx.connection_id());
                Step::Close(CloseRequest::canonical(CloseCode::ConnectionInitialisationTimeout))
            }
            KeepAliveEvent::InitTimeout => Step::Continue,
            KeepAliveEvent::SendPing => self.send(Message::ping(None)).await,
            KeepAliveEvent::Unresponsive => {
                info!("Connection {} unresponsive", self.ctx.connection_id());
                Step::Close(CloseRequest::unresponsive())
            }
        }
    }

    /// Queue a connection-level message
    ///
    /// While the queue is full the peer is not reading. Forceful shutdown and
    /// the keep-alive timers still apply during that wait; inbound frames are
    /// not read until the message is queued.
    async fn send(&mut self, message: Message) -> Step {
        let queued = self.outbound.send(message);
        tokio::pin!(queued);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.forceful() => return Step::Close(CloseRequest::shutdown()),

                event = self.keep_alive.tick() => match event {
                    KeepAliveEvent::InitTimeout if self.state == ConnectionState::Initializing => {
                        return Step::Close(CloseRequest::canonical(
                            CloseCode::ConnectionInitialisationTimeout,
                        ));
                    }
                    KeepAliveEvent::InitTimeout => {}
                    KeepAliveEvent::SendPing => {
                        debug!(
                            "Connection {} outbound queue is full, skipping ping",
                            self.ctx.connection_id()
                        );
                    }
                    KeepAliveEvent::Unresponsive => {
                        info!(
                            "Connection {} stopped reading, closing",
                            self.ctx.connection_id()
                        );
                        return Step::Close(CloseRequest::unresponsive());
                    }
                },

                _ = &mut queued => return Step::Continue,
            }
        }
    }

    fn hook_failed(&self, hook: &str, err: HookError) -> Step {
        error!(
            "{} hook failed on connection {}: {}",
            hook,
            self.ctx.connection_id(),
            err
        );
        Step::Close(CloseRequest::hook_failure(&err))
    }

    /// Tear down: cancel operations, close the transport, then run hooks
    async fn close(mut self, close: CloseRequest) -> ConnectionClosed {
        let was_acknowledged = self.state == ConnectionState::Acknowledged;
        self.state = ConnectionState::Closed;
        self.keep_alive.disarm();

        let tasks = self.registry.drain(close.cancel_reason);
        if !tasks.is_empty() {
            debug!(
                "Cancelling {} operation(s) on connection {}",
                tasks.len(),
                self.ctx.connection_id()
            );
        }

        match close.mode {
            CloseMode::Flush => {
                let forced = self.shutdown.forceful();
                self.outbound.close(close.code, &close.reason, forced).await
            }
            CloseMode::Immediate => self.outbound.close_now(close.code, &close.reason).await,
            CloseMode::PeerClosed => self.outbound.finish().await,
            CloseMode::PeerGone => self.outbound.abandon().await,
        }

        for task in tasks {
            if let Err(err) = task.await {
                error!("Operation task failed: {}", err);
            }
        }

        let hooks = &self.services.hooks;
        if was_acknowledged {
            if let Err(err) = hooks.on_disconnect(&self.ctx, close.code, &close.reason).await {
                error!("on_disconnect hook failed: {}", err);
            }
        }
        if let Err(err) = hooks.on_close(&self.ctx, close.code, &close.reason).await {
            error!("on_close hook failed: {}", err);
        }

        info!(
            "Connection {} closed ({}: {})",
            self.ctx.connection_id(),
            close.code,
            close.reason
        );

        ConnectionClosed {
            connection_id: self.ctx.connection_id().to_string(),
            code: close.code,
            reason: close.reason,
            was_acknowledged,
        }
    }
}
