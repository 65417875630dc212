//! Test Helpers for GraphQL WebSocket Integration Tests
//!
//! Shared setup for the scenario tests: server builders wired to the
//! reference engine, memory connections, and a hook implementation that
//! records every lifecycle call for ordering assertions.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use gqlws_server::prelude::*;
use gqlws_server::test_utils::{MemoryClient, TestEngine, memory_transport, stalled_transport};
use gqlws_server::{ConnectionClosed, GraphQLWsServerBuilder};

/// Install a test-friendly tracing subscriber once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builder wired to a fresh reference engine
pub fn builder() -> GraphQLWsServerBuilder {
    init_tracing();
    GraphQLWsServer::builder().engine(TestEngine::new())
}

pub fn builder_with_engine(engine: &TestEngine) -> GraphQLWsServerBuilder {
    init_tracing();
    GraphQLWsServer::builder().engine(engine.clone())
}

/// Serve one memory connection in the background
pub fn connect(server: &GraphQLWsServer) -> (MemoryClient, JoinHandle<ConnectionClosed>) {
    let (transport, client) = memory_transport();
    let server = server.clone();
    let task = tokio::spawn(async move { server.serve_connection(transport, None).await });
    (client, task)
}

/// Serve one connection whose peer never reads what the server writes
pub fn connect_stalled(server: &GraphQLWsServer) -> (MemoryClient, JoinHandle<ConnectionClosed>) {
    let (transport, client) = stalled_transport();
    let server = server.clone();
    let task = tokio::spawn(async move { server.serve_connection(transport, None).await });
    (client, task)
}

pub fn subscribe(id: &str, query: &str) -> Message {
    Message::subscribe(id, SubscribePayload::new(query))
}

/// `data` of a `next` message
pub fn next_data(message: &Message) -> Value {
    match message {
        Message::Next { payload, .. } => payload.data.clone().unwrap_or(Value::Null),
        other => panic!("expected next, got {other:?}"),
    }
}

/// First error message of an `error` message
pub fn error_message(message: &Message) -> String {
    match message {
        Message::Error { payload, .. } => payload[0].message.clone(),
        other => panic!("expected error, got {other:?}"),
    }
}

/// Send a ping and collect everything that arrives before its pong
///
/// The outbound queue is ordered, so the pong proves the server has
/// processed every earlier client message.
pub async fn round_trip(client: &mut MemoryClient) -> Vec<Message> {
    let mut payload = Payload::new();
    payload.insert("marker".to_string(), Value::from("round-trip"));
    client.send(&Message::ping(Some(payload.clone()))).await;

    let mut before = Vec::new();
    loop {
        match client.recv_message().await {
            Message::Pong { payload: Some(p) } if p == payload => return before,
            other => before.push(other),
        }
    }
}

/// Poll a condition until it holds or a second passes
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Hooks that record each call as a short event string
#[derive(Clone, Default)]
pub struct RecordingHooks {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl ServerHooks for RecordingHooks {
    async fn on_connect(
        &self,
        _ctx: &ConnectionContext,
        _payload: Option<&Payload>,
    ) -> std::result::Result<ConnectDecision, HookError> {
        self.record("connect".to_string());
        Ok(ConnectDecision::Accept)
    }

    async fn on_disconnect(
        &self,
        _ctx: &ConnectionContext,
        code: u16,
        _reason: &str,
    ) -> std::result::Result<(), HookError> {
        self.record(format!("disconnect:{code}"));
        Ok(())
    }

    async fn on_close(
        &self,
        _ctx: &ConnectionContext,
        code: u16,
        _reason: &str,
    ) -> std::result::Result<(), HookError> {
        self.record(format!("close:{code}"));
        Ok(())
    }

    async fn on_subscribe(
        &self,
        _ctx: &ConnectionContext,
        id: &str,
        _payload: &SubscribePayload,
    ) -> std::result::Result<SubscribeDecision, HookError> {
        self.record(format!("subscribe:{id}"));
        Ok(SubscribeDecision::Continue)
    }

    async fn on_operation(
        &self,
        _ctx: &ConnectionContext,
        id: &str,
        _args: &ExecutionArgs,
        outcome: ExecutionOutcome,
    ) -> std::result::Result<ExecutionOutcome, HookError> {
        self.record(format!("operation:{id}"));
        Ok(outcome)
    }

    async fn on_next(
        &self,
        _ctx: &ConnectionContext,
        id: &str,
        _args: &ExecutionArgs,
        result: ExecutionResult,
    ) -> std::result::Result<ExecutionResult, HookError> {
        self.record(format!("next:{id}"));
        Ok(result)
    }

    async fn on_error(
        &self,
        _ctx: &ConnectionContext,
        id: &str,
        errors: Vec<GraphQLError>,
    ) -> std::result::Result<Vec<GraphQLError>, HookError> {
        self.record(format!("error:{id}"));
        Ok(errors)
    }

    async fn on_complete(
        &self,
        _ctx: &ConnectionContext,
        id: &str,
    ) -> std::result::Result<(), HookError> {
        self.record(format!("complete:{id}"));
        Ok(())
    }
}
