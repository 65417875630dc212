//! Server lifecycle hooks
//!
//! Every hook has a default that keeps protocol-default behavior, so hosts
//! override only what they need. A hook returning `Err` is an internal server
//! error: the connection is closed with `1011`.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use gqlws_protocol::{ExecutionResult, GraphQLError, Payload, SubscribePayload};

use crate::context::ConnectionContext;
use crate::execution::{ExecutionArgs, ExecutionOutcome};

/// Failure raised by a hook
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Hook failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HookError {
    pub fn failed(message: impl Into<String>) -> Self {
        HookError::Failed(message.into())
    }
}

/// Verdict of `on_connect`
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectDecision {
    /// Acknowledge without an ack payload
    Accept,
    /// Acknowledge and merge entries into the connection context
    Augment(Map<String, Value>),
    /// Acknowledge with the given `connection_ack` payload
    AcknowledgeWith(Payload),
    /// Refuse the connection; closes with `4401` and this reason
    Reject(String),
}

/// Verdict of `on_subscribe`
#[derive(Debug, Clone)]
pub enum SubscribeDecision {
    /// Parse and validate the request normally
    Continue,
    /// Skip parsing and validation and run these arguments instead
    Replace(ExecutionArgs),
    /// Refuse the operation; sent as a single `error` message
    Reject(Vec<GraphQLError>),
}

/// Reply to a client `ping`
#[derive(Debug, Clone, PartialEq)]
pub enum PingReply {
    Pong(Option<Payload>),
    /// Send nothing; the host answers itself
    Suppress,
}

/// Lifecycle hooks invoked by each connection
#[async_trait]
pub trait ServerHooks: Send + Sync {
    /// Called once with the `connection_init` payload
    async fn on_connect(
        &self,
        ctx: &ConnectionContext,
        payload: Option<&Payload>,
    ) -> Result<ConnectDecision, HookError> {
        let _ = (ctx, payload);
        Ok(ConnectDecision::Accept)
    }

    /// Called when an acknowledged connection closes, before `on_close`
    async fn on_disconnect(
        &self,
        ctx: &ConnectionContext,
        code: u16,
        reason: &str,
    ) -> Result<(), HookError> {
        let _ = (ctx, code, reason);
        Ok(())
    }

    /// Called exactly once when any connection closes
    async fn on_close(&self, ctx: &ConnectionContext, code: u16, reason: &str) -> Result<(), HookError> {
        let _ = (ctx, code, reason);
        Ok(())
    }

    async fn on_subscribe(
        &self,
        ctx: &ConnectionContext,
        id: &str,
        payload: &SubscribePayload,
    ) -> Result<SubscribeDecision, HookError> {
        let _ = (ctx, id, payload);
        Ok(SubscribeDecision::Continue)
    }

    /// Observe or replace the execution outcome before results flow
    async fn on_operation(
        &self,
        ctx: &ConnectionContext,
        id: &str,
        args: &ExecutionArgs,
        outcome: ExecutionOutcome,
    ) -> Result<ExecutionOutcome, HookError> {
        let _ = (ctx, id, args);
        Ok(outcome)
    }

    /// Transform each result before it is sent as `next`
    async fn on_next(
        &self,
        ctx: &ConnectionContext,
        id: &str,
        args: &ExecutionArgs,
        result: ExecutionResult,
    ) -> Result<ExecutionResult, HookError> {
        let _ = (ctx, id, args);
        Ok(result)
    }

    /// Transform the errors before they are sent as `error`
    async fn on_error(
        &self,
        ctx: &ConnectionContext,
        id: &str,
        errors: Vec<GraphQLError>,
    ) -> Result<Vec<GraphQLError>, HookError> {
        let _ = (ctx, id);
        Ok(errors)
    }

    /// Called after an operation completes, by exhaustion or client `complete`
    async fn on_complete(&self, ctx: &ConnectionContext, id: &str) -> Result<(), HookError> {
        let _ = (ctx, id);
        Ok(())
    }

    /// Decide the reply to a client `ping`; echoes the payload by default
    async fn on_ping(
        &self,
        ctx: &ConnectionContext,
        payload: Option<&Payload>,
    ) -> Result<PingReply, HookError> {
        let _ = ctx;
        Ok(PingReply::Pong(payload.cloned()))
    }

    async fn on_pong(&self, ctx: &ConnectionContext, payload: Option<&Payload>) -> Result<(), HookError> {
        let _ = (ctx, payload);
        Ok(())
    }
}

/// Hooks that keep every default
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl ServerHooks for NoopHooks {}
