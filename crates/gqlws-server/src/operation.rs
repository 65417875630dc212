//! Per-operation execution pipeline
//!
//! One task per `subscribe`. The task runs the hooks and the engine, streams
//! `next` messages straight into the outbound queue, and reports its terminal
//! outcome back to the connection, which owns the registry and sends the final
//! `complete` or `error`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

use gqlws_protocol::{GraphQLError, Message, SubscribePayload};

use crate::cancellation::CancelHandle;
use crate::connection::Services;
use crate::context::ConnectionContext;
use crate::execution::{BoxedResultSequence, ExecutionArgs, ResultSequence, run_operation};
use crate::hooks::{HookError, SubscribeDecision};
use crate::sequencer::OutboundSender;

/// How an operation ended on its own
#[derive(Debug)]
pub(crate) enum OperationEnd {
    /// Results exhausted; the connection sends `complete`
    Completed,
    /// Terminal failure; the connection sends these errors as `error`
    Failed(Vec<GraphQLError>),
}

/// Notifications from operation tasks to their connection
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    OperationFinished {
        id: String,
        generation: u64,
        end: OperationEnd,
    },
    HookFailed {
        id: String,
        error: HookError,
    },
}

pub(crate) struct OperationTask {
    pub id: String,
    pub generation: u64,
    pub payload: SubscribePayload,
    pub ctx: ConnectionContext,
    pub services: Arc<Services>,
    pub outbound: OutboundSender,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
    pub cancel: CancelHandle,
}

impl OperationTask {
    pub(crate) async fn run(self) {
        let mut sequence: Option<BoxedResultSequence> = None;

        let outcome = tokio::select! {
            biased;
            reason = self.cancel.cancelled() => Err(reason),
            result = self.execute(&mut sequence) => Ok(result),
        };

        // Release the upstream producer on every exit path
        if let Some(mut sequence) = sequence {
            if sequence.is_active() {
                sequence.cancel().await;
            }
        }

        let event = match outcome {
            Ok(Ok(end)) => ConnectionEvent::OperationFinished {
                id: self.id,
                generation: self.generation,
                end,
            },
            Ok(Err(error)) => {
                error!("Hook failed during operation {}: {}", self.id, error);
                ConnectionEvent::HookFailed { id: self.id, error }
            }
            Err(reason) => {
                debug!("Operation {} cancelled ({})", self.id, reason);
                return;
            }
        };
        // The connection may already be gone
        let _ = self.events.send(event);
    }

    async fn execute(
        &self,
        slot: &mut Option<BoxedResultSequence>,
    ) -> Result<OperationEnd, HookError> {
        let hooks = &self.services.hooks;

        let args = match hooks.on_subscribe(&self.ctx, &self.id, &self.payload).await? {
            SubscribeDecision::Continue => match self.prepare() {
                Ok(args) => args,
                Err(errors) => return self.failed(errors).await,
            },
            SubscribeDecision::Replace(args) => args,
            SubscribeDecision::Reject(errors) => return self.failed(errors).await,
        };

        debug!("Executing {} operation {}", args.kind(), self.id);
        let outcome = run_operation(self.services.engine.as_ref(), args.clone()).await;
        let outcome = hooks.on_operation(&self.ctx, &self.id, &args, outcome).await?;
        let sequence = slot.insert(outcome.into_sequence());

        while let Some(item) = sequence.next().await {
            match item {
                Ok(result) => {
                    let result = hooks.on_next(&self.ctx, &self.id, &args, result).await?;
                    if !self.outbound.send(Message::next(self.id.as_str(), result)).await {
                        // Writer stopped or the operation was cancelled
                        return Ok(OperationEnd::Completed);
                    }
                }
                Err(errors) => return self.failed(errors).await,
            }
        }

        Ok(OperationEnd::Completed)
    }

    /// Parse and validate the request into execution arguments
    fn prepare(&self) -> Result<ExecutionArgs, Vec<GraphQLError>> {
        let engine = &self.services.engine;
        let document = engine.parse(&self.payload)?;

        let errors = engine.validate(&document);
        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(ExecutionArgs {
            root_value: self.services.roots.get(&document.kind()).cloned(),
            document,
            operation_name: self.payload.operation_name.clone(),
            variables: self.payload.variables.clone().unwrap_or_default(),
            extensions: self.payload.extensions.clone().unwrap_or_default(),
            context_value: self.ctx.snapshot(),
        })
    }

    async fn failed(&self, errors: Vec<GraphQLError>) -> Result<OperationEnd, HookError> {
        let mut errors = self
            .services
            .hooks
            .on_error(&self.ctx, &self.id, errors)
            .await?;
        // An error message must carry at least one error
        if errors.is_empty() {
            errors.push(GraphQLError::new("Operation failed"));
        }
        Ok(OperationEnd::Failed(errors))
    }
}
