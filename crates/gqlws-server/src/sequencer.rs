//! Outbound sequencer
//!
//! All writes for a connection go through one bounded queue drained by a
//! single writer task, so messages reach the transport in the order they were
//! produced and operation tasks get backpressure from a slow client.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use gqlws_protocol::{Message, encode};

use crate::cancellation::CancelHandle;
use crate::transport::TransportSink;

/// Upper bound for the last write to a transport that is being abandoned
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

enum Outbound {
    Message(Message),
    /// Skipped by the writer once the owning operation has been cancelled
    Scoped {
        message: Message,
        cancel: CancelHandle,
    },
    Close {
        code: u16,
        reason: String,
    },
}

/// Out-of-band instruction for the writer, taking priority over the queue
#[derive(Debug)]
enum Stop {
    /// Send this close frame right away
    Close { code: u16, reason: String },
    /// The peer closed first; flush what the transport already holds
    Flush,
    /// The peer is gone; leave the transport alone
    Abandon,
}

/// Cloneable handle an operation uses to queue its messages
///
/// Messages are dropped once the operation's [`CancelHandle`] fires, including
/// those already queued, so a cancelled operation never writes after the
/// connection has let go of its id.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<Outbound>,
    cancel: CancelHandle,
}

impl OutboundSender {
    /// Queue a message. Returns `false` once the writer has stopped or the
    /// operation has been cancelled.
    pub async fn send(&self, message: Message) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let item = Outbound::Scoped {
            message,
            cancel: self.cancel.clone(),
        };
        self.tx.send(item).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owner side of the outbound queue, held by the connection
pub(crate) struct OutboundSequencer {
    tx: mpsc::Sender<Outbound>,
    stop: Option<oneshot::Sender<Stop>>,
    writer: JoinHandle<()>,
}

impl OutboundSequencer {
    pub(crate) fn spawn(sink: Box<dyn TransportSink>, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();
        let writer = tokio::spawn(write_loop(sink, rx, stop_rx));
        Self {
            tx,
            stop: Some(stop_tx),
            writer,
        }
    }

    pub(crate) fn operation_sender(&self, cancel: CancelHandle) -> OutboundSender {
        OutboundSender {
            tx: self.tx.clone(),
            cancel,
        }
    }

    pub(crate) async fn send(&self, message: Message) -> bool {
        self.tx.send(Outbound::Message(message)).await.is_ok()
    }

    /// Close after everything already queued has been written
    ///
    /// If `interrupt` resolves first, queued messages are abandoned and the
    /// close frame goes out immediately instead.
    pub(crate) async fn close<F>(self, code: u16, reason: &str, interrupt: F)
    where
        F: Future<Output = ()>,
    {
        let Self {
            tx,
            mut stop,
            mut writer,
        } = self;

        let flush = async {
            let queued = tx
                .send(Outbound::Close {
                    code,
                    reason: reason.to_string(),
                })
                .await
                .is_ok();
            drop(tx);
            if !queued {
                debug!("Writer already stopped, close frame {} not sent", code);
            }
            let _ = (&mut writer).await;
        };

        // The stop channel stays open while flushing so the writer does not
        // mistake its drop for a stop request.
        let interrupted = tokio::select! {
            biased;
            () = flush => false,
            () = interrupt => true,
        };

        if interrupted {
            debug!("Flush interrupted, closing with {} immediately", code);
            if let Some(stop) = stop.take() {
                let _ = stop.send(Stop::Close {
                    code,
                    reason: reason.to_string(),
                });
            }
            let _ = writer.await;
        }
    }

    /// Close immediately, abandoning anything still queued
    pub(crate) async fn close_now(self, code: u16, reason: &str) {
        self.stop(Stop::Close {
            code,
            reason: reason.to_string(),
        })
        .await
    }

    /// The peer sent a close frame: flush the transport's reply and stop
    pub(crate) async fn finish(self) {
        self.stop(Stop::Flush).await
    }

    /// Stop writing without sending a close frame (the peer is already gone)
    pub(crate) async fn abandon(self) {
        self.stop(Stop::Abandon).await
    }

    async fn stop(mut self, request: Stop) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(request);
        }
        let _ = self.writer.await;
    }
}

/// Last write on a transport being shut down; bounded so a peer that stopped
/// reading cannot hold the writer
async fn apply_stop(sink: &mut dyn TransportSink, request: Result<Stop, oneshot::error::RecvError>) {
    let result = match request {
        Ok(Stop::Close { code, reason }) => {
            tokio::time::timeout(STOP_TIMEOUT, sink.close(code, &reason)).await
        }
        Ok(Stop::Flush) => tokio::time::timeout(STOP_TIMEOUT, sink.flush()).await,
        Ok(Stop::Abandon) | Err(_) => return,
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!("Failed to stop transport: {}", err),
        Err(_) => debug!("Transport did not accept its final write in time"),
    }
}

async fn write_loop(
    mut sink: Box<dyn TransportSink>,
    mut rx: mpsc::Receiver<Outbound>,
    mut stop: oneshot::Receiver<Stop>,
) {
    loop {
        let item = tokio::select! {
            biased;

            request = &mut stop => {
                apply_stop(sink.as_mut(), request).await;
                break;
            }

            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let message = match item {
            Outbound::Message(message) => message,
            Outbound::Scoped { message, cancel } => {
                if cancel.is_cancelled() {
                    trace!("Dropping {} message of a cancelled operation", message.message_type());
                    continue;
                }
                message
            }
            Outbound::Close { code, reason } => {
                tokio::select! {
                    biased;
                    request = &mut stop => apply_stop(sink.as_mut(), request).await,
                    result = sink.close(code, &reason) => {
                        if let Err(err) = result {
                            debug!("Failed to send close frame {}: {}", code, err);
                        }
                    }
                }
                break;
            }
        };

        trace!("Sending {} message", message.message_type());
        let written = tokio::select! {
            biased;
            request = &mut stop => {
                apply_stop(sink.as_mut(), request).await;
                break;
            }
            written = sink.send_text(encode(&message)) => written,
        };
        if let Err(err) = written {
            warn!("Failed to write {} message: {}", message.message_type(), err);
            break;
        }
    }
    rx.close();
}
