//! Cooperative cancellation for a running GraphQL operation
//!
//! Each registered operation owns one handle. The connection keeps a clone in
//! its registry entry and signals it on client `complete`, connection close or
//! forced disposal; the operation task races its pipeline against
//! [`CancelHandle::cancelled`].

use std::fmt;

use tokio::sync::watch;

/// Why an operation was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The client sent `complete` for the operation id
    ClientComplete,
    /// The connection is closing (protocol violation, peer gone, keep-alive)
    ConnectionClosed,
    /// The server is being disposed forcefully
    ServerShutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::ClientComplete => f.write_str("client complete"),
            CancelReason::ConnectionClosed => f.write_str("connection closed"),
            CancelReason::ServerShutdown => f.write_str("server shutdown"),
        }
    }
}

/// Clone-friendly cancellation signal for a single operation.
///
/// The first reason wins; later calls to [`CancelHandle::cancel`] are ignored.
#[derive(Clone)]
pub struct CancelHandle {
    tx: watch::Sender<Option<CancelReason>>,
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { tx, rx }
    }

    /// Signal cancellation. Idempotent; keeps the first reason.
    pub fn cancel(&self, reason: CancelReason) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Wait until cancellation is requested.
    ///
    /// Returns immediately if already cancelled.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        if let Some(reason) = *rx.borrow_and_update() {
            return reason;
        }
        loop {
            if rx.changed().await.is_err() {
                // Every sender is gone, nobody is left to run the operation
                return CancelReason::ConnectionClosed;
            }
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_new_handle_not_cancelled() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());
        assert_eq!(handle.reason(), None);
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let handle = CancelHandle::new();
        handle.cancel(CancelReason::ClientComplete);
        handle.cancel(CancelReason::ServerShutdown);
        assert_eq!(handle.reason(), Some(CancelReason::ClientComplete));
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        handle.cancel(CancelReason::ConnectionClosed);
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves_with_reason() {
        let handle = CancelHandle::new();
        let clone = handle.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            clone.cancel(CancelReason::ServerShutdown);
        });

        let reason = tokio::time::timeout(Duration::from_secs(1), handle.cancelled())
            .await
            .expect("cancelled() should resolve within timeout");
        assert_eq!(reason, CancelReason::ServerShutdown);
    }

    #[tokio::test]
    async fn test_cancelled_immediate_if_already_cancelled() {
        let handle = CancelHandle::new();
        handle.cancel(CancelReason::ClientComplete);

        let reason = tokio::time::timeout(Duration::from_millis(10), handle.cancelled())
            .await
            .expect("cancelled() should resolve immediately when already cancelled");
        assert_eq!(reason, CancelReason::ClientComplete);
    }
}
