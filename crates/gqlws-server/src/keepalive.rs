//! Keep-alive monitor
//!
//! Owns the two timers of a connection: the init deadline, armed until the
//! connection is acknowledged, and the ping interval, armed afterwards. The
//! connection polls [`KeepAliveMonitor::tick`] inside its event loop; the
//! timers live in the monitor, so dropping a pending `tick` loses nothing.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep, sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveEvent {
    /// The client did not get acknowledged in time
    InitTimeout,
    /// Time to send a server `ping`
    SendPing,
    /// Nothing was received for a whole interval after the last ping
    Unresponsive,
}

pub struct KeepAliveMonitor {
    init_deadline: Option<Pin<Box<Sleep>>>,
    interval: Option<Duration>,
    next_ping: Option<Pin<Box<Sleep>>>,
    awaiting_activity: bool,
}

impl KeepAliveMonitor {
    /// Arm the init deadline. `None` disables either timer.
    pub fn new(init_timeout: Option<Duration>, interval: Option<Duration>) -> Self {
        Self {
            init_deadline: init_timeout.map(|timeout| Box::pin(sleep(timeout))),
            interval,
            next_ping: None,
            awaiting_activity: false,
        }
    }

    /// Disarm the init deadline and start the ping schedule
    pub fn acknowledged(&mut self) {
        self.init_deadline = None;
        self.awaiting_activity = false;
        self.next_ping = self.interval.map(|interval| Box::pin(sleep(interval)));
    }

    /// Any inbound message proves the peer is alive
    pub fn record_activity(&mut self) {
        self.awaiting_activity = false;
    }

    pub fn is_awaiting_activity(&self) -> bool {
        self.awaiting_activity
    }

    /// Stop both timers
    pub fn disarm(&mut self) {
        self.init_deadline = None;
        self.next_ping = None;
    }

    /// Wait for the next timer event; pends forever when nothing is armed
    pub async fn tick(&mut self) -> KeepAliveEvent {
        if let Some(deadline) = self.init_deadline.as_mut() {
            deadline.as_mut().await;
            self.init_deadline = None;
            return KeepAliveEvent::InitTimeout;
        }

        match (self.next_ping.as_mut(), self.interval) {
            (Some(next_ping), Some(interval)) => {
                next_ping.as_mut().await;
                next_ping.as_mut().reset(Instant::now() + interval);
                if self.awaiting_activity {
                    KeepAliveEvent::Unresponsive
                } else {
                    self.awaiting_activity = true;
                    KeepAliveEvent::SendPing
                }
            }
            _ => pending().await,
        }
    }
}
