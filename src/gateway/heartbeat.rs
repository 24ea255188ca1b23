//! Heartbeat scheduling for the gateway session.
//!
//! The scheduler does not own the socket. The engine awaits
//! [`HeartbeatScheduler::tick`] inside its `select!` loop and writes the
//! heartbeat frame itself, so heartbeats are ordered with every other send on
//! the connection.
//!
//! ```text
//!   start(interval) ──> tick ──> Send ──> engine writes op 1 with sequence
//!                        │
//!                        └─ previous beat still unacked ──> Missed ──> reconnect
//! ```

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::debug;

/// Outcome of a heartbeat timer tick.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeartbeatTick {
    /// A heartbeat should be written now.
    Send,
    /// The previous heartbeat was never acknowledged.
    Missed,
}

#[derive(Debug, Default)]
pub struct HeartbeatScheduler {
    ticker: Option<Interval>,
    awaiting_ack: bool,
    sent_at: Option<Instant>,
    latency: Option<Duration>,
}

impl HeartbeatScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a repeating timer whose first tick fires one `interval` from now.
    ///
    /// Restarting a running scheduler replaces its timer and ack state.
    pub fn start(&mut self, interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        self.awaiting_ack = false;
        self.sent_at = None;
        debug!(
            event = "heartbeat_started",
            interval_ms = interval.as_millis() as u64
        );
    }

    /// Cancels the timer. Calling this on a stopped scheduler is a no-op.
    pub fn stop(&mut self) {
        if self.ticker.take().is_some() {
            debug!(event = "heartbeat_stopped");
        }
        self.awaiting_ack = false;
        self.sent_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    /// Round trip of the most recently acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn on_ack(&mut self) {
        self.awaiting_ack = false;
        if let Some(sent_at) = self.sent_at.take() {
            let latency = sent_at.elapsed();
            self.latency = Some(latency);
            debug!(
                event = "heartbeat_acked",
                latency_ms = latency.as_millis() as u64
            );
        }
    }

    /// Waits for the next tick. Never resolves while stopped.
    pub async fn tick(&mut self) -> HeartbeatTick {
        let Some(ticker) = self.ticker.as_mut() else {
            return std::future::pending().await;
        };
        ticker.tick().await;

        if self.awaiting_ack {
            return HeartbeatTick::Missed;
        }
        self.awaiting_ack = true;
        self.sent_at = Some(Instant::now());
        HeartbeatTick::Send
    }
}
