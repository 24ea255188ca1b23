//! Reconnect pacing for a dropped gateway session.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::retry::RetryPolicy;

/// Result of asking the supervisor for a reconnect.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Schedule {
    /// A reconnect is now pending and fires after `delay`.
    Scheduled { delay: Duration },
    /// A reconnect was already pending; the request was ignored.
    AlreadyPending,
    /// The attempt budget is spent.
    Exhausted { attempts: usize },
}

#[derive(Clone, Copy, Debug)]
struct PendingReconnect {
    resume_eligible: bool,
    deadline: Instant,
}

/// Holds at most one pending reconnect and the consecutive attempt count.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    policy: RetryPolicy,
    attempts: usize,
    pending: Option<PendingReconnect>,
}

impl ReconnectSupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            pending: None,
        }
    }

    pub fn schedule(&mut self, resume_eligible: bool) -> Schedule {
        if self.pending.is_some() {
            debug!(event = "reconnect_already_pending", resume_eligible);
            return Schedule::AlreadyPending;
        }

        let attempt = self.attempts + 1;
        if !self.policy.allows_attempt(attempt) {
            return Schedule::Exhausted {
                attempts: self.attempts,
            };
        }
        self.attempts = attempt;

        let delay = self.policy.delay_for_attempt(attempt);
        self.pending = Some(PendingReconnect {
            resume_eligible,
            deadline: Instant::now() + delay,
        });
        debug!(
            event = "reconnect_scheduled",
            attempt,
            resume_eligible,
            delay_ms = delay.as_millis() as u64
        );
        Schedule::Scheduled { delay }
    }

    /// Sleeps until the pending reconnect is due and returns its
    /// resume eligibility. Never resolves when nothing is pending.
    pub async fn wait(&mut self) -> bool {
        let Some(pending) = self.pending else {
            return std::future::pending().await;
        };
        tokio::time::sleep_until(pending.deadline).await;
        self.pending = None;
        pending.resume_eligible
    }

    pub fn cancel(&mut self) {
        if self.pending.take().is_some() {
            debug!(event = "reconnect_cancelled");
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Consecutive attempts since the last healthy handshake.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Called once the gateway greets a new socket.
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }
}
