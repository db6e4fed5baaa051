//! Session state machine, per-generation readiness and join backoff.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Lifecycle state of a consumer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Joining,
    Ready,
    Consuming,
    Rebalancing,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Joining => "joining",
            Self::Ready => "ready",
            Self::Consuming => "consuming",
            Self::Rebalancing => "rebalancing",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Partitions are assigned and messages may flow.
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Ready | Self::Consuming)
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Shared [`SessionState`], written by the join loop and every claim loop.
///
/// Once `Closing` is reached the only transition left is to `Closed`, so a
/// claim loop finishing late cannot move a closed consumer back to
/// `Consuming`.
#[derive(Debug)]
pub struct SessionStateCell {
    state: RwLock<SessionState>,
}

impl SessionStateCell {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::Idle),
        }
    }

    pub fn get(&self) -> SessionState {
        *self.state.read()
    }

    /// Moves to `next`. Returns false when the transition was refused.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.write();
        let allowed = match *state {
            SessionState::Closed => false,
            SessionState::Closing => next == SessionState::Closed,
            _ => true,
        };
        if allowed && *state != next {
            debug!(from = state.as_str(), to = next.as_str(), "Session state change");
            *state = next;
        }
        allowed
    }
}

impl Default for SessionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct ReadinessInner {
    generation: u64,
    sender: Option<oneshot::Sender<()>>,
    waiter: Option<oneshot::Receiver<()>>,
    signaled: bool,
}

/// Single-use readiness signal, replaced at the start of every join.
///
/// Each generation owns a fresh oneshot pair. `setup` fires it at most once
/// and the supervisor takes the receiving half. Resetting drops the
/// previous sender, so a supervisor still waiting on an old generation sees
/// its receiver close and moves on to the current one instead of hanging.
#[derive(Debug)]
pub struct Readiness {
    inner: Mutex<ReadinessInner>,
}

impl Readiness {
    pub fn new() -> Self {
        let (sender, waiter) = oneshot::channel();
        Self {
            inner: Mutex::new(ReadinessInner {
                generation: 1,
                sender: Some(sender),
                waiter: Some(waiter),
                signaled: false,
            }),
        }
    }

    /// Starts a new generation and returns its number.
    pub fn reset(&self) -> u64 {
        let (sender, waiter) = oneshot::channel();
        let previous = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.signaled = false;
            inner.waiter = Some(waiter);
            inner.sender.replace(sender)
        };
        drop(previous);
        self.generation()
    }

    /// Fires the current generation's signal. Returns false if already fired.
    pub fn signal(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.signaled {
            return false;
        }
        inner.signaled = true;
        if let Some(sender) = inner.sender.take() {
            // the waiter may already be gone; readiness is recorded regardless
            let _ = sender.send(());
        }
        true
    }

    /// Receiver for the current generation, if nobody has taken it yet.
    pub fn take_waiter(&self) -> Option<oneshot::Receiver<()>> {
        self.inner.lock().waiter.take()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().signaled
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

/// Delay policy between failed group joins.
#[derive(Debug, Clone)]
pub struct JoinBackoff {
    /// Delay after the first failure
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    pub multiplier: u32,
    /// Consecutive failures tolerated before giving up (None = retry forever)
    pub max_attempts: Option<u32>,
}

impl Default for JoinBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2,
            max_attempts: None,
        }
    }
}

impl JoinBackoff {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before retrying after `failures` consecutive failures (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}
