use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast until the timeout elapses.
    Open,
    /// One probe is allowed through.
    HalfOpen,
}

/// Result of asking a breaker for permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed.
    Allowed,
    /// This call is the single half-open probe.
    Probe,
    /// Fail fast; a probe may be attempted after `retry_in`.
    Rejected {
        /// Time until the next probe.
        retry_in: Duration,
    },
}

/// Per-operation failure gate. The failure count only resets on success.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    probing: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self { state: CircuitState::Closed, failure_count: 0, opened_at: None, last_failure: None, probing: false }
    }
}

impl CircuitBreaker {
    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failures since the last success.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// When the last failure was recorded.
    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// Time left before an open circuit allows a probe.
    pub fn retry_in(&self, now: Instant, timeout: Duration) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => timeout.saturating_sub(now.saturating_duration_since(at)),
            _ => Duration::ZERO,
        }
    }

    /// Ask to run. An open circuit whose timeout elapsed turns half-open and
    /// admits exactly one probe.
    pub fn admit(&mut self, now: Instant, timeout: Duration) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let retry_in = self.retry_in(now, timeout);
                if retry_in.is_zero() {
                    self.state = CircuitState::HalfOpen;
                    self.probing = true;
                    Admission::Probe
                } else {
                    Admission::Rejected { retry_in }
                }
            }
            CircuitState::HalfOpen if self.probing => Admission::Rejected { retry_in: Duration::ZERO },
            CircuitState::HalfOpen => {
                self.probing = true;
                Admission::Probe
            }
        }
    }

    /// Close the circuit and reset the failure count.
    pub fn on_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.probing = false;
    }

    /// Count a failure; returns `true` if this call opened the circuit.
    pub fn on_failure(&mut self, now: Instant, threshold: u32) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);
        let open = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.failure_count >= threshold.max(1),
            CircuitState::Open => false,
        };
        if open {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
            self.probing = false;
        }
        open
    }
}
