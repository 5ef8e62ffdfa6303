//! Per-node circuit breaker.
//!
//! One breaker exists per `(run, node)` pair, created when the executor
//! first reaches the node and dropped with the run. State is never
//! persisted and never shared across runs: a breaker tripped in run N has
//! no effect on run N+1.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Breaker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls permitted.
    Closed,
    /// Calls rejected until the recovery timeout elapses.
    Open,
    /// One probe call permitted; its outcome decides the next state.
    HalfOpen,
}

/// Returned by [`CircuitBreaker::check`] when the breaker rejects a call.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker open (failures: {failure_count})")]
pub struct BreakerOpen {
    pub failure_count: u32,
}

/// Failure tracker with the CLOSED / OPEN / HALF_OPEN state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Gate a call attempt.
    ///
    /// In `Open`, transitions to `HalfOpen` and permits the call once the
    /// recovery timeout has elapsed since the last failure; rejects
    /// otherwise. `Closed` and `HalfOpen` permit the call.
    pub fn check(&mut self) -> Result<(), BreakerOpen> {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let recovered = self
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= self.recovery_timeout);
                if recovered {
                    self.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(BreakerOpen {
                        failure_count: self.failure_count,
                    })
                }
            }
        }
    }

    /// Record a successful call: reset the counter and close the breaker.
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = BreakerState::Closed;
        self.last_failure = None;
    }

    /// Record a failed call.
    ///
    /// A failure in `HalfOpen` reopens immediately; in `Closed` the counter
    /// increments and the breaker opens at the threshold.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        match self.state {
            BreakerState::HalfOpen => self.state = BreakerState::Open,
            BreakerState::Closed => {
                if self.failure_count >= self.failure_threshold {
                    self.state = BreakerState::Open;
                }
            }
            BreakerState::Open => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_FAILURE_THRESHOLD,
            Self::DEFAULT_RECOVERY_TIMEOUT,
        )
    }
}
