//! Circuit breaker guarding all outbound daemon calls.
//!
//! Three-state machine (Closed / Open / HalfOpen). After `failure_threshold`
//! consecutive failures the circuit opens and calls fail fast without
//! touching the daemon; once the cooldown elapses a single trial call is let
//! through, and its outcome decides between closing again and re-opening.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Immutable view of the breaker for the diagnostics panel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub trial_in_flight: bool,
    /// Milliseconds since the circuit opened, when Open.
    pub open_for_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    /// Invariant: true only while `state == HalfOpen`, and at most one
    /// trial call is outstanding at a time.
    trial_in_flight: bool,
}

enum Admission {
    Proceed { trial: bool },
    Reject,
}

/// Thread-safe: all transitions go through the inner mutex, and the lock is
/// never held across an await.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    open_cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            failure_threshold: config.failure_threshold,
            open_cooldown: config.open_cooldown(),
        }
    }

    /// Run `op` under the breaker. While Open (and before the cooldown
    /// elapses) the operation is never invoked and the call fails fast with
    /// `CircuitOpen`; in HalfOpen only a single trial call gets through.
    pub async fn execute<T, F>(&self, op: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        let trial = match self.admit() {
            Admission::Reject => return Err(AppError::CircuitOpen),
            Admission::Proceed { trial } => trial,
        };

        // If the caller drops us mid-trial, release the trial slot so a
        // cancelled call cannot wedge the breaker in HalfOpen forever.
        let mut guard = TrialGuard {
            breaker: self,
            armed: trial,
        };

        let result = op.await;
        guard.armed = false;

        match &result {
            Ok(_) => self.record_success(trial),
            Err(_) => self.record_failure(trial),
        }
        result
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => Admission::Proceed { trial: false },
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_cooldown {
                    tracing::info!("Circuit breaker half-open: allowing trial call after cooldown");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Admission::Proceed { trial: true }
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Reject
                } else {
                    inner.trial_in_flight = true;
                    Admission::Proceed { trial: true }
                }
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if trial {
            tracing::info!("Circuit breaker closed after successful trial call");
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.opened_at = None;
            inner.trial_in_flight = false;
        } else if inner.state == CircuitState::Closed {
            inner.success_count += 1;
            inner.failure_count = 0;
        }
        // A non-trial call finishing after the circuit opened does not
        // close it early; the trial path owns that transition.
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if trial {
            tracing::warn!("Circuit breaker re-opened: trial call failed");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.trial_in_flight = false;
        } else if inner.state == CircuitState::Closed {
            inner.failure_count += 1;
            if inner.failure_count >= self.failure_threshold {
                tracing::warn!(
                    failures = inner.failure_count,
                    "Circuit breaker opened after {} consecutive failures",
                    inner.failure_count,
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            trial_in_flight: inner.trial_in_flight,
            open_for_ms: match inner.state {
                CircuitState::Open => inner
                    .opened_at
                    .map(|t| t.elapsed().as_millis().min(u128::from(u64::MAX)) as u64),
                _ => None,
            },
        }
    }

    /// Manual operator override ("Reset Circuit Breaker" action): force
    /// Closed with zero counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        tracing::info!("Circuit breaker manually reset");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }
}

struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self
                .breaker
                .inner
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if inner.state == CircuitState::HalfOpen {
                inner.trial_in_flight = false;
            }
        }
    }
}
