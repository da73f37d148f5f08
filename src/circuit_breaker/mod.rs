//! Circuit breaker guarding calls to unreliable downstream executors.
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are rejected without running until the cooldown elapses.
//! - **HalfOpen**: exactly one trial call is let through. Success closes the
//!   breaker, failure reopens it and restarts the cooldown.
//!
//! The breaker knows nothing about what it wraps. With [`CircuitBreaker::execute`]
//! the caller decides what a failure is by returning `Err`; with
//! [`CircuitBreaker::execute_judged`] it classifies the output as a
//! [`Verdict`], which also allows a call to count as neither. A trial that is
//! dropped before it finishes frees the half-open slot without a verdict.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::metrics;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by the state gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial call.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }
}

/// How a finished call counts against the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
    /// The downstream was never really exercised, e.g. the call was cancelled.
    Inconclusive,
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The call was rejected without running.
    #[error("Circuit '{name}' is open; retry in {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    /// The wrapped call ran and failed.
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Thread-safe circuit breaker, shared behind an `Arc`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        };
        metrics::record_breaker_state(&breaker.name, CircuitState::Closed);
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, promoting `Open` to `HalfOpen` once the cooldown elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Consecutive failures counted in the closed state.
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Forces the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        self.set_state(&mut inner, CircuitState::Closed);
    }

    /// Runs `call` unless the breaker is open; `Err` counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, call: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let outcome = self
            .execute_judged(call, |outcome: &Result<T, E>| match outcome {
                Ok(_) => Verdict::Success,
                Err(_) => Verdict::Failure,
            })
            .await
            .map_err(|rejected| match rejected {
                CircuitBreakerError::Open { name, retry_after } => {
                    CircuitBreakerError::Open { name, retry_after }
                }
                CircuitBreakerError::Inner(never) => match never {},
            })?;
        outcome.map_err(CircuitBreakerError::Inner)
    }

    /// Runs `call` unless the breaker is open and lets `judge` decide how
    /// its output counts.
    pub async fn execute_judged<F, Fut, T, J>(
        &self,
        call: F,
        judge: J,
    ) -> Result<T, CircuitBreakerError<Infallible>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        J: FnOnce(&T) -> Verdict,
    {
        let is_trial = self.acquire()?;
        let mut slot = TrialSlot {
            breaker: self,
            is_trial,
            settled: false,
        };
        let output = call().await;
        slot.settled = true;
        match judge(&output) {
            Verdict::Success => self.on_success(is_trial),
            Verdict::Failure => self.on_failure(is_trial),
            Verdict::Inconclusive => self.release_trial(is_trial),
        }
        Ok(output)
    }

    /// Returns whether the admitted call is the half-open trial.
    fn acquire<E>(&self) -> Result<bool, CircuitBreakerError<E>> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(true)
            }
            CircuitState::HalfOpen => Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                retry_after: Duration::ZERO,
            }),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after: self.config.cooldown.saturating_sub(elapsed),
                })
            }
        }
    }

    fn on_success(&self, is_trial: bool) {
        let mut inner = self.lock();
        if is_trial {
            inner.consecutive_failures = 0;
            inner.trial_in_flight = false;
            inner.opened_at = None;
            info!(breaker = %self.name, "Circuit closed after successful trial");
            self.set_state(&mut inner, CircuitState::Closed);
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    /// Frees the half-open slot without changing state.
    fn release_trial(&self, is_trial: bool) {
        if is_trial {
            self.lock().trial_in_flight = false;
        }
    }

    fn on_failure(&self, is_trial: bool) {
        let mut inner = self.lock();
        if is_trial {
            inner.trial_in_flight = false;
            inner.opened_at = Some(Instant::now());
            warn!(breaker = %self.name, "Trial call failed, circuit reopened");
            self.set_state(&mut inner, CircuitState::Open);
            return;
        }

        if inner.state != CircuitState::Closed {
            return;
        }
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.config.failure_threshold {
            inner.opened_at = Some(Instant::now());
            warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs_f64(),
                "Circuit opened"
            );
            self.set_state(&mut inner, CircuitState::Open);
        }
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let cooled = inner
                .opened_at
                .map(|t| t.elapsed() >= self.config.cooldown)
                .unwrap_or(true);
            if cooled {
                inner.trial_in_flight = false;
                self.set_state(inner, CircuitState::HalfOpen);
            }
        }
    }

    fn set_state(&self, inner: &mut BreakerInner, state: CircuitState) {
        inner.state = state;
        metrics::record_breaker_state(&self.name, state);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Releases the half-open slot if the trial future is dropped before it
/// reports back.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    is_trial: bool,
    settled: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_trial(self.is_trial);
        }
    }
}
