//! Circuit breaker guarding one downstream service.
//!
//! State machine: `CLOSED → OPEN → HALF_OPEN → CLOSED`. Opening happens
//! when consecutive failures within the current monitoring window reach the
//! configured threshold; after `reset_timeout` the first caller is let
//! through as a probe. The monitoring window is evaluated lazily on each
//! recorded outcome, which keeps the observable semantics of a periodic
//! counter reset without a background task per breaker.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::CallError;
use crate::events::{EventDispatcher, OrchestratorEvent};
use crate::registry::descriptor::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
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

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub window_failures: u32,
    pub window_successes: u32,
    pub retry_in_ms: Option<u64>,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    window_failures: u32,
    window_successes: u32,
    window_started: Instant,
    next_attempt: Option<Instant>,
}

pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    dispatcher: EventDispatcher,
}

impl CircuitBreaker {
    pub fn new(
        service: impl Into<String>,
        config: CircuitBreakerConfig,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window_failures: 0,
                window_successes: 0,
                window_started: Instant::now(),
                next_attempt: None,
            }),
            dispatcher,
        }
    }

    /// Runs `f` under breaker rules: fails fast with `CircuitOpen` while the
    /// breaker is open, otherwise records the outcome.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.before_call()?;
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(error)
            }
        }
    }

    fn before_call(&self) -> Result<(), CallError> {
        let transition = {
            let mut inner = self.inner.lock();
            self.maybe_reset_window(&mut inner);
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => None,
                CircuitState::Open => {
                    let due = inner
                        .next_attempt
                        .map(|at| Instant::now() >= at)
                        .unwrap_or(true);
                    if !due {
                        return Err(CallError::CircuitOpen {
                            service: self.service.clone(),
                        });
                    }
                    inner.state = CircuitState::HalfOpen;
                    Some((CircuitState::Open, CircuitState::HalfOpen))
                }
            }
        };
        if let Some((from, to)) = transition {
            debug!(service = %self.service, "circuit breaker probing");
            self.emit_transition(from, to);
        }
        Ok(())
    }

    pub(crate) fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            self.maybe_reset_window(&mut inner);
            inner.window_successes += 1;
            inner.consecutive_failures = 0;
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Closed;
                inner.next_attempt = None;
                inner.window_failures = 0;
                Some((CircuitState::HalfOpen, CircuitState::Closed))
            } else {
                None
            }
        };
        if let Some((from, to)) = transition {
            info!(service = %self.service, "circuit breaker recovered");
            self.emit_transition(from, to);
        }
    }

    pub(crate) fn record_failure(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            self.maybe_reset_window(&mut inner);
            inner.window_failures += 1;
            inner.consecutive_failures += 1;
            match inner.state {
                CircuitState::Closed
                    if inner.consecutive_failures >= self.config.failure_threshold =>
                {
                    self.open(&mut inner);
                    Some((CircuitState::Closed, CircuitState::Open))
                }
                // A failed probe sends the breaker straight back to open.
                CircuitState::HalfOpen => {
                    self.open(&mut inner);
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                _ => None,
            }
        };
        if let Some((from, to)) = transition {
            warn!(
                service = %self.service,
                threshold = self.config.failure_threshold,
                "circuit breaker opened"
            );
            self.emit_transition(from, to);
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.next_attempt =
            Some(Instant::now() + Duration::from_millis(self.config.reset_timeout_ms));
    }

    fn maybe_reset_window(&self, inner: &mut BreakerInner) {
        let period = Duration::from_millis(self.config.monitoring_period_ms);
        if inner.window_started.elapsed() >= period {
            inner.window_started = Instant::now();
            inner.window_failures = 0;
            inner.window_successes = 0;
            inner.consecutive_failures = 0;
        }
    }

    /// Manually opens the breaker.
    pub fn trip(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            self.open(&mut inner);
            (from != CircuitState::Open).then_some((from, CircuitState::Open))
        };
        if let Some((from, to)) = transition {
            self.emit_transition(from, to);
        }
    }

    /// Manually closes the breaker and clears all counters.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.window_failures = 0;
            inner.window_successes = 0;
            inner.window_started = Instant::now();
            inner.next_attempt = None;
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        if let Some((from, to)) = transition {
            self.emit_transition(from, to);
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        BreakerStatus {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            window_failures: inner.window_failures,
            window_successes: inner.window_successes,
            retry_in_ms: inner.next_attempt.and_then(|at| {
                at.checked_duration_since(Instant::now())
                    .map(|d| d.as_millis() as u64)
            }),
        }
    }

    fn emit_transition(&self, from: CircuitState, to: CircuitState) {
        self.dispatcher
            .emit(OrchestratorEvent::CircuitBreakerStateChange {
                service: self.service.clone(),
                from: from.to_string(),
                to: to.to_string(),
                timestamp: Utc::now(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: reset_ms,
                monitoring_period_ms: 60_000,
            },
            EventDispatcher::new(),
        )
    }

    async fn failing_call(cb: &CircuitBreaker) -> Result<(), CallError> {
        cb.execute(|| async { Err::<(), _>(CallError::NetworkUnavailable("down".into())) })
            .await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let cb = breaker(3, 10_000);
        for _ in 0..3 {
            let _ = failing_call(&cb).await;
        }
        assert_eq!(cb.status().state, CircuitState::Open);

        // The fourth call must not reach the transport.
        let called = std::sync::atomic::AtomicBool::new(false);
        let result = cb
            .execute(|| async {
                called.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, CallError>(())
            })
            .await;
        assert!(matches!(result, Err(CallError::CircuitOpen { .. })));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn successful_probe_closes_the_breaker() {
        let cb = breaker(2, 50);
        let _ = failing_call(&cb).await;
        let _ = failing_call(&cb).await;
        assert_eq!(cb.status().state, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let result = cb.execute(|| async { Ok::<_, CallError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cb.status().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let cb = breaker(2, 50);
        let _ = failing_call(&cb).await;
        let _ = failing_call(&cb).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let _ = failing_call(&cb).await;
        assert_eq!(cb.status().state, CircuitState::Open);
        assert!(matches!(
            failing_call(&cb).await,
            Err(CallError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn success_resets_the_consecutive_counter() {
        let cb = breaker(3, 10_000);
        let _ = failing_call(&cb).await;
        let _ = failing_call(&cb).await;
        let _ = cb.execute(|| async { Ok::<_, CallError>(()) }).await;
        let _ = failing_call(&cb).await;
        let _ = failing_call(&cb).await;
        assert_eq!(cb.status().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn trip_and_reset_are_manual_overrides() {
        let cb = breaker(5, 10_000);
        cb.trip();
        assert_eq!(cb.status().state, CircuitState::Open);
        assert!(matches!(
            failing_call(&cb).await,
            Err(CallError::CircuitOpen { .. })
        ));

        cb.reset();
        assert_eq!(cb.status().state, CircuitState::Closed);
        assert!(cb.execute(|| async { Ok::<_, CallError>(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn monitoring_window_reset_clears_counters() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout_ms: 10_000,
                monitoring_period_ms: 40,
            },
            EventDispatcher::new(),
        );
        let _ = failing_call(&cb).await;
        let _ = failing_call(&cb).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Window expired: the next failure starts a fresh count.
        let _ = failing_call(&cb).await;
        assert_eq!(cb.status().state, CircuitState::Closed);
        assert_eq!(cb.status().consecutive_failures, 1);
    }
}
