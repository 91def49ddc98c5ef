//! Circuit breaker guarding the enrichment service.
//!
//! Closed until `failure_threshold` consecutive service failures land
//! within `failure_window`; then open for `cooldown`, rejecting calls
//! immediately. After the cool-down a single half-open probe is let
//! through: success closes the circuit, failure re-opens it.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::error::ServiceError;

/// Poll interval suggested to callers blocked behind a half-open probe.
const PROBE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
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
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Closed,
    HalfOpenProbe,
}

/// Permission to make one call. Must be reported back through
/// [`CircuitBreaker::on_success`] or [`CircuitBreaker::on_failure`].
#[derive(Debug)]
#[must_use]
pub struct BreakerPermit {
    kind: PermitKind,
}

/// A call refused by the breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerRejection {
    pub state: CircuitState,
    /// How long until a call might be admitted
    pub retry_in: Duration,
}

impl From<BreakerRejection> for ServiceError {
    fn from(rejection: BreakerRejection) -> Self {
        ServiceError::Unavailable(format!(
            "circuit breaker {} (retry in {:?})",
            rejection.state, rejection.retry_in
        ))
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    open_until: Option<Instant>,
    half_open_probe_inflight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: BreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                first_failure_at: None,
                open_until: None,
                half_open_probe_inflight: false,
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Asks to make a call.
    pub fn try_acquire(&self) -> Result<BreakerPermit, BreakerRejection> {
        let mut state = self.lock();
        let now = Instant::now();

        if state.state == CircuitState::Open {
            if let Some(open_until) = state.open_until {
                if now < open_until {
                    return Err(BreakerRejection {
                        state: CircuitState::Open,
                        retry_in: open_until - now,
                    });
                }
            }
            info!("Circuit breaker half-open; letting one probe through");
            state.state = CircuitState::HalfOpen;
            state.half_open_probe_inflight = false;
            state.open_until = None;
        }

        if state.state == CircuitState::HalfOpen {
            if state.half_open_probe_inflight {
                return Err(BreakerRejection {
                    state: CircuitState::HalfOpen,
                    retry_in: PROBE_POLL,
                });
            }
            state.half_open_probe_inflight = true;
            return Ok(BreakerPermit {
                kind: PermitKind::HalfOpenProbe,
            });
        }

        Ok(BreakerPermit {
            kind: PermitKind::Closed,
        })
    }

    /// Reports a call that reached a healthy service.
    pub fn on_success(&self, permit: BreakerPermit) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.first_failure_at = None;
        state.open_until = None;
        state.half_open_probe_inflight = false;
        if permit.kind == PermitKind::HalfOpenProbe || state.state != CircuitState::Closed {
            info!("Circuit breaker closed");
            state.state = CircuitState::Closed;
        }
    }

    /// Reports a call that failed because the service is unhealthy.
    pub fn on_failure(&self, permit: BreakerPermit) {
        let mut state = self.lock();
        let now = Instant::now();

        if permit.kind == PermitKind::HalfOpenProbe {
            warn!("Circuit breaker probe failed; re-opening for {:?}", self.config.cooldown);
            self.open(&mut state, now);
            return;
        }

        let window_expired = state
            .first_failure_at
            .map(|first| now.duration_since(first) > self.config.failure_window)
            .unwrap_or(true);
        if window_expired {
            state.consecutive_failures = 0;
            state.first_failure_at = Some(now);
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.state == CircuitState::Closed && state.consecutive_failures >= self.config.failure_threshold {
            warn!(
                "Circuit breaker opened after {} consecutive failures; cooling down for {:?}",
                state.consecutive_failures, self.config.cooldown
            );
            self.open(&mut state, now);
        }
    }

    fn open(&self, state: &mut BreakerState, now: Instant) {
        state.state = CircuitState::Open;
        state.open_until = Some(now + self.config.cooldown);
        state.consecutive_failures = 0;
        state.first_failure_at = None;
        state.half_open_probe_inflight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(10),
            cooldown: Duration::from_secs(5),
        })
    }

    fn fail(breaker: &CircuitBreaker) {
        let permit = breaker.try_acquire().unwrap();
        breaker.on_failure(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = breaker();
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejection = breaker.try_acquire().unwrap_err();
        assert_eq!(rejection.state, CircuitState::Open);
        assert_eq!(rejection.retry_in, Duration::from_secs(5));

        let err: ServiceError = rejection.into();
        assert!(matches!(err, ServiceError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count() {
        let breaker = breaker();
        fail(&breaker);
        fail(&breaker);
        let permit = breaker.try_acquire().unwrap();
        breaker.on_success(permit);
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_accumulate() {
        let breaker = breaker();
        fail(&breaker);
        fail(&breaker);
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_probe() {
        let breaker = breaker();
        for _ in 0..3 {
            fail(&breaker);
        }
        tokio::time::advance(Duration::from_secs(5)).await;

        let probe = breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let blocked = breaker.try_acquire().unwrap_err();
        assert_eq!(blocked.state, CircuitState::HalfOpen);

        breaker.on_success(probe);
        assert_eq!(breaker.state(), CircuitState::Closed);
        let permit = breaker.try_acquire().unwrap();
        breaker.on_success(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            fail(&breaker);
        }
        tokio::time::advance(Duration::from_secs(6)).await;

        let probe = breaker.try_acquire().unwrap();
        breaker.on_failure(probe);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.try_acquire().unwrap_err().retry_in, Duration::from_secs(5));
    }
}
