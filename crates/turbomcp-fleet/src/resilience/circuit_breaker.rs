//! Circuit breaker pattern implementation for fault tolerance
//!
//! This module provides a per-server circuit breaker that:
//! - Trips open after `failure_threshold` consecutive failures
//! - Fails fast while open, without invoking the guarded operation
//! - Moves to half-open once `timeout` has elapsed, letting trial calls through
//! - Closes after `success_threshold` consecutive trial successes, or re-opens
//!   on the first trial failure
//!
//! All state sits behind one mutex owned by the breaker, so breakers of
//! different servers never contend.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{FleetError, FleetResult};

/// Circuit breaker configuration
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Time spent open before trying half-open
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    /// Rolling window size for failure-rate statistics
    pub rolling_window_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            rolling_window_size: 100,
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (normal operation)
    #[default]
    Closed,
    /// Circuit is open (failing fast)
    Open,
    /// Circuit is half-open (testing if service recovered)
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Current circuit state
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub failure_count: u32,
    /// Consecutive successes while half-open
    pub success_count: u32,
    /// Failure rate over the rolling window (0.0 - 1.0)
    pub failure_rate: f64,
    /// Number of times the circuit has opened
    pub trips: u64,
    /// Whether an operator pinned the circuit open
    pub forced_open: bool,
    /// Time spent in current state
    pub time_in_current_state: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    trips: u64,
    forced_open: bool,
    last_state_change: Instant,
    rolling_window: VecDeque<bool>,
}

/// Circuit breaker guarding a single server
#[derive(Debug)]
pub struct CircuitBreaker {
    server_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(server_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            server_id: server_id.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                trips: 0,
                forced_open: false,
                last_state_change: Instant::now(),
                rolling_window: VecDeque::new(),
            }),
        }
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults(server_id: impl Into<String>) -> Self {
        Self::new(server_id, CircuitBreakerConfig::default())
    }

    /// Run `operation` through the breaker
    ///
    /// While open this returns [`FleetError::CircuitOpen`] without calling
    /// `operation`. Otherwise the outcome is recorded; fast-fail rejections
    /// produced further down the stack are passed through without counting.
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` when the circuit rejects the call, or the error
    /// produced by `operation`.
    pub async fn call<F, Fut, T>(&self, operation: F) -> FleetResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        self.try_acquire()?;

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_rejection() => {}
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Check whether a call may proceed, applying any due state transition
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` while the circuit is open.
    pub fn try_acquire(&self) -> FleetResult<()> {
        if self.state() == CircuitState::Open {
            return Err(FleetError::CircuitOpen {
                server_id: self.server_id.clone(),
            });
        }
        Ok(())
    }

    /// Record a successful operation or probe
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.update_state(&mut inner);
        self.push_window(&mut inner, true);

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    Self::transition(&mut inner, CircuitState::Closed);
                    tracing::info!(server_id = %self.server_id, "Circuit closed after successful trials");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation or probe
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.update_state(&mut inner);
        self.push_window(&mut inner, false);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => self.trip(&mut inner),
            CircuitState::Open => {}
        }
    }

    /// Current state, after applying the open → half-open timeout
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.update_state(&mut inner);
        inner.state
    }

    /// Whether the circuit is open
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Whether the circuit is half-open
    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Whether the circuit is closed
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Reset the circuit breaker to closed state, clearing all counters
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        Self::transition(&mut inner, CircuitState::Closed);
        inner.trips = 0;
        inner.rolling_window.clear();
    }

    /// Pin the circuit open until [`force_close`](Self::force_close) or [`reset`](Self::reset)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        Self::transition(&mut inner, CircuitState::Open);
        inner.forced_open = true;
        tracing::warn!(server_id = %self.server_id, "Circuit forced open by operator");
    }

    /// Close the circuit regardless of recent failures
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        Self::transition(&mut inner, CircuitState::Closed);
        tracing::info!(server_id = %self.server_id, "Circuit forced closed by operator");
    }

    /// Move an open circuit straight to half-open so the next call is a trial
    ///
    /// Used when an external recovery window (quarantine) lapses before the
    /// breaker's own timeout. Has no effect on a pinned or non-open circuit.
    pub fn begin_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open && !inner.forced_open {
            Self::transition(&mut inner, CircuitState::HalfOpen);
        }
    }

    /// Get circuit breaker statistics
    pub fn statistics(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.update_state(&mut inner);

        let failure_rate = if inner.rolling_window.is_empty() {
            0.0
        } else {
            let failures = inner.rolling_window.iter().filter(|ok| !**ok).count();
            failures as f64 / inner.rolling_window.len() as f64
        };

        CircuitBreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_rate,
            trips: inner.trips,
            forced_open: inner.forced_open,
            time_in_current_state: inner.last_state_change.elapsed(),
        }
    }

    fn push_window(&self, inner: &mut BreakerState, success: bool) {
        inner.rolling_window.push_back(success);
        while inner.rolling_window.len() > self.config.rolling_window_size {
            inner.rolling_window.pop_front();
        }
    }

    fn trip(&self, inner: &mut BreakerState) {
        Self::transition(inner, CircuitState::Open);
        inner.trips += 1;
        tracing::warn!(
            server_id = %self.server_id,
            trips = inner.trips,
            "Circuit opened"
        );
    }

    fn transition(inner: &mut BreakerState, state: CircuitState) {
        inner.state = state;
        inner.last_state_change = Instant::now();
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.forced_open = false;
    }

    fn update_state(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && !inner.forced_open
            && inner.last_state_change.elapsed() >= self.config.timeout
        {
            Self::transition(inner, CircuitState::HalfOpen);
            tracing::debug!(server_id = %self.server_id, "Circuit half-open, allowing trial calls");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing() -> impl Future<Output = FleetResult<()>> {
        async { Err(FleetError::network("connection refused")) }
    }

    #[test]
    fn test_circuit_breaker_default_state() {
        let breaker = CircuitBreaker::with_defaults("s1");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::with_defaults("s1");
        for _ in 0..4 {
            let _ = breaker.call(failing).await;
            assert!(breaker.is_closed());
        }
        let _ = breaker.call(failing).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();
        let result = breaker
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(FleetError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::with_defaults("s1");
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(breaker.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_then_closes() {
        let breaker = CircuitBreaker::with_defaults("s1");
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(breaker.is_open());
        tokio::time::advance(Duration::from_secs(1)).await;

        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();
        breaker
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert!(breaker.is_half_open());

        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert!(breaker.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::with_defaults("s1");
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(breaker.is_half_open());

        let _ = breaker.call(failing).await;
        assert!(breaker.is_open());
        assert_eq!(breaker.statistics().trips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_open_is_sticky() {
        let breaker = CircuitBreaker::with_defaults("s1");
        breaker.force_open();
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(breaker.is_open());
        breaker.begin_trial();
        assert!(breaker.is_open());

        breaker.force_close();
        assert!(breaker.is_closed());
    }

    #[test]
    fn test_begin_trial_and_reset() {
        let breaker = CircuitBreaker::with_defaults("s1");
        for _ in 0..5 {
            breaker.record_failure();
        }
        breaker.begin_trial();
        assert!(breaker.is_half_open());

        breaker.reset();
        let stats = breaker.statistics();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.trips, 0);
        assert_eq!(stats.failure_rate, 0.0);
    }

    #[test]
    fn test_circuit_breaker_statistics() {
        let breaker = CircuitBreaker::with_defaults("s1");
        breaker.record_success();
        breaker.record_failure();

        let stats = breaker.statistics();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.failure_rate, 0.5);
    }
}
