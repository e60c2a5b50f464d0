//! Retry and circuit-breaker policies for external dependencies

use crate::error::{AgentError, Result};
use rand::Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exponential backoff retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay before the first retry
    pub base_delay: Duration,

    /// Multiplier applied per attempt
    pub factor: f64,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Maximum retry attempts after the initial call
    pub max_attempts: usize,

    /// Jitter fraction applied to each delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(8),
            max_attempts: 3,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `attempt` (0-based), with jitter applied
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let raw = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let spread = capped * self.jitter;
        let jittered = if spread > 0.0 {
            capped - spread + rand::rng().random_range(0.0..(2.0 * spread))
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Run an operation, retrying retryable errors with backoff
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after throttle"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-tool circuit breaker.
///
/// Opens after `failure_threshold` failures inside `window`; after
/// `cool_down` elapses a single probe call is allowed through, and its
/// outcome closes or re-opens the circuit.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: usize,
    window: Duration,
    cool_down: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cool_down: Duration::from_secs(60),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state, advancing Open to HalfOpen when the cool-down elapsed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.advance(&mut inner);
        inner.state
    }

    fn advance(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(opened) = inner.opened_at {
                if opened.elapsed() >= self.cool_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = false;
                    debug!(breaker = %self.name, "circuit half-open, probe permitted");
                }
            }
        }
    }

    /// Whether a call may proceed. In half-open state only the first caller
    /// gets through as the probe.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.advance(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != CircuitState::Closed {
            debug!(breaker = %self.name, "circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.probe_in_flight = false;
            warn!(breaker = %self.name, "probe failed, circuit re-opened");
            return;
        }

        inner.failures.push_back(now);
        while let Some(front) = inner.failures.front() {
            if now.duration_since(*front) > self.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }

        if inner.failures.len() >= self.failure_threshold && inner.state == CircuitState::Closed {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            warn!(
                breaker = %self.name,
                failures = inner.failures.len(),
                "failure threshold reached, circuit opened"
            );
        }
    }

    /// Run an operation through the breaker, recording its outcome
    pub async fn call<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if !self.try_acquire() {
            return Err(AgentError::ToolUnavailable {
                tool: self.name.clone(),
            });
        }
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 0..6 {
            let delay = policy.delay_for(attempt);
            // Cap of 8s plus 20% jitter headroom.
            assert!(delay <= Duration::from_secs_f64(8.0 * 1.2 + 0.001));
        }
        // First delay centers on 0.5s.
        let first = policy.delay_for(0);
        assert!(first >= Duration::from_secs_f64(0.5 * 0.8) - Duration::from_millis(1));
        assert!(first <= Duration::from_secs_f64(0.5 * 1.2) + Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_non_retryable() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result: Result<()> = policy
            .run("test", || {
                calls += 1;
                async { Err(AgentError::Validation("no".to_string())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_throttle() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let mut calls = 0;
        let result = policy
            .run("test", || {
                calls += 1;
                let attempt = calls;
                async move {
                    if attempt < 3 {
                        Err(AgentError::Throttled("busy".to_string()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new("test");
        assert_eq!(breaker.state(), CircuitState::Closed);

        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_breaker_half_open_single_probe() {
        let mut breaker = CircuitBreaker::new("test");
        breaker.cool_down = Duration::from_millis(0);

        for _ in 0..5 {
            breaker.record_failure();
        }
        // Cool-down of zero advances straight to half-open.
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire());
        // Second caller is rejected while the probe is in flight.
        assert!(!breaker.try_acquire());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[tokio::test]
    async fn test_breaker_call_surfaces_unavailable() {
        let breaker = CircuitBreaker::new("market_data");
        for _ in 0..5 {
            breaker.record_failure();
        }
        let result: Result<()> = breaker.call(async { Ok(()) }).await;
        match result {
            Err(AgentError::ToolUnavailable { tool }) => assert_eq!(tool, "market_data"),
            other => panic!("expected ToolUnavailable, got {:?}", other.err()),
        }
    }
}
