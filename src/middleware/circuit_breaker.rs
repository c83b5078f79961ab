use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::config::ClassifierConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast until the cool-down elapses
    Open,
    /// One probe call is allowed to test the endpoint
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: usize,
    /// Cool-down before a probe is allowed
    pub timeout: Duration,
    /// Consecutive probe successes needed to close the circuit
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

impl From<&ClassifierConfig> for CircuitBreakerConfig {
    fn from(config: &ClassifierConfig) -> Self {
        Self {
            failure_threshold: config.circuit_failure_threshold,
            timeout: Duration::from_secs(config.circuit_timeout_secs),
            ..Self::default()
        }
    }
}

/// Circuit breaker for a remote model endpoint.
///
/// While open, callers skip the request and take their failure path
/// immediately instead of waiting for a timeout per region. In half-open
/// state only one probe is in flight at a time.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<CircuitBreakerInner>>,
    config: CircuitBreakerConfig,
}

struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    total_failures: usize,
    total_successes: usize,
    total_rejected: usize,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CircuitBreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: false,
                total_failures: 0,
                total_successes: 0,
                total_rejected: 0,
            })),
            config,
        }
    }

    /// Ask to make a call. `None` means the circuit is open and the caller
    /// should fail fast.
    ///
    /// In half-open state the returned permit holds the single probe slot.
    /// A permit dropped without an outcome (the call was cancelled) frees the
    /// slot so the next caller can probe.
    pub fn allow_request(&self) -> Option<CircuitPermit<'_>> {
        let mut inner = self.inner.write();

        let probe = match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map_or(true, |opened| opened.elapsed() >= self.config.timeout);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.probe_in_flight = true;
                    Some(true)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(true)
                }
            }
        };

        match probe {
            Some(probe) => Some(CircuitPermit {
                breaker: self,
                probe,
                settled: false,
            }),
            None => {
                inner.total_rejected += 1;
                None
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.write();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.consecutive_successes = 0;
                inner.opened_at = None;
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.write();
        inner.total_failures += 1;
        inner.consecutive_successes = 0;

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                inner.consecutive_failures = 1;
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }

    fn release_probe(&self) {
        let mut inner = self.inner.write();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.read();
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            total_rejected: inner.total_rejected,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Admission to call the guarded endpoint, settled with the call's outcome
#[must_use = "settle the permit with record_success or record_failure"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure();
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub total_failures: usize,
    pub total_successes: usize,
    pub total_rejected: usize,
}
