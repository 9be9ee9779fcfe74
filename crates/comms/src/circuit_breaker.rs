//! Per-service circuit breakers
//!
//! One state machine per downstream service, created lazily on the first
//! recorded failure and kept for the lifetime of the registry.
//!
//! ```text
//! Closed --(threshold consecutive failures)--> Open
//! Open --(recovery timeout elapsed, checked on access)--> HalfOpen
//! HalfOpen --(trial succeeds)--> Closed
//! HalfOpen --(trial fails)--> Open
//! ```

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CommsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
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

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Failures further apart than this restart the count
    pub failure_window: Duration,
    /// Time spent open before a trial call is allowed
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CommsConfig::default())
    }
}

impl From<&CommsConfig> for CircuitBreakerConfig {
    fn from(config: &CommsConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_threshold.max(1),
            failure_window: config.circuit_breaker_window(),
            recovery_timeout: config.circuit_breaker_recovery(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    opened_at: Option<Instant>,
    /// Set while the single half-open trial call is outstanding
    trial_started: Option<Instant>,
}

/// Read-only view of one breaker for dashboards and health endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_ms_ago: Option<u64>,
    pub open_for_ms: Option<u64>,
}

pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, CircuitBreakerState>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Gate checked before any execution attempt.
    ///
    /// Moves an expired Open breaker to HalfOpen; the call that observes that
    /// transition is admitted as the single trial.
    pub fn is_open(&self, service: &str) -> bool {
        let Some(mut breaker) = self.breakers.get_mut(service) else {
            return false;
        };
        let now = Instant::now();

        match breaker.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|opened| now.duration_since(opened))
                    .unwrap_or(Duration::MAX);
                if elapsed > self.config.recovery_timeout {
                    info!(service, "Circuit breaker moving to half-open, admitting trial call");
                    breaker.state = CircuitState::HalfOpen;
                    breaker.consecutive_failures = 0;
                    breaker.trial_started = Some(now);
                    false
                } else {
                    debug!(service, "Circuit breaker open, rejecting call");
                    true
                }
            }
            CircuitState::HalfOpen => {
                // an abandoned trial never reports back; let another one through
                let trial_pending = breaker
                    .trial_started
                    .is_some_and(|started| now.duration_since(started) <= self.config.recovery_timeout);
                if trial_pending {
                    debug!(service, "Circuit breaker half-open, trial already in flight");
                    true
                } else {
                    breaker.trial_started = Some(now);
                    false
                }
            }
        }
    }

    /// Record the outcome of one completed call execution
    pub fn record_outcome(&self, service: &str, success: bool) {
        if success {
            self.record_success(service);
        } else {
            self.record_failure(service);
        }
    }

    fn record_success(&self, service: &str) {
        let Some(mut breaker) = self.breakers.get_mut(service) else {
            return;
        };

        match breaker.state {
            CircuitState::Closed => breaker.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                info!(service, "Trial call succeeded, circuit breaker closed");
                *breaker = CircuitBreakerState::default();
            }
            // a call admitted before the breaker opened; the open period stands
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, service: &str) {
        let now = Instant::now();
        let mut breaker = self.breakers.entry(service.to_string()).or_default();

        match breaker.state {
            CircuitState::Closed => {
                let outside_window = breaker
                    .last_failure_time
                    .is_some_and(|last| now.duration_since(last) > self.config.failure_window);
                if outside_window {
                    breaker.consecutive_failures = 0;
                }
                breaker.consecutive_failures += 1;
                breaker.last_failure_time = Some(now);

                if breaker.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        service,
                        failures = breaker.consecutive_failures,
                        "Circuit breaker opened"
                    );
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(service, "Trial call failed, circuit breaker re-opened");
                breaker.state = CircuitState::Open;
                breaker.consecutive_failures += 1;
                breaker.last_failure_time = Some(now);
                breaker.opened_at = Some(now);
                breaker.trial_started = None;
            }
            CircuitState::Open => {
                breaker.last_failure_time = Some(now);
            }
        }
    }

    /// Current state without triggering the lazy Open → HalfOpen transition
    pub fn state(&self, service: &str) -> CircuitState {
        self.breakers
            .get(service)
            .map(|breaker| breaker.state)
            .unwrap_or_default()
    }

    pub fn consecutive_failures(&self, service: &str) -> u32 {
        self.breakers
            .get(service)
            .map(|breaker| breaker.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn status(&self) -> BTreeMap<String, BreakerSnapshot> {
        let now = Instant::now();
        let as_ms = |instant: Option<Instant>| {
            instant.map(|at| now.duration_since(at).as_millis() as u64)
        };

        self.breakers
            .iter()
            .map(|entry| {
                let breaker = entry.value();
                let snapshot = BreakerSnapshot {
                    state: breaker.state,
                    consecutive_failures: breaker.consecutive_failures,
                    last_failure_ms_ago: as_ms(breaker.last_failure_time),
                    open_for_ms: match breaker.state {
                        CircuitState::Open => as_ms(breaker.opened_at),
                        _ => None,
                    },
                };
                (entry.key().clone(), snapshot)
            })
            .collect()
    }

    /// Force a breaker closed
    pub fn reset(&self, service: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(service) {
            info!(service, "Circuit breaker manually reset");
            *breaker = CircuitBreakerState::default();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
