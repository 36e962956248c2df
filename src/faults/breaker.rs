//! Circuit breakers, one per operation class.
//!
//! Standard three-state machine: `Closed -> Open` after a run of failures,
//! `Open -> HalfOpen` once the cooldown elapses, `HalfOpen -> Closed` after
//! enough probe successes. Any failure while half-open reopens immediately.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::session::StageKind;

/// What a breaker isolates: the whole enrichment call, or one stage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Enrichment,
    Stage(StageKind),
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enrichment => write!(f, "enrichment"),
            Self::Stage(stage) => write!(f, "stage:{stage}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker bookkeeping for one operation class.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            opened_at: None,
        }
    }
}

/// Lazily-populated registry of breakers, one per operation class.
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<OperationClass, CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Whether calls for this class are currently blocked.
    ///
    /// An open breaker whose cooldown has elapsed flips to half-open here
    /// and lets the probe through.
    pub fn is_open(&self, class: OperationClass, now: DateTime<Utc>) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker mutex poisoned");
        let breaker = breakers.entry(class).or_insert_with(CircuitBreaker::new);

        match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let cooldown = ChronoDuration::from_std(self.config.cooldown)
                    .unwrap_or_else(|_| ChronoDuration::seconds(60));
                let elapsed = breaker
                    .opened_at
                    .map(|at| now.signed_duration_since(at) >= cooldown)
                    .unwrap_or(true);
                if elapsed {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.success_count = 0;
                    info!(class = %class, "Circuit half-open, probing");
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, class: OperationClass, now: DateTime<Utc>) {
        let mut breakers = self.breakers.lock().expect("breaker mutex poisoned");
        let breaker = breakers.entry(class).or_insert_with(CircuitBreaker::new);
        breaker.last_failure_at = Some(now);

        match breaker.state {
            CircuitState::Closed => {
                breaker.failure_count += 1;
                if breaker.failure_count >= self.config.failure_threshold {
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(now);
                    warn!(
                        class = %class,
                        failures = breaker.failure_count,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed — reopen immediately.
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(now);
                breaker.success_count = 0;
                breaker.failure_count += 1;
                warn!(class = %class, "Circuit reopened after failed probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, class: OperationClass) {
        let mut breakers = self.breakers.lock().expect("breaker mutex poisoned");
        let breaker = breakers.entry(class).or_insert_with(CircuitBreaker::new);

        match breaker.state {
            CircuitState::Closed => {
                breaker.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                breaker.success_count += 1;
                if breaker.success_count >= self.config.close_after_successes {
                    breaker.state = CircuitState::Closed;
                    breaker.failure_count = 0;
                    breaker.success_count = 0;
                    breaker.opened_at = None;
                    info!(class = %class, "Circuit closed, recovery complete");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state of a class's breaker (Closed if never used).
    pub fn state(&self, class: OperationClass) -> CircuitState {
        self.breakers
            .lock()
            .expect("breaker mutex poisoned")
            .get(&class)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot of all breakers, for diagnostics.
    pub fn snapshot(&self) -> Vec<(OperationClass, CircuitBreaker)> {
        self.breakers
            .lock()
            .expect("breaker mutex poisoned")
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }
}
