//! Per-class circuit breaker around the price provider.
//!
//! - **Closed**: cycles call the provider normally.
//! - **Open**: enough consecutive upstream failures; cycles fail fast.
//! - **HalfOpen**: the recovery timeout elapsed; the next cycle is a trial.
//!
//! State is in memory only and resets on restart.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::AssetClass;
use crate::duration::deserialize_duration;

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive upstream failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(
        default = "default_recovery_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "crate::duration::serialize_duration"
    )]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

pub struct CircuitBreaker {
    circuits: Mutex<HashMap<AssetClass, Circuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AssetClass, Circuit>> {
        self.circuits.lock().unwrap_or_else(|poisoned| {
            warn!("circuit breaker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Whether a cycle for `class` may call the provider at `now`.
    ///
    /// Moves an open circuit to half-open once the recovery timeout has elapsed.
    pub fn allow(&self, class: AssetClass, now: DateTime<Utc>) -> bool {
        let mut circuits = self.lock();
        let circuit = circuits.entry(class).or_insert_with(Circuit::new);
        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovery = chrono::Duration::from_std(self.config.recovery_timeout)
                    .unwrap_or_else(|_| chrono::Duration::weeks(52));
                let ready = circuit
                    .opened_at
                    .map_or(true, |opened| now.signed_duration_since(opened) >= recovery);
                if ready {
                    info!(class = %class, "circuit half-open, allowing trial refresh");
                    circuit.state = CircuitState::HalfOpen;
                }
                ready
            }
        }
    }

    pub fn record_success(&self, class: AssetClass) {
        let mut circuits = self.lock();
        let circuit = circuits.entry(class).or_insert_with(Circuit::new);
        if circuit.state != CircuitState::Closed {
            info!(class = %class, "circuit closed");
        }
        *circuit = Circuit::new();
    }

    pub fn record_failure(&self, class: AssetClass, now: DateTime<Utc>) {
        let mut circuits = self.lock();
        let circuit = circuits.entry(class).or_insert_with(Circuit::new);
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);

        let trip = match circuit.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => circuit.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            warn!(
                class = %class,
                consecutive_failures = circuit.consecutive_failures,
                recovery_secs = self.config.recovery_timeout.as_secs(),
                "circuit opened"
            );
            circuit.state = CircuitState::Open;
            circuit.opened_at = Some(now);
        }
    }

    pub fn state(&self, class: AssetClass) -> CircuitState {
        self.lock()
            .get(&class)
            .map_or(CircuitState::Closed, |circuit| circuit.state)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
