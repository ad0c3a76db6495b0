use crate::config::BreakerConfig;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Circuit state for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { in_flight_trials: u32 },
}

impl CircuitState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen { .. } => "half_open",
        }
    }
}

/// Per-endpoint counters alongside the state machine
#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_half_open_successes: u32,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_half_open_successes: 0,
        }
    }
}

/// Per-endpoint circuit breaker guarding the upstream feed.
///
/// The outer map lock is held only to fetch or create the endpoint's
/// circuit; state transitions run under the circuit's own lock.
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, Arc<Mutex<Circuit>>>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn circuit(&self, endpoint: &str) -> Arc<Mutex<Circuit>> {
        let mut circuits = self.circuits.lock().unwrap();
        circuits
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Circuit::new())))
            .clone()
    }

    /// Whether a request may be dispatched upstream right now.
    ///
    /// An open circuit flips to half-open once the open timeout elapses;
    /// half-open circuits admit a bounded number of concurrent trials.
    pub fn admit(&self, endpoint: &str) -> bool {
        let handle = self.circuit(endpoint);
        let mut circuit = handle.lock().unwrap();

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.open_timeout() {
                    info!("Circuit for '{endpoint}' entering half-open probe");
                    circuit.state = CircuitState::HalfOpen {
                        in_flight_trials: 1,
                    };
                    circuit.consecutive_half_open_successes = 0;
                    crate::metrics::global().record_breaker_transition(endpoint, "half_open");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen {
                ref mut in_flight_trials,
            } => {
                if *in_flight_trials < self.config.max_trials {
                    *in_flight_trials += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful upstream call
    pub fn record_success(&self, endpoint: &str) {
        let handle = self.circuit(endpoint);
        let mut circuit = handle.lock().unwrap();

        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures = 0;
            }
            CircuitState::HalfOpen {
                ref mut in_flight_trials,
            } => {
                *in_flight_trials = in_flight_trials.saturating_sub(1);
                circuit.consecutive_half_open_successes += 1;
                if circuit.consecutive_half_open_successes >= self.config.reset_threshold {
                    info!("Circuit for '{endpoint}' closed after successful trials");
                    circuit.state = CircuitState::Closed;
                    circuit.consecutive_failures = 0;
                    circuit.consecutive_half_open_successes = 0;
                    crate::metrics::global().record_breaker_transition(endpoint, "closed");
                }
            }
            // A late success while open changes nothing
            CircuitState::Open { .. } => {}
        }
    }

    /// Record a failed upstream call
    pub fn record_failure(&self, endpoint: &str) {
        let handle = self.circuit(endpoint);
        let mut circuit = handle.lock().unwrap();

        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        "Circuit for '{endpoint}' opened after {} consecutive failures",
                        circuit.consecutive_failures
                    );
                    circuit.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    crate::metrics::global().record_breaker_transition(endpoint, "open");
                }
            }
            CircuitState::HalfOpen { .. } => {
                warn!("Circuit for '{endpoint}' reopened after failed trial");
                circuit.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                circuit.consecutive_half_open_successes = 0;
                crate::metrics::global().record_breaker_transition(endpoint, "open");
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Current state for one endpoint
    pub fn state(&self, endpoint: &str) -> CircuitState {
        let handle = self.circuit(endpoint);
        let circuit = handle.lock().unwrap();
        circuit.state
    }

    /// Labels for every tracked endpoint, for the health endpoint
    pub fn states(&self) -> HashMap<String, &'static str> {
        let circuits = self.circuits.lock().unwrap();
        circuits
            .iter()
            .map(|(endpoint, handle)| {
                let circuit = handle.lock().unwrap();
                (endpoint.clone(), circuit.state.label())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(open_timeout_seconds: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            open_timeout_seconds,
            max_trials: 2,
            reset_threshold: 2,
        })
    }

    #[test]
    fn closed_circuit_admits() {
        let cb = breaker(60);
        assert!(cb.admit("rankings"));
        assert_eq!(cb.state("rankings"), CircuitState::Closed);
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = breaker(60);

        cb.record_failure("rankings");
        cb.record_failure("rankings");
        assert!(cb.admit("rankings"));

        cb.record_failure("rankings");
        assert!(matches!(
            cb.state("rankings"),
            CircuitState::Open { .. }
        ));
        assert!(!cb.admit("rankings"));
    }

    #[test]
    fn success_resets_failure_streak() {
        let cb = breaker(60);

        cb.record_failure("rankings");
        cb.record_failure("rankings");
        cb.record_success("rankings");
        cb.record_failure("rankings");
        cb.record_failure("rankings");

        // Streak was broken; still closed
        assert_eq!(cb.state("rankings"), CircuitState::Closed);
        assert!(cb.admit("rankings"));
    }

    #[test]
    fn endpoints_are_independent() {
        let cb = breaker(60);
        for _ in 0..3 {
            cb.record_failure("rankings");
        }

        assert!(!cb.admit("rankings"));
        assert!(cb.admit("tournaments"));
    }

    #[test]
    fn open_transitions_to_half_open_after_timeout() {
        let cb = breaker(0);
        for _ in 0..3 {
            cb.record_failure("rankings");
        }

        // Zero open timeout: the next admission is the probe
        assert!(cb.admit("rankings"));
        assert!(matches!(
            cb.state("rankings"),
            CircuitState::HalfOpen { .. }
        ));
    }

    #[test]
    fn half_open_caps_concurrent_trials() {
        let cb = breaker(0);
        for _ in 0..3 {
            cb.record_failure("rankings");
        }

        assert!(cb.admit("rankings")); // trial 1 (transition)
        assert!(cb.admit("rankings")); // trial 2
        assert!(!cb.admit("rankings")); // max_trials = 2
    }

    #[test]
    fn half_open_closes_after_reset_threshold_successes() {
        let cb = breaker(0);
        for _ in 0..3 {
            cb.record_failure("rankings");
        }

        assert!(cb.admit("rankings"));
        cb.record_success("rankings");
        assert!(cb.admit("rankings"));
        cb.record_success("rankings");

        assert_eq!(cb.state("rankings"), CircuitState::Closed);
        assert!(cb.admit("rankings"));
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(0);
        for _ in 0..3 {
            cb.record_failure("rankings");
        }

        assert!(cb.admit("rankings"));
        cb.record_failure("rankings");

        assert!(matches!(cb.state("rankings"), CircuitState::Open { .. }));
    }

    #[test]
    fn reopened_circuit_waits_out_the_timeout_again() {
        let cb = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            open_timeout_seconds: 1,
            max_trials: 1,
            reset_threshold: 1,
        });

        cb.record_failure("scoring");
        assert!(!cb.admit("scoring"));

        std::thread::sleep(Duration::from_millis(1100));
        assert!(cb.admit("scoring"));
        cb.record_failure("scoring");

        // Fresh opened_at: denied until the timeout elapses again
        assert!(!cb.admit("scoring"));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(cb.admit("scoring"));
        cb.record_success("scoring");
        assert_eq!(cb.state("scoring"), CircuitState::Closed);
    }
}
