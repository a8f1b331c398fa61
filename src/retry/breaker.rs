//! Circuit breaker for upstream provider protection

use crate::config::BreakerConfig;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,   // Normal operation
    Open,     // Failing, reject requests
    HalfOpen, // Probing whether the provider recovered
}

/// Circuit breaker state for a single provider
#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    failure_count: usize,
    half_open_calls: usize,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            half_open_calls: 0,
            last_failure: None,
            opened_at: None,
        }
    }
}

/// Why a call was rejected without reaching the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerRejection {
    /// Circuit is open, cooldown not yet elapsed
    Open,
    /// Circuit is half-open and the probe budget is spent
    ProbeLimit,
}

/// Circuit breaker keyed by provider
pub struct CircuitBreaker {
    breakers: Mutex<HashMap<String, BreakerEntry>>,
    config: BreakerConfig,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Ask permission to attempt a call. Transitions `open -> half-open`
    /// once the reset timeout has elapsed; half-open admits at most
    /// `half_open_max_calls` probes until one of them resolves the circuit.
    pub fn try_acquire(&self, provider: &str) -> Result<(), BreakerRejection> {
        let mut breakers = self.breakers.lock().unwrap();
        let entry = breakers
            .entry(provider.to_string())
            .or_insert_with(BreakerEntry::new);

        match entry.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed());
                match elapsed {
                    Some(e) if e >= self.config.reset_timeout() => {
                        entry.state = BreakerState::HalfOpen;
                        entry.half_open_calls = 1;
                        Ok(())
                    }
                    _ => Err(BreakerRejection::Open),
                }
            }
            BreakerState::HalfOpen => {
                if entry.half_open_calls < self.config.half_open_max_calls {
                    entry.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(BreakerRejection::ProbeLimit)
                }
            }
        }
    }

    /// Mark a successful call. A half-open probe success closes the circuit.
    pub fn mark_success(&self, provider: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        let entry = breakers
            .entry(provider.to_string())
            .or_insert_with(BreakerEntry::new);

        entry.state = BreakerState::Closed;
        entry.failure_count = 0;
        entry.half_open_calls = 0;
        entry.last_failure = None;
        entry.opened_at = None;
    }

    /// Mark a failed call. Crossing the threshold (or failing a half-open
    /// probe) opens the circuit.
    pub fn mark_failure(&self, provider: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        let entry = breakers
            .entry(provider.to_string())
            .or_insert_with(BreakerEntry::new);

        entry.failure_count += 1;
        entry.last_failure = Some(Instant::now());

        let reopen = entry.state == BreakerState::HalfOpen
            || entry.failure_count >= self.config.failure_threshold;
        if reopen {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
            entry.half_open_calls = 0;
        }
    }

    /// Get the current state for a provider
    pub fn state(&self, provider: &str) -> BreakerState {
        let breakers = self.breakers.lock().unwrap();
        breakers
            .get(provider)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Get statistics for a provider
    pub fn stats(&self, provider: &str) -> BreakerStats {
        let breakers = self.breakers.lock().unwrap();

        if let Some(entry) = breakers.get(provider) {
            BreakerStats {
                state: entry.state,
                failure_count: entry.failure_count,
                last_failure: entry.last_failure,
            }
        } else {
            BreakerStats {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
            }
        }
    }

    /// Reset a specific provider's circuit
    pub fn reset(&self, provider: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        breakers.remove(provider);
    }

    /// Reset all circuits
    pub fn reset_all(&self) {
        let mut breakers = self.breakers.lock().unwrap();
        breakers.clear();
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub failure_count: usize,
    pub last_failure: Option<Instant>,
}
