//! Circuit breaker registry (spec.md §4.3).
//!
//! Grounded directly on `api::gateway::CircuitBreaker`: same three-state
//! machine (Closed/Open/HalfOpen), same `parking_lot::RwLock` fields, same
//! half-open-probe-on-timeout behavior. Generalized into a registry keyed by
//! `source:{id}` so each source gets its own breaker, created lazily on
//! first use and kept for the life of the process (spec.md §4.3, §5 — this
//! state is explicitly process-local, not shared across replicas).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub volume_threshold: u32,
    pub open_duration: Duration,
    pub half_open_success_threshold: u32,
    pub window_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            volume_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_success_threshold: 2,
            window_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error, Clone, Copy)]
pub enum BreakerError {
    #[error("circuit open for this source")]
    Open,
}

/// Per-source breaker. A request volume below `volume_threshold` never trips
/// the breaker even at 100% failure (spec.md §4.3 "small-sample" edge case).
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: RwLock<CircuitState>,
    failures: RwLock<u32>,
    requests: RwLock<u32>,
    half_open_successes: RwLock<u32>,
    last_transition: RwLock<Instant>,
    window_start: RwLock<Instant>,
}

impl CircuitBreaker {
    fn new(config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            failures: RwLock::new(0),
            requests: RwLock::new(0),
            half_open_successes: RwLock::new(0),
            last_transition: RwLock::new(now),
            window_start: RwLock::new(now),
        }
    }

    pub fn is_allowed(&self) -> Result<(), BreakerError> {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                if self.last_transition.read().elapsed() >= self.config.open_duration {
                    self.transition_to_half_open();
                    Ok(())
                } else {
                    Err(BreakerError::Open)
                }
            }
        }
    }

    pub fn record_success(&self) {
        match *self.state.read() {
            CircuitState::Closed => {
                *self.failures.write() = 0;
            }
            CircuitState::HalfOpen => {
                let mut successes = self.half_open_successes.write();
                *successes += 1;
                if *successes >= self.config.half_open_success_threshold {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.roll_window_if_expired();

        match *self.state.read() {
            CircuitState::Closed => {
                let requests = {
                    let mut r = self.requests.write();
                    *r += 1;
                    *r
                };
                let failures = {
                    let mut f = self.failures.write();
                    *f += 1;
                    *f
                };
                if requests >= self.config.volume_threshold && failures >= self.config.failure_threshold {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => self.transition_to_open(),
            CircuitState::Open => {}
        }
    }

    fn roll_window_if_expired(&self) {
        let start = *self.window_start.read();
        if start.elapsed() >= self.config.window_duration {
            *self.window_start.write() = Instant::now();
            *self.failures.write() = 0;
            *self.requests.write() = 0;
        }
    }

    fn transition_to_closed(&self) {
        tracing::info!("circuit breaker -> closed");
        *self.state.write() = CircuitState::Closed;
        *self.failures.write() = 0;
        *self.requests.write() = 0;
        *self.half_open_successes.write() = 0;
        *self.last_transition.write() = Instant::now();
    }

    fn transition_to_open(&self) {
        tracing::warn!("circuit breaker -> open");
        *self.state.write() = CircuitState::Open;
        *self.half_open_successes.write() = 0;
        *self.last_transition.write() = Instant::now();
    }

    fn transition_to_half_open(&self) {
        tracing::info!("circuit breaker -> half-open");
        *self.state.write() = CircuitState::HalfOpen;
        *self.half_open_successes.write() = 0;
        *self.last_transition.write() = Instant::now();
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            state: self.state(),
            failures: *self.failures.read(),
            requests: *self.requests.read(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failures: u32,
    pub requests: u32,
}

/// Process-wide registry of per-source breakers, lazily populated.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, source_id: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(format!("source:{source_id}"))
            .or_insert_with(|| Arc::new(CircuitBreaker::new(config)))
            .clone()
    }

    pub fn stats(&self, source_id: &str) -> Option<BreakerStats> {
        self.breakers
            .get(&format!("source:{source_id}"))
            .map(|b| b.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            volume_threshold: 3,
            open_duration: Duration::from_millis(20),
            half_open_success_threshold: 1,
            window_duration: Duration::from_secs(60),
        }
    }

    #[test]
    fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.is_allowed(), Err(BreakerError::Open)));
    }

    #[test]
    fn below_volume_threshold_never_opens() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            volume_threshold: 100,
            ..config()
        });
        for _ in 0..10 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_after_timeout_closes_on_success() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.is_allowed().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        breaker.is_allowed().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn registry_reuses_same_breaker_per_source() {
        let registry = BreakerRegistry::new();
        let a = registry.get_or_create("src-1", config());
        let b = registry.get_or_create("src-1", config());
        a.record_failure();
        assert_eq!(b.stats().failures, 1);
    }
}
