// ===============================
// src/circuit_breaker.rs
// ===============================
//
// Closed -> Open -> HalfOpen -> Closed guard around one REST endpoint.
//
// Open cool-down grows as base * 2^recovery_attempts (capped). While
// half-open a single probe is in flight at a time; enough consecutive probe
// successes close the breaker, any probe failure re-opens it.
//
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::TransportError;
use crate::metrics::CIRCUIT_STATE;

#[derive(Debug, Clone)]
pub struct BreakerCfg {
    pub failure_threshold: u32,
    pub base_timeout: Duration,
    pub max_timeout: Duration,
    /// Consecutive half-open successes needed to close.
    pub close_after: u32,
    /// Consecutive closed-state successes that forgive one stale failure.
    pub decay_after: u32,
}

impl Default for BreakerCfg {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(300),
            close_after: 3,
            decay_after: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn gauge(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    recovery_attempts: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    cfg: BreakerCfg,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, cfg: BreakerCfg) -> Self {
        Self {
            name: name.to_string(),
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                recovery_attempts: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a poisoned breaker still holds valid counters
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cooldown(&self, recovery_attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(recovery_attempts.min(16));
        self.cfg.base_timeout.saturating_mul(factor).min(self.cfg.max_timeout)
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Cool-down the breaker would apply if it opened right now.
    pub fn next_cooldown(&self) -> Duration {
        let g = self.lock();
        self.cooldown(g.recovery_attempts)
    }

    fn set_state(&self, g: &mut Inner, next: BreakerState) {
        if g.state != next {
            info!(endpoint = %self.name, from = ?g.state, to = ?next, "circuit breaker transition");
            g.state = next;
            CIRCUIT_STATE.with_label_values(&[&self.name]).set(next.gauge());
        }
    }

    /// Admission check; fails fast with the remaining cool-down while open.
    pub fn try_acquire(&self) -> Result<(), TransportError> {
        let mut g = self.lock();
        match g.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooldown = self.cooldown(g.recovery_attempts);
                let elapsed = g.last_failure.map(|t| t.elapsed()).unwrap_or(cooldown);
                if elapsed >= cooldown {
                    g.recovery_attempts += 1;
                    g.successes = 0;
                    g.probe_in_flight = true;
                    self.set_state(&mut g, BreakerState::HalfOpen);
                    Ok(())
                } else {
                    Err(TransportError::CircuitOpen { endpoint: self.name.clone(), remaining: cooldown - elapsed })
                }
            }
            BreakerState::HalfOpen => {
                if g.probe_in_flight {
                    Err(TransportError::CircuitOpen { endpoint: self.name.clone(), remaining: Duration::ZERO })
                } else {
                    g.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut g = self.lock();
        g.successes += 1;
        match g.state {
            BreakerState::HalfOpen => {
                g.probe_in_flight = false;
                if g.successes >= self.cfg.close_after {
                    g.failures = 0;
                    g.successes = 0;
                    g.recovery_attempts = 0;
                    self.set_state(&mut g, BreakerState::Closed);
                }
            }
            BreakerState::Closed => {
                if g.failures > 0 && g.successes >= self.cfg.decay_after {
                    g.failures -= 1;
                    g.successes = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut g = self.lock();
        g.last_failure = Some(Instant::now());
        g.successes = 0;
        match g.state {
            BreakerState::Closed => {
                g.failures += 1;
                if g.failures >= self.cfg.failure_threshold {
                    warn!(endpoint = %self.name, failures = g.failures, "circuit breaker opened");
                    self.set_state(&mut g, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                g.probe_in_flight = false;
                warn!(endpoint = %self.name, attempts = g.recovery_attempts, "probe failed, circuit re-opened");
                self.set_state(&mut g, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Release a half-open probe slot without judging the venue (the call was
    /// answered with something that is neither a success nor a transport failure).
    pub fn release_probe(&self) {
        self.lock().probe_in_flight = false;
    }
}
