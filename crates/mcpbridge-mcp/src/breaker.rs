//! Per-MCP circuit breaker.
//!
//! closed → open after `failure_threshold` consecutive failures;
//! open → half_open once the cool-down elapses; half_open admits exactly
//! one probe, which either resets to closed or re-opens with a fresh
//! cool-down.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failures: u32,
    open_until: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                open_until: None,
                probe_in_flight: false,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    /// Gate a dispatch. `true` admits the call (and, in half-open, claims
    /// the single probe slot); `false` means fail fast without touching the
    /// transport.
    pub fn acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner.open_until.is_some_and(|t| Instant::now() >= t);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.open_until = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.open_until = Some(Instant::now() + self.cooldown);
                inner.probe_in_flight = false;
            }
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.open_until = Some(Instant::now() + self.cooldown);
                }
            }
            // A failure recorded while open (e.g. a probe admitted just
            // before the transition) re-arms the cool-down.
            BreakerState::Open => {
                inner.open_until = Some(Instant::now() + self.cooldown);
            }
        }
    }

    /// Current state, promoting open → half_open when the cool-down has
    /// elapsed (without claiming the probe slot).
    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Open if inner.open_until.is_some_and(|t| Instant::now() >= t) => {
                BreakerState::HalfOpen
            }
            s => s,
        }
    }

    /// Whether dispatch would currently be rejected.
    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }
}
