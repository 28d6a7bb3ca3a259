//! Per-domain circuit breaker. Grounded on the teacher's
//! `riptide-reliability::circuit::CircuitBreaker` (atomics over a lock,
//! `try_acquire`/`on_success`/`on_failure`), adapted to the three trip
//! conditions and half-open probe-count semantics spec'd in §4.2.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering::Relaxed};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            1 => State::Open,
            2 => State::HalfOpen,
            _ => State::Closed,
        }
    }
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub consecutive_fail_threshold: u32,
    pub min_samples_to_trip: u32,
    pub error_rate_threshold: f64,
    pub open_state_duration: Duration,
    pub half_open_probes: u32,
}

/// `CircuitBreaker` tracks state with a start-of-process `Instant` epoch so
/// `now_ms()` values are comparable without wall-clock dependence.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    opened_at_ms: AtomicU64,
    cfg: CircuitConfig,
    epoch: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitConfig) -> Self {
        Self {
            state: AtomicU8::new(State::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            cfg,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn state(&self) -> State {
        self.state.load(Relaxed).into()
    }

    /// Evaluate admission for the next request. Transitions Open ->
    /// HalfOpen once `open_state_duration` has elapsed.
    pub fn try_admit(&self) -> Admission {
        match self.state() {
            State::Closed => Admission::Allowed,
            State::Open => {
                let opened_at = self.opened_at_ms.load(Relaxed);
                if self.now_ms().saturating_sub(opened_at)
                    >= self.cfg.open_state_duration.as_millis() as u64
                {
                    self.state.store(State::HalfOpen as u8, Relaxed);
                    Admission::Allowed
                } else {
                    Admission::Denied
                }
            }
            State::HalfOpen => Admission::Allowed,
        }
    }

    fn trip_open(&self) {
        self.state.store(State::Open as u8, Relaxed);
        self.opened_at_ms.store(self.now_ms(), Relaxed);
        self.half_open_successes.store(0, Relaxed);
    }

    /// Record a successful response/feedback.
    pub fn on_success(&self) {
        match self.state() {
            State::Closed => {
                self.consecutive_failures.store(0, Relaxed);
            }
            State::HalfOpen => {
                let succ = self.half_open_successes.fetch_add(1, Relaxed) + 1;
                if succ >= self.cfg.half_open_probes {
                    self.state.store(State::Closed as u8, Relaxed);
                    self.consecutive_failures.store(0, Relaxed);
                    self.half_open_successes.store(0, Relaxed);
                }
            }
            State::Open => {}
        }
    }

    /// Record a failed response/feedback. `window_total`/`window_errors`
    /// are the sliding-window sample counts the domain state maintains,
    /// used to evaluate the error-rate trip condition.
    pub fn on_failure(&self, window_total: u64, window_errors: u64) {
        match self.state() {
            State::Closed => {
                let f = self.consecutive_failures.fetch_add(1, Relaxed) + 1;
                let error_rate = if window_total > 0 {
                    window_errors as f64 / window_total as f64
                } else {
                    0.0
                };
                if f >= self.cfg.consecutive_fail_threshold
                    || (window_total as u32 >= self.cfg.min_samples_to_trip
                        && error_rate >= self.cfg.error_rate_threshold)
                {
                    self.trip_open();
                }
            }
            State::HalfOpen => self.trip_open(),
            State::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitConfig {
        CircuitConfig {
            consecutive_fail_threshold: 1,
            min_samples_to_trip: 100,
            error_rate_threshold: 1.0,
            open_state_duration: Duration::from_millis(30),
            half_open_probes: 2,
        }
    }

    #[test]
    fn trips_open_on_consecutive_failures() {
        let cb = CircuitBreaker::new(cfg());
        assert_eq!(cb.try_admit(), Admission::Allowed);
        cb.on_failure(1, 1);
        assert_eq!(cb.state(), State::Open);
        assert_eq!(cb.try_admit(), Admission::Denied);
    }

    #[test]
    fn half_open_then_closed_after_probes() {
        let cb = CircuitBreaker::new(cfg());
        cb.on_failure(1, 1);
        assert_eq!(cb.state(), State::Open);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cb.try_admit(), Admission::Allowed);
        assert_eq!(cb.state(), State::HalfOpen);
        cb.on_success();
        assert_eq!(cb.state(), State::HalfOpen);
        cb.on_success();
        assert_eq!(cb.state(), State::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let cb = CircuitBreaker::new(cfg());
        cb.on_failure(1, 1);
        std::thread::sleep(Duration::from_millis(40));
        cb.try_admit();
        assert_eq!(cb.state(), State::HalfOpen);
        cb.on_failure(1, 1);
        assert_eq!(cb.state(), State::Open);
    }

    #[test]
    fn error_rate_trip_condition() {
        let cfg = CircuitConfig {
            consecutive_fail_threshold: 1000,
            min_samples_to_trip: 4,
            error_rate_threshold: 0.5,
            open_state_duration: Duration::from_millis(30),
            half_open_probes: 1,
        };
        let cb = CircuitBreaker::new(cfg);
        cb.on_failure(4, 2);
        assert_eq!(cb.state(), State::Open);
    }
}
