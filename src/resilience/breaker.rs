use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admit {
    Pass,
    /// The caller is the single half-open probe and must report back.
    Probe,
    Reject,
}

/// Breaker state for one operation name. Pure state machine: the clock is passed in.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    failure_threshold: u32,
    reset_timeout: Duration,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    pub fn configure(&mut self, failure_threshold: u32, reset_timeout: Duration) {
        self.failure_threshold = failure_threshold.max(1);
        self.reset_timeout = reset_timeout;
    }

    pub(crate) fn try_acquire(&mut self, now: Instant) -> Admit {
        match self.state {
            CircuitState::Closed => Admit::Pass,
            CircuitState::Open => {
                let cooled = self
                    .last_failure
                    .map_or(true, |at| now.duration_since(at) > self.reset_timeout);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    Admit::Probe
                } else {
                    Admit::Reject
                }
            }
            CircuitState::HalfOpen if self.probe_in_flight => Admit::Reject,
            CircuitState::HalfOpen => {
                self.probe_in_flight = true;
                Admit::Probe
            }
        }
    }

    /// Returns true if this closed the circuit.
    pub(crate) fn on_success(&mut self, probe: bool) -> bool {
        if probe && self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
            self.consecutive_failures = 0;
            self.probe_in_flight = false;
            return true;
        }
        false
    }

    /// Returns true if this opened the circuit.
    pub(crate) fn on_failure(&mut self, probe: bool, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        if probe && self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Open;
            self.probe_in_flight = false;
            return true;
        }
        if self.state == CircuitState::Closed
            && self.consecutive_failures >= self.failure_threshold
        {
            self.state = CircuitState::Open;
            return true;
        }
        false
    }

    /// The operation succeeded outside the breaker, right after a successful recovery.
    /// Closes an open or half-open circuit; a closed one is left as it is.
    /// Returns true if this closed the circuit.
    pub(crate) fn on_recovered(&mut self) -> bool {
        if self.state == CircuitState::Closed {
            return false;
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.probe_in_flight = false;
        true
    }

    /// A probe that ended without an outcome (its caller went away) frees the slot for the
    /// next caller.
    pub(crate) fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.last_failure = None;
        self.probe_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESET: Duration = Duration::from_secs(60);

    fn opened(now: Instant) -> CircuitBreaker {
        let mut breaker = CircuitBreaker::new(2, RESET);
        assert_eq!(breaker.try_acquire(now), Admit::Pass);
        assert!(!breaker.on_failure(false, now));
        assert!(breaker.on_failure(false, now));
        breaker
    }

    #[test]
    fn opens_at_the_threshold() {
        let now = Instant::now();
        let mut breaker = opened(now);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.consecutive_failures(), 2);
        assert_eq!(breaker.try_acquire(now + RESET), Admit::Reject);
    }

    #[test]
    fn success_while_closed_keeps_the_count() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(3, RESET);
        breaker.on_failure(false, now);
        assert!(!breaker.on_success(false));
        assert_eq!(breaker.consecutive_failures(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn single_probe_after_cooling_down() {
        let now = Instant::now();
        let mut breaker = opened(now);
        let later = now + RESET + Duration::from_millis(1);
        assert_eq!(breaker.try_acquire(later), Admit::Probe);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.try_acquire(later), Admit::Reject);
        assert!(breaker.on_success(true));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.try_acquire(later), Admit::Pass);
    }

    #[test]
    fn failed_probe_reopens_with_fresh_timestamp() {
        let now = Instant::now();
        let mut breaker = opened(now);
        let probe_at = now + RESET + Duration::from_millis(1);
        assert_eq!(breaker.try_acquire(probe_at), Admit::Probe);
        assert!(breaker.on_failure(true, probe_at));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.try_acquire(probe_at + RESET), Admit::Reject);
        assert_eq!(breaker.try_acquire(probe_at + RESET + Duration::from_millis(1)), Admit::Probe);
    }

    #[test]
    fn abandoned_probe_frees_the_slot() {
        let now = Instant::now();
        let mut breaker = opened(now);
        let later = now + RESET * 2;
        assert_eq!(breaker.try_acquire(later), Admit::Probe);
        breaker.release_probe();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.try_acquire(later), Admit::Probe);
    }

    #[test]
    fn recovered_success_closes_an_open_circuit() {
        let now = Instant::now();
        let mut breaker = opened(now);
        assert!(breaker.on_recovered());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.try_acquire(now), Admit::Pass);

        let mut closed = CircuitBreaker::new(3, RESET);
        closed.on_failure(false, now);
        assert!(!closed.on_recovered());
        assert_eq!(closed.consecutive_failures(), 1);
    }

    #[test]
    fn reset_closes() {
        let now = Instant::now();
        let mut breaker = opened(now);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.try_acquire(now), Admit::Pass);
    }
}
