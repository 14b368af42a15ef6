//! The breaker state machine.
//!
//! ```text
//! Closed   --(failures reach threshold)-------------> Open
//! Open     --(recovery timeout elapsed, call admitted)-> HalfOpen
//! HalfOpen --(probe succeeds)-----------------------> Closed
//! HalfOpen --(probe fails)--------------------------> Open (timer restarts)
//! ```
//!
//! [`StateMachine`] is a plain value with `&mut self` methods. Sharing it
//! between threads is the owner's job; [`InstrumentedExecutor`] keeps it
//! behind a single lock so that the check-and-transition in
//! [`StateMachine::acquire`] is atomic.
//!
//! [`InstrumentedExecutor`]: crate::InstrumentedExecutor
use crate::clock::{Clock, TokioClock};
use std::fmt;
use tokio::time::{Duration, Instant};

/// The externally visible state of a breaker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BreakerState {
    /// Calls pass through and their outcomes are counted.
    Closed = 0,
    /// Calls are rejected without being attempted.
    Open = 1,
    /// A single probe call is testing whether the dependency recovered.
    HalfOpen = 2,
}

/// Why a call was let through.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Permit {
    /// The breaker was closed.
    Closed,
    /// The call is the half-open probe; its outcome decides the next state.
    Probe,
}

pub struct StateMachine<C = TokioClock> {
    clock: C,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: State,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { probe_in_flight: bool },
}

// === impl BreakerState ===

impl BreakerState {
    /// The value exported on the state gauge (0 = closed, 1 = open,
    /// 2 = half-open).
    #[inline]
    pub fn as_gauge(self) -> f64 {
        self as u8 as f64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl StateMachine ===

impl<C: Clock> StateMachine<C> {
    /// Returns a new, closed state machine.
    ///
    /// # Panics
    ///
    /// If `failure_threshold` is 0 or `recovery_timeout` is zero.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, clock: C) -> Self {
        assert!(failure_threshold > 0, "failure threshold must be at least 1");
        assert!(
            !recovery_timeout.is_zero(),
            "recovery timeout must be greater than zero"
        );
        StateMachine {
            clock,
            failure_threshold,
            recovery_timeout,
            state: State::Closed {
                consecutive_failures: 0,
            },
        }
    }

    /// Returns whether a call may proceed right now.
    ///
    /// When the recovery timeout has elapsed this moves an open breaker to
    /// half-open, and the caller becomes the probe.
    pub fn admit(&mut self) -> bool {
        self.acquire().is_some()
    }

    /// Like [`admit`](Self::admit), but tells the caller whether it is the
    /// half-open probe.
    pub fn acquire(&mut self) -> Option<Permit> {
        match self.state {
            State::Closed { .. } => Some(Permit::Closed),
            State::Open { opened_at } => {
                let waited = self.clock.now().saturating_duration_since(opened_at);
                if waited < self.recovery_timeout {
                    return None;
                }
                self.transition(State::HalfOpen {
                    probe_in_flight: true,
                });
                Some(Permit::Probe)
            }
            State::HalfOpen {
                ref mut probe_in_flight,
            } => {
                if *probe_in_flight {
                    return None;
                }
                *probe_in_flight = true;
                tracing::trace!("admitting replacement half-open probe");
                Some(Permit::Probe)
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            State::Closed {
                ref mut consecutive_failures,
            } => *consecutive_failures = 0,
            State::HalfOpen { .. } => self.transition(State::Closed {
                consecutive_failures: 0,
            }),
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&mut self) {
        match self.state {
            State::Closed {
                ref mut consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.failure_threshold {
                    tracing::trace!(
                        failures = *consecutive_failures,
                        threshold = self.failure_threshold,
                        "failure threshold reached"
                    );
                    self.open();
                }
            }
            State::HalfOpen { .. } => self.open(),
            State::Open { .. } => {}
        }
    }

    /// Gives up the half-open probe slot without deciding anything, so the
    /// next call becomes the probe instead.
    ///
    /// Has no effect unless a probe is in flight.
    pub fn release_probe(&mut self) {
        if let State::HalfOpen {
            ref mut probe_in_flight,
        } = self.state
        {
            *probe_in_flight = false;
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Consecutive failures seen while closed; 0 in any other state.
    pub fn consecutive_failures(&self) -> u32 {
        match self.state {
            State::Closed {
                consecutive_failures,
            } => consecutive_failures,
            _ => 0,
        }
    }

    /// When the breaker last opened, if it is open.
    pub fn opened_at(&self) -> Option<Instant> {
        match self.state {
            State::Open { opened_at } => Some(opened_at),
            _ => None,
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    fn open(&mut self) {
        let opened_at = self.clock.now();
        self.transition(State::Open { opened_at });
    }

    fn transition(&mut self, to: State) {
        let from = self.state();
        self.state = to;
        let to = self.state();
        match to {
            BreakerState::Open => tracing::warn!(
                %from,
                %to,
                recovery_timeout = ?self.recovery_timeout,
                "circuit breaker opened"
            ),
            _ => tracing::info!(%from, %to, "circuit breaker state changed"),
        }
    }
}

impl<C> fmt::Debug for StateMachine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state)
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_timeout", &self.recovery_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn machine(threshold: u32) -> (StateMachine<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        (StateMachine::new(threshold, TIMEOUT, clock.clone()), clock)
    }

    #[test]
    fn starts_closed() {
        let (mut sm, _) = machine(3);
        assert_eq!(sm.state(), BreakerState::Closed);
        assert_eq!(sm.consecutive_failures(), 0);
        assert_eq!(sm.opened_at(), None);
        assert_eq!(sm.acquire(), Some(Permit::Closed));
    }

    #[test]
    fn opens_exactly_at_threshold() {
        let (mut sm, clock) = machine(3);
        for expected in 1..3 {
            assert!(sm.admit());
            sm.record_failure();
            assert_eq!(sm.state(), BreakerState::Closed);
            assert_eq!(sm.consecutive_failures(), expected);
        }

        assert!(sm.admit());
        sm.record_failure();
        assert_eq!(sm.state(), BreakerState::Open);
        assert_eq!(sm.opened_at(), Some(clock.now()));
        assert_eq!(sm.consecutive_failures(), 0);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let (mut sm, _) = machine(3);
        sm.record_failure();
        sm.record_failure();
        sm.record_success();
        assert_eq!(sm.consecutive_failures(), 0);

        sm.record_failure();
        sm.record_failure();
        assert_eq!(sm.state(), BreakerState::Closed);
    }

    #[test]
    fn rejects_until_timeout_elapses() {
        let (mut sm, clock) = machine(1);
        sm.record_failure();

        for _ in 0..4 {
            clock.advance(Duration::from_secs(1));
            assert!(!sm.admit());
            assert_eq!(sm.state(), BreakerState::Open);
        }

        clock.advance(Duration::from_millis(999));
        assert!(!sm.admit());

        clock.advance(Duration::from_millis(1));
        assert_eq!(sm.acquire(), Some(Permit::Probe));
        assert_eq!(sm.state(), BreakerState::HalfOpen);
        assert_eq!(sm.opened_at(), None);
    }

    #[test]
    fn only_one_probe_at_a_time() {
        let (mut sm, clock) = machine(1);
        sm.record_failure();
        clock.advance(TIMEOUT);

        assert!(sm.admit());
        assert!(!sm.admit());
        assert!(!sm.admit());
        assert_eq!(sm.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn successful_probe_closes() {
        let (mut sm, clock) = machine(2);
        sm.record_failure();
        sm.record_failure();
        clock.advance(TIMEOUT);

        assert!(sm.admit());
        sm.record_success();
        assert_eq!(sm.state(), BreakerState::Closed);
        assert_eq!(sm.consecutive_failures(), 0);
        assert!(sm.admit());
    }

    #[test]
    fn failed_probe_reopens_with_fresh_timer() {
        let (mut sm, clock) = machine(1);
        sm.record_failure();
        let first_opened = sm.opened_at().unwrap();

        clock.advance(TIMEOUT + Duration::from_secs(2));
        assert!(sm.admit());
        sm.record_failure();

        assert_eq!(sm.state(), BreakerState::Open);
        let reopened = sm.opened_at().unwrap();
        assert_eq!(reopened, clock.now());
        assert!(reopened > first_opened);

        // the timeout counts from the reopen, not the first trip.
        clock.advance(TIMEOUT - Duration::from_millis(1));
        assert!(!sm.admit());
        clock.advance(Duration::from_millis(1));
        assert!(sm.admit());
    }

    #[test]
    fn released_probe_lets_next_call_probe() {
        let (mut sm, clock) = machine(1);
        sm.record_failure();
        clock.advance(TIMEOUT);

        assert_eq!(sm.acquire(), Some(Permit::Probe));
        sm.release_probe();
        assert_eq!(sm.state(), BreakerState::HalfOpen);
        assert_eq!(sm.acquire(), Some(Permit::Probe));
        assert_eq!(sm.acquire(), None);
    }

    #[test]
    fn reports_while_open_are_ignored() {
        let (mut sm, clock) = machine(1);
        sm.record_failure();
        let opened_at = sm.opened_at();

        clock.advance(Duration::from_secs(1));
        sm.record_failure();
        sm.record_success();
        sm.release_probe();
        assert_eq!(sm.state(), BreakerState::Open);
        assert_eq!(sm.opened_at(), opened_at);
    }

    #[test]
    fn gauge_encoding() {
        assert_eq!(BreakerState::Closed.as_gauge(), 0.0);
        assert_eq!(BreakerState::Open.as_gauge(), 1.0);
        assert_eq!(BreakerState::HalfOpen.as_gauge(), 2.0);
        assert_eq!(BreakerState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    #[should_panic]
    fn zero_threshold_panics() {
        let _ = StateMachine::new(0, TIMEOUT, ManualClock::new());
    }
}
