//! Where a breaker reports what it is doing.
//!
//! [`InstrumentedExecutor`](crate::InstrumentedExecutor) only talks to the
//! [`MetricsSink`] trait. [`PrometheusSink`] forwards to the [`metrics`]
//! facade (and from there to whatever recorder is installed, normally the
//! Prometheus exporter from [`install_exporter`]); [`InMemorySink`] keeps the
//! latest values in memory so they can be inspected directly.
//!
//! [`metrics`]: https://docs.rs/metrics
use crate::state::BreakerState;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};
use tokio::time::Duration;

/// Receives the measurements taken around every call.
///
/// Implementations are shared between every caller of a breaker and must
/// tolerate concurrent use.
pub trait MetricsSink {
    /// Sets the state gauge.
    fn set_state(&self, state: BreakerState);

    /// Records how long one call took, rejected calls included.
    fn observe_call_duration(&self, elapsed: Duration);

    /// Sets the rolling failure-rate gauge.
    fn set_failure_rate(&self, rate: f64);

    /// Counts a call the breaker refused.
    fn increment_not_permitted(&self);

    /// Counts a finished call by outcome (see [`Outcome::as_str`]).
    ///
    /// [`Outcome::as_str`]: crate::Outcome::as_str
    fn increment_calls(&self, outcome: &'static str);
}

/// A [`MetricsSink`] that remembers the latest values.
///
/// Durations and outcomes are aggregated into counts and totals, so memory
/// use stays constant however many calls are recorded.
#[derive(Debug, Default)]
pub struct InMemorySink {
    state: AtomicU8,
    failure_rate: AtomicU64,
    not_permitted: AtomicU64,
    durations: Mutex<DurationTotals>,
    calls: Mutex<HashMap<&'static str, u64>>,
}

#[derive(Debug, Default)]
struct DurationTotals {
    count: u64,
    sum: Duration,
}

// === impl InMemorySink ===

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn failure_rate(&self) -> f64 {
        f64::from_bits(self.failure_rate.load(Ordering::Acquire))
    }

    pub fn not_permitted(&self) -> u64 {
        self.not_permitted.load(Ordering::Acquire)
    }

    /// How many call durations have been observed.
    pub fn timed_calls(&self) -> u64 {
        self.durations.lock().count
    }

    /// The sum of every observed call duration.
    pub fn total_duration(&self) -> Duration {
        self.durations.lock().sum
    }

    /// How many finished calls were counted with the given outcome label.
    pub fn calls(&self, outcome: &str) -> u64 {
        self.calls.lock().get(outcome).copied().unwrap_or(0)
    }
}

impl MetricsSink for InMemorySink {
    fn set_state(&self, state: BreakerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn observe_call_duration(&self, elapsed: Duration) {
        let mut totals = self.durations.lock();
        totals.count += 1;
        totals.sum = totals.sum.saturating_add(elapsed);
    }

    fn set_failure_rate(&self, rate: f64) {
        self.failure_rate.store(rate.to_bits(), Ordering::Release);
    }

    fn increment_not_permitted(&self) {
        self.not_permitted.fetch_add(1, Ordering::AcqRel);
    }

    fn increment_calls(&self, outcome: &'static str) {
        *self.calls.lock().entry(outcome).or_default() += 1;
    }
}

impl<M: MetricsSink + ?Sized> MetricsSink for Arc<M> {
    fn set_state(&self, state: BreakerState) {
        (**self).set_state(state)
    }

    fn observe_call_duration(&self, elapsed: Duration) {
        (**self).observe_call_duration(elapsed)
    }

    fn set_failure_rate(&self, rate: f64) {
        (**self).set_failure_rate(rate)
    }

    fn increment_not_permitted(&self) {
        (**self).increment_not_permitted()
    }

    fn increment_calls(&self, outcome: &'static str) {
        (**self).increment_calls(outcome)
    }
}

mod prometheus;
pub use prometheus::{install_exporter, PrometheusSink, CALL_DURATION_BUCKETS};
