//! A circuit breaker that measures itself.
//!
//! An [`InstrumentedExecutor`] runs calls to a downstream dependency. Once
//! enough consecutive calls fail it opens and rejects calls outright. After
//! a recovery timeout it lets a single probe through, and that probe decides
//! whether to close again or stay open. Each call reports its duration, the
//! breaker state, a rolling failure rate and a count of rejected calls to a
//! [`MetricsSink`].
//!
//! [`CircuitBreaker`] wraps the same machinery as a `tower` middleware.
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod rolling;
pub mod service;
pub mod sink;
pub mod state;

pub use self::{
    clock::{Clock, ManualClock, TokioClock},
    error::{BreakerError, CallError, Classify, ErrorKind, Outcome},
    executor::InstrumentedExecutor,
    rolling::RollingFailureTracker,
    service::CircuitBreaker,
    sink::{InMemorySink, MetricsSink, PrometheusSink},
    state::{BreakerState, Permit, StateMachine},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::time::Duration;

/// Configures an [`InstrumentedExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct Config {
    /// How many consecutive counted failures open a closed breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before admitting a probe.
    #[serde(rename = "recovery_timeout_ms", with = "config::millis")]
    pub recovery_timeout: Duration,
    /// How many recent outcomes the failure rate is computed over.
    pub window_size: usize,
    /// The error kinds that advance the breaker towards opening. Errors of
    /// any other kind only affect the failure rate.
    pub counted_failure_kinds: BTreeSet<ErrorKind>,
}

impl Config {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
    pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_WINDOW_SIZE: usize = 10;
    /// The largest `window_size` that passes validation. The window is
    /// allocated up front.
    pub const MAX_WINDOW_SIZE: usize = 100_000;

    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Config {
            failure_threshold,
            recovery_timeout,
            ..Config::default()
        }
    }

    pub fn with_window_size(self, window_size: usize) -> Self {
        Config {
            window_size,
            ..self
        }
    }

    pub fn with_counted_failure_kinds(self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Config {
            counted_failure_kinds: kinds.into_iter().collect(),
            ..self
        }
    }

    /// Returns `true` if errors of this kind advance the breaker.
    pub fn counts(&self, kind: ErrorKind) -> bool {
        self.counted_failure_kinds.contains(&kind)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            failure_threshold: Self::DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: Self::DEFAULT_RECOVERY_TIMEOUT,
            window_size: Self::DEFAULT_WINDOW_SIZE,
            counted_failure_kinds: [ErrorKind::Timeout, ErrorKind::BadStatus]
                .into_iter()
                .collect(),
        }
    }
}
