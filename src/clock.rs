use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// A source of the current time.
///
/// The breaker never reads the system clock directly; it asks its `Clock`.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The default [`Clock`], backed by [`tokio::time::Instant::now`].
///
/// Under a paused Tokio runtime (`tokio::time::pause`) this clock follows the
/// runtime's virtual time.
#[derive(Copy, Clone, Debug, Default)]
pub struct TokioClock;

/// A [`Clock`] that only moves when told to.
///
/// Clones share the same underlying time, so a test can keep one handle and
/// hand another to the breaker.
#[derive(Clone, Debug)]
pub struct ManualClock(Arc<Mutex<Instant>>);

// === impl TokioClock ===

impl Clock for TokioClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// === impl ManualClock ===

impl ManualClock {
    /// Returns a new `ManualClock` frozen at the current instant.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        ManualClock(Arc::new(Mutex::new(start)))
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.0.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.0.lock()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}
