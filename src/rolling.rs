/// A fixed-size window over the most recent call outcomes.
///
/// Once `capacity` outcomes have been recorded, each new outcome evicts the
/// oldest one. The failure rate is recomputed on every insertion, so reading
/// it is free.
#[derive(Debug)]
pub struct RollingFailureTracker {
    /// `true` marks a failure.
    outcomes: Box<[bool]>,
    /// Index of the slot the next outcome is written to.
    next: usize,
    len: usize,
    failures: usize,
    rate: f64,
}

impl RollingFailureTracker {
    /// Returns a new tracker remembering the last `capacity` outcomes.
    ///
    /// All `capacity` slots are allocated here; configuration loaded from
    /// files is capped at [`Config::MAX_WINDOW_SIZE`].
    ///
    /// [`Config::MAX_WINDOW_SIZE`]: crate::Config::MAX_WINDOW_SIZE
    ///
    /// # Panics
    ///
    /// If `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "rolling window capacity must be at least 1");
        RollingFailureTracker {
            outcomes: vec![false; capacity].into_boxed_slice(),
            next: 0,
            len: 0,
            failures: 0,
            rate: 0.0,
        }
    }

    pub fn record_outcome(&mut self, success: bool) {
        let failed = !success;

        if self.len == self.capacity() {
            // the slot we are about to overwrite holds the oldest outcome.
            if self.outcomes[self.next] {
                self.failures -= 1;
            }
        } else {
            self.len += 1;
        }

        self.outcomes[self.next] = failed;
        if failed {
            self.failures += 1;
        }
        self.next = (self.next + 1) % self.capacity();

        self.rate = self.failures as f64 / self.len as f64;
    }

    /// The fraction of failures in the window, or `0.0` if nothing has been
    /// recorded yet.
    #[inline]
    pub fn failure_rate(&self) -> f64 {
        self.rate
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.outcomes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_reports_zero() {
        let tracker = RollingFailureTracker::new(10);
        assert!(tracker.is_empty());
        assert_eq!(tracker.failure_rate(), 0.0);
    }

    #[test]
    fn rate_over_partial_window() {
        let mut tracker = RollingFailureTracker::new(10);
        tracker.record_outcome(false);
        assert_eq!(tracker.failure_rate(), 1.0);

        tracker.record_outcome(true);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.failure_rate(), 0.5);
    }

    #[test]
    fn oldest_outcome_is_evicted() {
        let mut tracker = RollingFailureTracker::new(10);
        for _ in 0..3 {
            tracker.record_outcome(false);
        }
        for _ in 0..7 {
            tracker.record_outcome(true);
        }
        assert_eq!(tracker.len(), 10);
        assert_eq!(tracker.failure_rate(), 0.3);

        // pushes out the first failure
        tracker.record_outcome(true);
        assert_eq!(tracker.len(), 10);
        assert_eq!(tracker.failure_rate(), 0.2);
    }

    #[test]
    fn wraps_around_many_times() {
        let mut tracker = RollingFailureTracker::new(3);
        for i in 0..100 {
            tracker.record_outcome(i % 2 == 0);
        }
        // last three: i = 97 (fail), 98 (ok), 99 (fail)
        assert_eq!(tracker.len(), 3);
        assert!((tracker.failure_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn window_of_one() {
        let mut tracker = RollingFailureTracker::new(1);
        tracker.record_outcome(false);
        assert_eq!(tracker.failure_rate(), 1.0);
        tracker.record_outcome(true);
        assert_eq!(tracker.failure_rate(), 0.0);
    }

    #[test]
    #[should_panic]
    fn zero_capacity_panics() {
        let _ = RollingFailureTracker::new(0);
    }
}
