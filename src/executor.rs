use crate::{
    clock::{Clock, TokioClock},
    config::ConfigError,
    error::{Classify, ErrorKind, Outcome},
    rolling::RollingFailureTracker,
    sink::{MetricsSink, PrometheusSink},
    state::{BreakerState, Permit, StateMachine},
    Config,
};
use parking_lot::Mutex;
use std::{fmt, future::Future};
use tokio::time::Instant;

/// Runs calls through a circuit breaker and records what happened.
///
/// One executor is meant to be shared (typically in an `Arc`) by every caller
/// of the dependency it protects. The breaker state and the rolling failure
/// window live behind a single lock, which is held only while deciding on
/// admission and while recording an outcome, never while the call runs.
pub struct InstrumentedExecutor<C = TokioClock, M = PrometheusSink> {
    config: Config,
    clock: C,
    sink: M,
    inner: Mutex<Inner<C>>,
}

#[derive(Debug)]
struct Inner<C> {
    breaker: StateMachine<C>,
    window: RollingFailureTracker,
}

/// Times one call and settles it if it never reports a result.
struct CallScope<'a, C, M>
where
    C: Clock + Clone,
    M: MetricsSink,
{
    executor: &'a InstrumentedExecutor<C, M>,
    started: Instant,
    /// The permit of an admitted call that has not reported yet.
    in_flight: Option<Permit>,
}

// === impl InstrumentedExecutor ===

impl InstrumentedExecutor {
    /// Returns an executor using the Tokio clock that reports through the
    /// [`metrics`] facade.
    ///
    /// [`metrics`]: https://docs.rs/metrics
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        Self::from_parts(config, TokioClock, PrometheusSink::new())
    }
}

impl<C, M> InstrumentedExecutor<C, M>
where
    C: Clock + Clone,
    M: MetricsSink,
{
    pub fn from_parts(config: Config, clock: C, sink: M) -> Result<Self, ConfigError> {
        config.validate().map_err(ConfigError::Validation)?;

        let breaker = StateMachine::new(
            config.failure_threshold,
            config.recovery_timeout,
            clock.clone(),
        );
        let window = RollingFailureTracker::new(config.window_size);
        sink.set_state(breaker.state());

        Ok(InstrumentedExecutor {
            config,
            clock,
            sink,
            inner: Mutex::new(Inner { breaker, window }),
        })
    }

    /// Runs `work` if the breaker admits it.
    ///
    /// `work` is never invoked when the call is rejected. Its error, if any,
    /// is classified and handed back inside the returned [`Outcome`]. If
    /// `work` panics, the call is recorded as a failure of kind
    /// [`ErrorKind::Other`] before the panic continues to the caller.
    pub fn execute<T, E, F>(&self, work: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: Classify,
    {
        let mut scope = CallScope::start(self);
        let permit = match scope.admit() {
            Some(permit) => permit,
            None => return Outcome::Rejected,
        };
        let result = work();
        scope.settle();
        self.complete(permit, result)
    }

    /// Runs the future returned by `work` if the breaker admits the call.
    ///
    /// Like [`execute`](Self::execute), but for asynchronous work. If the
    /// returned future is dropped while the call is in flight, no outcome is
    /// recorded; a half-open breaker gives the trial slot to the next call.
    pub async fn call<T, E, F, Fut>(&self, work: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let mut scope = CallScope::start(self);
        let permit = match scope.admit() {
            Some(permit) => permit,
            None => return Outcome::Rejected,
        };
        let result = work().await;
        scope.settle();
        self.complete(permit, result)
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().breaker.state()
    }

    pub fn failure_rate(&self) -> f64 {
        self.inner.lock().window.failure_rate()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().breaker.consecutive_failures()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sink(&self) -> &M {
        &self.sink
    }

    pub(crate) fn clock(&self) -> &C {
        &self.clock
    }

    /// Asks the breaker for a permit, recording the rejection if there is
    /// none.
    pub(crate) fn acquire(&self) -> Option<Permit> {
        let mut inner = self.inner.lock();
        let permit = inner.breaker.acquire();
        let state = inner.breaker.state();
        match permit {
            Some(Permit::Probe) => {
                tracing::debug!("admitting half-open probe");
                self.sink.set_state(state);
            }
            Some(Permit::Closed) => {}
            None => {
                tracing::debug!(%state, "call not permitted by circuit breaker");
                self.sink.increment_not_permitted();
                self.sink.increment_calls("rejected");
                self.sink.set_state(state);
            }
        }
        permit
    }

    /// Classifies the result of an admitted call and reports it to the
    /// breaker, the rolling window and the sink.
    ///
    /// The sink is written while the lock is held, so the exported gauges
    /// always match the last recorded outcome.
    pub(crate) fn complete<T, E: Classify>(
        &self,
        permit: Permit,
        result: Result<T, E>,
    ) -> Outcome<T, E> {
        let outcome = match result {
            Ok(value) => Outcome::Success(value),
            Err(error) if self.config.counts(error.kind()) => Outcome::CountedFailure(error),
            Err(error) => Outcome::UncountedFailure(error),
        };

        if let Outcome::CountedFailure(ref error) | Outcome::UncountedFailure(ref error) = outcome
        {
            tracing::debug!(
                kind = %error.kind(),
                counted = matches!(outcome, Outcome::CountedFailure(_)),
                ?permit,
                "call failed"
            );
        }

        let mut inner = self.inner.lock();
        match outcome {
            Outcome::Success(_) => {
                inner.breaker.record_success();
                inner.window.record_outcome(true);
            }
            Outcome::CountedFailure(_) => {
                inner.breaker.record_failure();
                inner.window.record_outcome(false);
            }
            Outcome::UncountedFailure(_) => {
                if permit == Permit::Probe {
                    inner.breaker.release_probe();
                }
                inner.window.record_outcome(false);
            }
            Outcome::Rejected => {}
        }
        self.publish(&inner, outcome.as_str());
        outcome
    }

    /// Settles an admitted call that never produced a result.
    ///
    /// A panic is a failure of kind [`ErrorKind::Other`]. A call that was
    /// only dropped records nothing, but gives up the half-open trial slot.
    pub(crate) fn abandon(&self, permit: Permit, panicked: bool) {
        let mut inner = self.inner.lock();
        if !panicked {
            tracing::debug!(?permit, "call dropped before completing");
            if permit == Permit::Probe {
                inner.breaker.release_probe();
                self.sink.set_state(inner.breaker.state());
            }
            return;
        }

        let counted = self.config.counts(ErrorKind::Other);
        tracing::warn!(?permit, counted, "call panicked; recording it as a failure");
        if counted {
            inner.breaker.record_failure();
        } else if permit == Permit::Probe {
            inner.breaker.release_probe();
        }
        inner.window.record_outcome(false);
        let outcome = if counted {
            "counted_failure"
        } else {
            "uncounted_failure"
        };
        self.publish(&inner, outcome);
    }

    pub(crate) fn observe_duration(&self, started: Instant) {
        let elapsed = self.clock.now().saturating_duration_since(started);
        self.sink.observe_call_duration(elapsed);
    }

    /// Writes the gauges and counts one finished call. Must be called with
    /// the lock held.
    fn publish(&self, inner: &Inner<C>, outcome: &'static str) {
        let state = inner.breaker.state();
        let rate = inner.window.failure_rate();
        tracing::trace!(outcome, %state, failure_rate = rate, "call finished");
        self.sink.set_failure_rate(rate);
        self.sink.set_state(state);
        self.sink.increment_calls(outcome);
    }
}

// === impl CallScope ===

impl<'a, C, M> CallScope<'a, C, M>
where
    C: Clock + Clone,
    M: MetricsSink,
{
    fn start(executor: &'a InstrumentedExecutor<C, M>) -> Self {
        CallScope {
            executor,
            started: executor.clock.now(),
            in_flight: None,
        }
    }

    fn admit(&mut self) -> Option<Permit> {
        self.in_flight = self.executor.acquire();
        self.in_flight
    }

    /// Marks the admitted call as having produced a result.
    fn settle(&mut self) {
        self.in_flight = None;
    }
}

impl<C, M> Drop for CallScope<'_, C, M>
where
    C: Clock + Clone,
    M: MetricsSink,
{
    fn drop(&mut self) {
        if let Some(permit) = self.in_flight.take() {
            self.executor.abandon(permit, std::thread::panicking());
        }
        self.executor.observe_duration(self.started);
    }
}

impl<C, M> fmt::Debug for InstrumentedExecutor<C, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InstrumentedExecutor")
            .field("config", &self.config)
            .field("breaker", &inner.breaker)
            .field("failure_rate", &inner.window.failure_rate())
            .finish_non_exhaustive()
    }
}
