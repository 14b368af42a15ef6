use crate::{
    clock::{Clock, TokioClock},
    error::{BreakerError, Classify},
    executor::InstrumentedExecutor,
    sink::{MetricsSink, PrometheusSink},
    state::Permit,
};
use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};
use tokio::time::Instant;
use tower_service::Service;

/// A `tower` middleware that runs every request through an
/// [`InstrumentedExecutor`].
///
/// Clones share the same executor, and therefore the same breaker.
pub struct CircuitBreaker<S, C = TokioClock, M = PrometheusSink> {
    inner: S,
    executor: Arc<InstrumentedExecutor<C, M>>,
}

pin_project_lite::pin_project! {
    pub struct ResponseFuture<F, C, M>
    where
        C: Clock,
        C: Clone,
        M: MetricsSink,
    {
        // `None` if the request was rejected.
        #[pin]
        future: Option<F>,
        // `None` once the call has been reported.
        permit: Option<Permit>,
        started: Instant,
        executor: Arc<InstrumentedExecutor<C, M>>,
    }

    impl<F, C, M> PinnedDrop for ResponseFuture<F, C, M>
    where
        C: Clock,
        C: Clone,
        M: MetricsSink,
    {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(permit) = this.permit.take() {
                this.executor.abandon(permit, std::thread::panicking());
                this.executor.observe_duration(*this.started);
            }
        }
    }
}

// === impl CircuitBreaker ===

impl<S, C, M> CircuitBreaker<S, C, M> {
    pub fn new(executor: Arc<InstrumentedExecutor<C, M>>, inner: S) -> Self {
        CircuitBreaker { inner, executor }
    }

    pub fn executor(&self) -> &Arc<InstrumentedExecutor<C, M>> {
        &self.executor
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Clone, C, M> Clone for CircuitBreaker<S, C, M> {
    fn clone(&self) -> Self {
        CircuitBreaker {
            inner: self.inner.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<S, C, M, Req> Service<Req> for CircuitBreaker<S, C, M>
where
    S: Service<Req>,
    S::Error: Classify,
    C: Clock + Clone,
    M: MetricsSink,
{
    type Response = S::Response;
    type Error = BreakerError<S::Error>;
    type Future = ResponseFuture<S::Future, C, M>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(BreakerError::Failed)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let started = self.executor.clock().now();
        let permit = self.executor.acquire();
        let future = match permit {
            Some(permit) => {
                let inner = &mut self.inner;
                match panic::catch_unwind(AssertUnwindSafe(|| inner.call(req))) {
                    Ok(future) => Some(future),
                    Err(panic) => {
                        self.executor.abandon(permit, true);
                        self.executor.observe_duration(started);
                        panic::resume_unwind(panic)
                    }
                }
            }
            None => {
                // a rejection is final as soon as it is decided.
                self.executor.observe_duration(started);
                None
            }
        };
        ResponseFuture {
            future,
            permit,
            started,
            executor: self.executor.clone(),
        }
    }
}

// === impl ResponseFuture ===

impl<F, C, M, T, E> Future for ResponseFuture<F, C, M>
where
    F: Future<Output = Result<T, E>>,
    E: Classify,
    C: Clock + Clone,
    M: MetricsSink,
{
    type Output = Result<T, BreakerError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let (future, permit) = match (this.future.as_pin_mut(), *this.permit) {
            (Some(future), Some(permit)) => (future, permit),
            _ => return Poll::Ready(Err(BreakerError::Rejected)),
        };

        let result = match panic::catch_unwind(AssertUnwindSafe(|| future.poll(cx))) {
            Ok(poll) => ready!(poll),
            Err(panic) => {
                *this.permit = None;
                this.executor.abandon(permit, true);
                this.executor.observe_duration(*this.started);
                panic::resume_unwind(panic)
            }
        };
        *this.permit = None;
        let outcome = this.executor.complete(permit, result);
        this.executor.observe_duration(*this.started);
        Poll::Ready(outcome.into_result())
    }
}
