use super::MetricsSink;
use crate::state::BreakerState;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use std::{net::SocketAddr, sync::Arc};
use tokio::time::Duration;

/// Histogram buckets for `circuitbreaker_calls_seconds`, in seconds.
pub const CALL_DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// A [`MetricsSink`] that records through the [`metrics`] facade.
///
/// Exposes:
///
/// - `circuitbreaker_state` (gauge): 0 = closed, 1 = open, 2 = half-open
/// - `circuitbreaker_calls_seconds` (histogram): call durations
/// - `circuitbreaker_failure_rate` (gauge): failure rate over the rolling window
/// - `circuitbreaker_not_permitted_calls_total` (counter): rejected calls
/// - `circuitbreaker_calls_total{outcome}` (counter): finished calls
///
/// With a namespace, every name gets a `<namespace>_` prefix.
///
/// Nothing is recorded unless a recorder is installed, e.g. with
/// [`install_exporter`].
///
/// [`metrics`]: https://docs.rs/metrics
#[derive(Clone, Debug)]
pub struct PrometheusSink {
    names: Arc<Names>,
}

#[derive(Debug)]
struct Names {
    state: String,
    calls_seconds: String,
    failure_rate: String,
    not_permitted: String,
    calls_total: String,
}

/// Installs a global Prometheus recorder serving `/metrics` on `addr`.
///
/// The call-duration histogram for `namespace` gets
/// [`CALL_DURATION_BUCKETS`]; every other histogram is rendered as a summary.
/// Must be called at most once per process.
pub fn install_exporter(addr: SocketAddr, namespace: Option<&str>) -> Result<(), BuildError> {
    let names = Names::new(namespace);
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Full(names.calls_seconds), CALL_DURATION_BUCKETS)?
        .install()?;
    tracing::info!(%addr, "Prometheus metrics endpoint listening");
    Ok(())
}

// === impl PrometheusSink ===

impl PrometheusSink {
    pub fn new() -> Self {
        Self::with_namespace(None)
    }

    pub fn with_namespace(namespace: Option<&str>) -> Self {
        let names = Names::new(namespace);
        names.describe();
        PrometheusSink {
            names: Arc::new(names),
        }
    }
}

impl Default for PrometheusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PrometheusSink {
    fn set_state(&self, state: BreakerState) {
        gauge!(self.names.state.clone()).set(state.as_gauge());
    }

    fn observe_call_duration(&self, elapsed: Duration) {
        histogram!(self.names.calls_seconds.clone()).record(elapsed.as_secs_f64());
    }

    fn set_failure_rate(&self, rate: f64) {
        gauge!(self.names.failure_rate.clone()).set(rate);
    }

    fn increment_not_permitted(&self) {
        counter!(self.names.not_permitted.clone()).increment(1);
    }

    fn increment_calls(&self, outcome: &'static str) {
        counter!(self.names.calls_total.clone(), "outcome" => outcome).increment(1);
    }
}

// === impl Names ===

impl Names {
    fn new(namespace: Option<&str>) -> Self {
        let name = |suffix: &str| match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => format!("{ns}_circuitbreaker_{suffix}"),
            None => format!("circuitbreaker_{suffix}"),
        };
        Names {
            state: name("state"),
            calls_seconds: name("calls_seconds"),
            failure_rate: name("failure_rate"),
            not_permitted: name("not_permitted_calls_total"),
            calls_total: name("calls_total"),
        }
    }

    fn describe(&self) {
        describe_gauge!(
            self.state.clone(),
            "The state of the circuit breaker (0=closed, 1=open, 2=half_open)"
        );
        describe_histogram!(
            self.calls_seconds.clone(),
            Unit::Seconds,
            "Circuit breaker call durations"
        );
        describe_gauge!(
            self.failure_rate.clone(),
            "Failure rate of the circuit breaker over a rolling window"
        );
        describe_counter!(
            self.not_permitted.clone(),
            "Total number of calls which have not been permitted"
        );
        describe_counter!(
            self.calls_total.clone(),
            "Total number of calls by outcome"
        );
    }
}
