//! Walks a circuit breaker through a trip-and-recover cycle against a
//! simulated dependency, serving the breaker's metrics for Prometheus.
//!
//! 1. three failing calls open the breaker;
//! 2. two calls are rejected while it is open;
//! 3. after the recovery timeout one probe succeeds and closes it;
//! 4. regular calls continue until Ctrl-C.
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tokio::time::{self, Duration};
use tower_probe_breaker::{
    config::{load_settings, ConfigError, Settings},
    sink::install_exporter,
    CallError, InstrumentedExecutor, Outcome, PrometheusSink, TokioClock,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Client-side deadline for one call to the dependency.
const CALL_TIMEOUT: Duration = Duration::from_millis(500);

type Executor = InstrumentedExecutor<TokioClock, PrometheusSink>;

#[derive(Debug, Parser)]
#[command(name = "tower-probe-breaker")]
#[command(about = "Circuit breaker demo with Prometheus metrics", long_about = None)]
struct Cli {
    /// TOML settings file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the metrics endpoint address from the settings.
    #[arg(long)]
    metrics_address: Option<String>,

    /// Pause between calls, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

/// Stands in for the protected HTTP endpoint.
#[derive(Debug)]
struct SimulatedDependency {
    latency: Duration,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => load_settings(path)?,
        None => Settings::default(),
    };
    if let Some(address) = cli.metrics_address {
        settings.metrics.address = address;
        settings.validate().map_err(ConfigError::Validation)?;
    }

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let namespace = settings.metrics.namespace.as_deref();
    if settings.metrics.enabled {
        if let Some(addr) = settings.metrics.socket_addr() {
            install_exporter(addr, namespace)?;
        }
    }

    tracing::info!(
        failure_threshold = settings.breaker.failure_threshold,
        recovery_timeout = ?settings.breaker.recovery_timeout,
        window_size = settings.breaker.window_size,
        "circuit breaker demo starting"
    );

    let executor = Arc::new(InstrumentedExecutor::from_parts(
        settings.breaker.clone(),
        TokioClock,
        PrometheusSink::with_namespace(namespace),
    )?);
    let dependency = SimulatedDependency {
        latency: Duration::from_millis(20),
    };
    let interval = Duration::from_millis(cli.interval_ms);

    tokio::select! {
        _ = run(&executor, &dependency, interval) => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("exiting");
        }
    }
    Ok(())
}

async fn run(executor: &Executor, dependency: &SimulatedDependency, interval: Duration) {
    tracing::info!("phase 1: triggering failures to open the circuit");
    for _ in 0..executor.config().failure_threshold {
        attempt(executor, dependency, true).await;
        time::sleep(interval).await;
    }
    tracing::info!(state = %executor.state(), "circuit should now be open");

    tracing::info!("phase 2: calling while the circuit is open");
    for _ in 0..2 {
        attempt(executor, dependency, false).await;
        time::sleep(interval).await;
    }

    let recovery = executor.config().recovery_timeout;
    tracing::info!(?recovery, "phase 3: waiting for the recovery timeout");
    time::sleep(recovery).await;
    attempt(executor, dependency, false).await;
    tracing::info!(state = %executor.state(), "circuit should now be closed");

    tracing::info!("phase 4: back to normal operations");
    loop {
        time::sleep(interval).await;
        attempt(executor, dependency, false).await;
    }
}

async fn attempt(executor: &Executor, dependency: &SimulatedDependency, should_fail: bool) {
    tracing::debug!(state = %executor.state(), should_fail, "making a call");
    let outcome = executor
        .call(|| async {
            let status = time::timeout(CALL_TIMEOUT, dependency.get(should_fail)).await??;
            Ok::<_, CallError>(status)
        })
        .await;

    match outcome {
        Outcome::Success(status) => tracing::info!(status, "service call successful"),
        Outcome::CountedFailure(error) => {
            tracing::warn!(%error, "call failed and was recorded as a failure")
        }
        Outcome::UncountedFailure(error) => {
            tracing::warn!(%error, "call failed with an unexpected error")
        }
        Outcome::Rejected => tracing::info!("call not permitted by circuit breaker"),
    }
}

// === impl SimulatedDependency ===

impl SimulatedDependency {
    async fn get(&self, should_fail: bool) -> Result<u16, CallError> {
        time::sleep(self.latency).await;
        if should_fail {
            Err(CallError::BadStatus(500))
        } else {
            Ok(200)
        }
    }
}
