/*!
 * Simulated downstream and load driver
 *
 * `SimulatedDownstream` stands in for a rate-limited remote API: every call
 * sleeps for a jittered latency and fails with configurable probability.
 * `run_load` drives a pool with many concurrent callers and tallies how each
 * logical call ended.
 */

use breakwater_core_resilience::{
    factory_fn, ClientFactory, ErrorClass, Pool, PoolError, PoolHealth, PoolMetrics,
};
use futures::future::join_all;
use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{BreakwaterError, Result};

/// Failure returned by the simulated downstream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimError {
    /// Rate limited or briefly unavailable
    #[error("transient downstream failure: {0}")]
    Transient(String),

    /// Rejected request that will never succeed
    #[error("fatal downstream failure: {0}")]
    Fatal(String),
}

/// Classifier handed to the pool
pub fn classify_sim_error(err: &SimError) -> ErrorClass {
    match err {
        SimError::Transient(_) => ErrorClass::Retryable,
        SimError::Fatal(_) => ErrorClass::Fatal,
    }
}

/// Behaviour of the simulated downstream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownstreamProfile {
    /// Base latency of every call
    pub latency: Duration,
    /// Extra random latency, uniformly distributed in `0..=jitter`
    pub jitter: Duration,
    /// Probability that a call fails
    pub failure_rate: f64,
    /// Share of failures that are fatal rather than transient
    pub fatal_rate: f64,
}

impl Default for DownstreamProfile {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(20),
            jitter: Duration::from_millis(10),
            failure_rate: 0.1,
            fatal_rate: 0.0,
        }
    }
}

/// Shared state of one simulated remote service
#[derive(Debug)]
pub struct SimulatedDownstream {
    profile: DownstreamProfile,
    calls: AtomicU64,
    failures: AtomicU64,
    clients_created: AtomicU64,
}

impl SimulatedDownstream {
    pub fn new(profile: DownstreamProfile) -> Arc<Self> {
        Arc::new(Self {
            profile,
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            clients_created: AtomicU64::new(0),
        })
    }

    pub fn profile(&self) -> &DownstreamProfile {
        &self.profile
    }

    /// Calls that reached the downstream
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Calls that reached the downstream and failed
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn clients_created(&self) -> u64 {
        self.clients_created.load(Ordering::Relaxed)
    }

    /// Client factory connecting to this downstream
    pub fn factory(self: &Arc<Self>) -> Arc<dyn ClientFactory<SimulatedClient, SimError>> {
        let downstream = Arc::clone(self);
        factory_fn(move || {
            let downstream = Arc::clone(&downstream);
            async move {
                let id = downstream.clients_created.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(client = id, "Simulated client connected");
                Ok(SimulatedClient { id, downstream })
            }
        })
    }
}

/// One connection to the simulated downstream
#[derive(Debug)]
pub struct SimulatedClient {
    id: u64,
    downstream: Arc<SimulatedDownstream>,
}

impl SimulatedClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Issue one request; echoes `request` back on success
    pub async fn call(&mut self, request: u64) -> std::result::Result<u64, SimError> {
        let profile = self.downstream.profile;
        self.downstream.calls.fetch_add(1, Ordering::Relaxed);

        let (roll, fatal_roll, jitter_ms) = {
            let mut rng = rand::rng();
            let jitter_ms = profile.jitter.as_millis() as u64;
            (
                rng.random::<f64>(),
                rng.random::<f64>(),
                if jitter_ms > 0 {
                    rng.random_range(0..=jitter_ms)
                } else {
                    0
                },
            )
        };

        tokio::time::sleep(profile.latency + Duration::from_millis(jitter_ms)).await;

        if roll < profile.failure_rate {
            self.downstream.failures.fetch_add(1, Ordering::Relaxed);
            if fatal_roll < profile.fatal_rate {
                return Err(SimError::Fatal(format!("request {} rejected", request)));
            }
            return Err(SimError::Transient(format!(
                "client {} throttled on request {}",
                self.id, request
            )));
        }
        Ok(request)
    }
}

/// How much load to generate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPlan {
    /// Total logical calls
    pub calls: usize,
    /// Concurrent callers
    pub concurrency: usize,
    /// Deadline for each downstream attempt
    pub deadline: Duration,
}

impl Default for LoadPlan {
    fn default() -> Self {
        Self {
            calls: 200,
            concurrency: 16,
            deadline: Duration::from_secs(2),
        }
    }
}

/// How each logical call ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeTally {
    pub succeeded: u64,
    pub circuit_open: u64,
    pub acquire_timeout: u64,
    pub deadline_exceeded: u64,
    pub downstream_retryable: u64,
    pub downstream_fatal: u64,
    pub other: u64,
}

impl OutcomeTally {
    pub fn record<T>(&mut self, outcome: &std::result::Result<T, PoolError<SimError>>) {
        match outcome {
            Ok(_) => self.succeeded += 1,
            Err(PoolError::CircuitOpen) => self.circuit_open += 1,
            Err(PoolError::AcquireTimeout(_)) => self.acquire_timeout += 1,
            Err(PoolError::DeadlineExceeded { .. }) => self.deadline_exceeded += 1,
            Err(PoolError::Downstream {
                class: ErrorClass::Retryable,
                ..
            }) => self.downstream_retryable += 1,
            Err(PoolError::Downstream {
                class: ErrorClass::Fatal,
                ..
            }) => self.downstream_fatal += 1,
            Err(_) => self.other += 1,
        }
    }

    pub fn merge(&mut self, other: &OutcomeTally) {
        self.succeeded += other.succeeded;
        self.circuit_open += other.circuit_open;
        self.acquire_timeout += other.acquire_timeout;
        self.deadline_exceeded += other.deadline_exceeded;
        self.downstream_retryable += other.downstream_retryable;
        self.downstream_fatal += other.downstream_fatal;
        self.other += other.other;
    }

    pub fn total(&self) -> u64 {
        self.succeeded + self.failed()
    }

    pub fn failed(&self) -> u64 {
        self.circuit_open
            + self.acquire_timeout
            + self.deadline_exceeded
            + self.downstream_retryable
            + self.downstream_fatal
            + self.other
    }
}

/// Result of one load run
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub target: String,
    pub calls: usize,
    pub concurrency: usize,
    pub elapsed_ms: u64,
    pub outcomes: OutcomeTally,
    pub metrics: PoolMetrics,
    pub health: PoolHealth,
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.outcomes;
        writeln!(
            f,
            "Target '{}': {} calls, {} concurrent, {} ms",
            self.target, self.calls, self.concurrency, self.elapsed_ms
        )?;
        writeln!(f, "  succeeded:          {}", o.succeeded)?;
        writeln!(f, "  circuit open:       {}", o.circuit_open)?;
        writeln!(f, "  acquire timeout:    {}", o.acquire_timeout)?;
        writeln!(f, "  deadline exceeded:  {}", o.deadline_exceeded)?;
        writeln!(f, "  retries exhausted:  {}", o.downstream_retryable)?;
        writeln!(f, "  fatal:              {}", o.downstream_fatal)?;
        if o.other > 0 {
            writeln!(f, "  other:              {}", o.other)?;
        }
        writeln!(
            f,
            "Pool: size {}/{}, active {}, available {}, retries {}, avg wait {:.2} ms, circuit {}",
            self.metrics.pool_size,
            self.metrics.max_connections,
            self.metrics.active_connections,
            self.metrics.available_connections,
            self.metrics.total_retries,
            self.metrics.avg_wait_time_ms,
            self.metrics.circuit_breaker_state
        )?;
        match &self.health.reason {
            Some(reason) => write!(f, "Health: unhealthy ({})", reason),
            None => write!(f, "Health: healthy"),
        }
    }
}

/// Issue `plan.calls` logical calls through `pool` from `plan.concurrency`
/// concurrent tasks
pub async fn run_load(
    pool: Arc<Pool<SimulatedClient, SimError>>,
    plan: LoadPlan,
) -> Result<LoadReport> {
    if plan.concurrency == 0 {
        return Err(BreakwaterError::Config(
            "concurrency must be greater than zero".to_string(),
        ));
    }

    info!(
        target_name = pool.target(),
        calls = plan.calls,
        concurrency = plan.concurrency,
        "Starting simulated load"
    );

    let started = Instant::now();
    let next_request = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..plan.concurrency)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let next_request = Arc::clone(&next_request);
            tokio::spawn(async move {
                let mut tally = OutcomeTally::default();
                loop {
                    let request = next_request.fetch_add(1, Ordering::Relaxed);
                    if request >= plan.calls {
                        break;
                    }
                    let outcome = pool
                        .execute(plan.deadline, move |client| {
                            client.call(request as u64).boxed()
                        })
                        .await;
                    tally.record(&outcome);
                }
                tally
            })
        })
        .collect();

    let mut outcomes = OutcomeTally::default();
    for joined in join_all(workers).await {
        let tally = joined
            .map_err(|e| BreakwaterError::Pool(format!("load worker failed: {}", e)))?;
        outcomes.merge(&tally);
    }

    let report = LoadReport {
        target: pool.target().to_string(),
        calls: plan.calls,
        concurrency: plan.concurrency,
        elapsed_ms: started.elapsed().as_millis() as u64,
        outcomes,
        metrics: pool.get_metrics(),
        health: pool.get_health(),
    };

    info!(
        target_name = pool.target(),
        succeeded = report.outcomes.succeeded,
        failed = report.outcomes.failed(),
        elapsed_ms = report.elapsed_ms,
        "Simulated load finished"
    );
    Ok(report)
}
