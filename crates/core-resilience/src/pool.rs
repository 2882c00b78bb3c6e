//! Pool orchestration: breaker check, slot lease, guarded call, retry
//!
//! [`Pool::execute`] is the primary entry point. Each attempt:
//! 1. asks the circuit breaker for admission (rejections never touch a slot),
//! 2. leases a slot within `acquire_timeout`,
//! 3. runs the work against the leased client under the caller's deadline,
//! 4. reports the outcome to the breaker and metrics and releases the slot,
//! 5. on a retryable failure with retries left, backs off without holding a
//!    slot and starts over at step 1.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::error::{ClassifyFn, ConfigError, ErrorClass, PoolError};
use crate::health::{assess, HealthInputs, PoolHealth};
use crate::metrics::{PoolMetrics, PoolMetricsRecorder};
use crate::slot_manager::{ClientFactory, ConnectionHandle, SlotManager};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, debug_span, info, warn, Instrument};

/// Configuration for one pool
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Slots created eagerly at construction
    pub min_connections: usize,
    /// Upper bound on concurrently leased slots
    pub max_connections: usize,
    /// Maximum wait for a free slot
    pub acquire_timeout: Duration,
    /// Retries for one logical call after a retryable failure
    pub max_retries: u32,
    pub circuit_breaker_enabled: bool,
    /// Consecutive failures before the circuit opens
    pub circuit_breaker_failure_threshold: u32,
    /// Cooldown before an open circuit probes recovery
    pub circuit_breaker_recovery_timeout: Duration,
    /// Backoff before the first retry; doubles per retry
    pub retry_base_delay: Duration,
    /// Backoff cap
    pub retry_max_delay: Duration,
    /// How long the free set may stay empty before health reports false
    pub health_staleness_window: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            max_retries: 3,
            circuit_breaker_enabled: true,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_recovery_timeout: Duration::from_secs(30),
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            health_staleness_window: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Interactive profile: request handlers with a user waiting on the answer
    ///
    /// Small warm pool, short acquire timeout, few retries. A caller that cannot
    /// get a slot quickly is better served by a fallback response.
    ///
    /// # Example
    ///
    /// ```
    /// use breakwater_core_resilience::pool::PoolConfig;
    ///
    /// let config = PoolConfig::interactive_profile();
    /// assert_eq!(config.acquire_timeout, std::time::Duration::from_millis(500));
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn interactive_profile() -> Self {
        Self {
            min_connections: 4,
            max_connections: 16,
            acquire_timeout: Duration::from_millis(500),
            max_retries: 1,
            circuit_breaker_enabled: true,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_recovery_timeout: Duration::from_secs(15),
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_millis(500),
            health_staleness_window: Duration::from_secs(10),
        }
    }

    /// Batch profile: background jobs that can afford to wait
    ///
    /// - **Max connections**: low, batch work should not starve interactive
    ///   traffic against the same rate-limited API
    /// - **Acquire timeout**: long, queueing is expected
    /// - **Retries**: generous, with a slow backoff
    pub fn batch_profile() -> Self {
        Self {
            min_connections: 1,
            max_connections: 4,
            acquire_timeout: Duration::from_secs(60),
            max_retries: 5,
            circuit_breaker_enabled: true,
            circuit_breaker_failure_threshold: 10,
            circuit_breaker_recovery_timeout: Duration::from_secs(120),
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            health_staleness_window: Duration::from_secs(300),
        }
    }

    pub fn with_connections(mut self, min: usize, max: usize) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_circuit_breaker(mut self, failure_threshold: u32, recovery: Duration) -> Self {
        self.circuit_breaker_enabled = true;
        self.circuit_breaker_failure_threshold = failure_threshold;
        self.circuit_breaker_recovery_timeout = recovery;
        self
    }

    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker_enabled = false;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn with_health_staleness_window(mut self, window: Duration) -> Self {
        self.health_staleness_window = window;
        self
    }

    /// Check the configuration invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_connections == 0 {
            return Err(ConfigError::ZeroMinConnections);
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::MinExceedsMax {
                min: self.min_connections,
                max: self.max_connections,
            });
        }
        if self.acquire_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("acquire_timeout"));
        }
        if self.circuit_breaker_enabled {
            if self.circuit_breaker_failure_threshold == 0 {
                return Err(ConfigError::ZeroFailureThreshold);
            }
            if self.circuit_breaker_recovery_timeout.is_zero() {
                return Err(ConfigError::ZeroDuration("circuit_breaker_recovery_timeout"));
            }
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(ConfigError::BackoffInverted {
                base: self.retry_base_delay,
                max: self.retry_max_delay,
            });
        }
        if self.health_staleness_window.is_zero() {
            return Err(ConfigError::ZeroDuration("health_staleness_window"));
        }
        Ok(())
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: self.circuit_breaker_enabled,
            failure_threshold: self.circuit_breaker_failure_threshold,
            recovery_timeout: self.circuit_breaker_recovery_timeout,
        }
    }
}

/// Retry schedule for one logical call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&PoolConfig> for RetryPolicy {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }
}

/// Resilient pool of clients for one downstream target
pub struct Pool<C, E> {
    target: String,
    config: PoolConfig,
    slots: SlotManager<C, E>,
    breaker: CircuitBreaker,
    metrics: PoolMetricsRecorder,
    classify: ClassifyFn<E>,
    clock: Arc<dyn Clock>,
}

impl<C, E> Pool<C, E>
where
    C: Send + 'static,
    E: Send + 'static,
{
    /// Validate the configuration, build the pool and warm up
    /// `min_connections` slots
    pub async fn new(
        target: impl Into<String>,
        config: PoolConfig,
        factory: Arc<dyn ClientFactory<C, E>>,
        classify: ClassifyFn<E>,
    ) -> Result<Self, PoolError<E>> {
        Self::with_clock(target, config, factory, classify, Arc::new(SystemClock)).await
    }

    /// Like [`Pool::new`] with an explicit clock for breaker cooldowns and
    /// health staleness
    pub async fn with_clock(
        target: impl Into<String>,
        config: PoolConfig,
        factory: Arc<dyn ClientFactory<C, E>>,
        classify: ClassifyFn<E>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PoolError<E>> {
        config.validate()?;
        let target = target.into();

        let slots = SlotManager::new(factory, config.max_connections, clock.clone());
        slots.warm_up(config.min_connections).await?;

        let breaker = CircuitBreaker::with_clock(config.circuit_breaker_config(), clock.clone());

        info!(
            pool = %target,
            min = config.min_connections,
            max = config.max_connections,
            breaker = config.circuit_breaker_enabled,
            "Pool ready"
        );

        Ok(Self {
            target,
            config,
            slots,
            breaker,
            metrics: PoolMetricsRecorder::new(),
            classify,
            clock,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Lease a slot with the configured acquire timeout
    ///
    /// This bypasses the circuit breaker and retries; prefer
    /// [`Pool::execute`] unless several operations must share one client.
    pub async fn acquire(&self) -> Result<ConnectionHandle<C, E>, PoolError<E>> {
        self.acquire_timeout(self.config.acquire_timeout).await
    }

    /// Lease a slot, waiting at most `timeout`
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<ConnectionHandle<C, E>, PoolError<E>> {
        let started = tokio::time::Instant::now();
        let result = self.slots.acquire(timeout).await;
        self.metrics.record_wait(started.elapsed());

        match &result {
            Err(PoolError::AcquireTimeout(_)) => self.metrics.record_timeout(),
            Err(PoolError::ClientFactory(_)) => self.metrics.record_error(),
            _ => {}
        }
        result
    }

    /// Run `work` against a pooled client with the configured retry policy
    ///
    /// `deadline` bounds each attempt's downstream call.
    ///
    /// # Example
    /// ```no_run
    /// use breakwater_core_resilience::prelude::*;
    /// use std::time::Duration;
    ///
    /// # struct ApiClient;
    /// # impl ApiClient { async fn ask(&mut self, q: &str) -> Result<String, std::io::Error> { Ok(q.into()) } }
    /// # async fn example(pool: Pool<ApiClient, std::io::Error>) {
    /// let answer = pool
    ///     .execute(Duration::from_secs(10), |client| {
    ///         Box::pin(async move { client.ask("status?").await })
    ///     })
    ///     .await;
    ///
    /// match answer {
    ///     Ok(text) => println!("{text}"),
    ///     Err(e) if e.is_fast_fail() => println!("degraded: {e}"),
    ///     Err(e) => eprintln!("failed: {e}"),
    /// }
    /// # }
    /// ```
    pub async fn execute<T, F>(&self, deadline: Duration, work: F) -> Result<T, PoolError<E>>
    where
        F: FnMut(&mut C) -> BoxFuture<'_, Result<T, E>> + Send,
        T: Send,
    {
        let policy = RetryPolicy::from(&self.config);
        self.execute_with_policy(policy, deadline, work).await
    }

    /// Run `work` with an explicit retry policy
    pub async fn execute_with_policy<T, F>(
        &self,
        policy: RetryPolicy,
        deadline: Duration,
        work: F,
    ) -> Result<T, PoolError<E>>
    where
        F: FnMut(&mut C) -> BoxFuture<'_, Result<T, E>> + Send,
        T: Send,
    {
        let span = debug_span!("pool.execute", pool = %self.target);
        self.run(policy, deadline, work).instrument(span).await
    }

    async fn run<T, F>(
        &self,
        policy: RetryPolicy,
        deadline: Duration,
        mut work: F,
    ) -> Result<T, PoolError<E>>
    where
        F: FnMut(&mut C) -> BoxFuture<'_, Result<T, E>> + Send,
        T: Send,
    {
        let mut attempt: u32 = 0;
        let mut last_failure: Option<PoolError<E>> = None;

        loop {
            attempt += 1;

            let permit = match self.breaker.try_admit() {
                Ok(permit) => permit,
                Err(_) => {
                    self.metrics.record_rejection();
                    debug!(attempt, "Rejected by open circuit");
                    // A retry cut short by the breaker still failed downstream
                    if let Some(failure) = last_failure {
                        self.metrics.record_error();
                        warn!(
                            attempts = attempt - 1,
                            kind = failure.category(),
                            "Call failed, circuit opened before retry"
                        );
                        return Err(failure);
                    }
                    return Err(PoolError::CircuitOpen);
                }
            };

            // An unsettled permit is dropped on these early returns, which
            // frees a half-open probe without counting a failure.
            let mut lease = match self.acquire().await {
                Ok(lease) => lease,
                Err(err) => {
                    if let Some(failure) = last_failure {
                        self.metrics.record_error();
                        warn!(
                            attempts = attempt - 1,
                            kind = failure.category(),
                            reason = err.category(),
                            "Call failed, no slot for retry"
                        );
                        return Err(failure);
                    }
                    return Err(err);
                }
            };

            let outcome = tokio::time::timeout(deadline, work(lease.client_mut())).await;
            lease.release()?;

            let failure = match outcome {
                Ok(Ok(value)) => {
                    permit.record_success();
                    self.metrics.record_request();
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    permit.record_failure();
                    let class = (self.classify)(&err);
                    PoolError::Downstream {
                        source: err,
                        class,
                        attempts: attempt,
                    }
                }
                Err(_) => {
                    permit.record_failure();
                    PoolError::DeadlineExceeded {
                        deadline,
                        attempts: attempt,
                    }
                }
            };

            let retryable = match &failure {
                PoolError::Downstream { class, .. } => *class == ErrorClass::Retryable,
                _ => true,
            };

            if !retryable || attempt > policy.max_retries {
                self.metrics.record_error();
                warn!(
                    attempts = attempt,
                    kind = failure.category(),
                    retryable,
                    "Call failed"
                );
                return Err(failure);
            }

            let delay = policy.delay_for(attempt);
            self.metrics.record_retry();
            debug!(
                attempt,
                kind = failure.category(),
                delay_ms = delay.as_millis() as u64,
                "Retrying after backoff"
            );
            last_failure = Some(failure);
            tokio::time::sleep(delay).await;
        }
    }

    /// Point-in-time metrics, stamped with wall-clock time
    pub fn get_metrics(&self) -> PoolMetrics {
        let counts = self.slots.counts();
        PoolMetrics {
            pool_size: counts.pool_size,
            max_connections: self.config.max_connections,
            active_connections: counts.active,
            available_connections: counts.available,
            total_requests: self.metrics.total_requests(),
            total_errors: self.metrics.total_errors(),
            total_timeouts: self.metrics.total_timeouts(),
            total_rejections: self.metrics.total_rejections(),
            total_retries: self.metrics.total_retries(),
            avg_wait_time_ms: self.metrics.avg_wait_time_ms(),
            circuit_breaker_state: self.breaker.state(),
            captured_at: SystemTime::now(),
        }
    }

    /// Health verdict; never waits on the acquire queue
    pub fn get_health(&self) -> PoolHealth {
        let counts = self.slots.counts();
        let now = self.clock.now();
        assess(HealthInputs {
            circuit_state: self.breaker.state(),
            pool_size: counts.pool_size,
            active_connections: counts.active,
            available_connections: counts.available,
            exhausted_for: counts
                .exhausted_since
                .map(|since| now.saturating_duration_since(since)),
            staleness_window: self.config.health_staleness_window,
            closed: self.slots.is_closed(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Stop accepting calls, wait up to `grace` for in-flight leases, then
    /// destroy every remaining slot. Returns true if everything drained in
    /// time. Safe to call more than once.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if self.slots.close() {
            info!(pool = %self.target, grace_ms = grace.as_millis() as u64, "Pool draining");
        }

        let drained = self.slots.drain(grace).await;
        let remaining = self.slots.force_destroy();

        if drained {
            info!(pool = %self.target, "Pool drained");
        } else {
            warn!(
                pool = %self.target,
                still_leased = remaining.active,
                "Grace period elapsed before pool drained"
            );
        }
        drained
    }

    /// Current breaker state
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }
}
