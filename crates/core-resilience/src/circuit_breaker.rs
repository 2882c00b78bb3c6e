//! Circuit Breaker for a single downstream target
//!
//! The circuit breaker prevents pile-on failures by failing fast once the
//! downstream has failed `failure_threshold` times in a row. It has three states:
//! - Closed: Normal operation, calls pass through
//! - Open: Downstream is unhealthy, calls are rejected without I/O
//! - HalfOpen: Cooldown elapsed, exactly one probe call is let through
//!
//! All transitions go through [`BreakerCore::apply`], so the transition
//! table can be tested on its own without any timing or concurrency.

use crate::clock::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted
    Closed,
    /// Calls are rejected until the recovery timeout elapses
    Open,
    /// One probe call at a time decides whether to close or re-open
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// When false every call is admitted and outcomes are ignored
    pub enabled: bool,
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Cooldown before an open circuit lets a probe through
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Inputs to the transition function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// A caller asks to make a call
    Admit,
    /// An admitted call succeeded
    Success { probe: bool },
    /// An admitted call failed
    Failure { probe: bool },
    /// A probe was admitted but never reached the downstream
    ProbeAbandoned,
}

/// Result of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The call may proceed; `probe` marks the single half-open trial call
    Admitted { probe: bool },
    /// The call must fail fast
    Rejected,
    /// An outcome was recorded (or deliberately ignored)
    Recorded,
}

/// The breaker's mutable record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerCore {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerCore {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    pub fn probe_in_flight(&self) -> bool {
        self.probe_in_flight
    }

    fn cooldown_elapsed(&self, now: Instant, config: &CircuitBreakerConfig) -> bool {
        match self.opened_at {
            Some(opened_at) => now.saturating_duration_since(opened_at) >= config.recovery_timeout,
            None => true,
        }
    }

    /// State as an observer would see it: an open circuit whose cooldown has
    /// elapsed reads as half-open even before the next call moves it there.
    pub fn effective_state(&self, now: Instant, config: &CircuitBreakerConfig) -> CircuitState {
        match self.state {
            CircuitState::Open if self.cooldown_elapsed(now, config) => CircuitState::HalfOpen,
            state => state,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    /// The single authoritative transition function
    pub fn apply(
        &mut self,
        event: BreakerEvent,
        now: Instant,
        config: &CircuitBreakerConfig,
    ) -> Decision {
        use BreakerEvent::*;
        use CircuitState::*;

        match (self.state, event) {
            (Closed, Admit) => Decision::Admitted { probe: false },
            (Open, Admit) => {
                if self.cooldown_elapsed(now, config) {
                    self.state = HalfOpen;
                    self.probe_in_flight = true;
                    Decision::Admitted { probe: true }
                } else {
                    Decision::Rejected
                }
            }
            (HalfOpen, Admit) => {
                if self.probe_in_flight {
                    Decision::Rejected
                } else {
                    self.probe_in_flight = true;
                    Decision::Admitted { probe: true }
                }
            }

            (Closed, Success { .. }) => {
                self.consecutive_failures = 0;
                Decision::Recorded
            }
            (Closed, Failure { .. }) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= config.failure_threshold {
                    self.open(now);
                }
                Decision::Recorded
            }

            (HalfOpen, Success { probe: true }) => {
                self.close();
                Decision::Recorded
            }
            (HalfOpen, Failure { probe: true }) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.open(now);
                Decision::Recorded
            }
            (HalfOpen, ProbeAbandoned) => {
                self.probe_in_flight = false;
                Decision::Recorded
            }

            // Stragglers admitted before the circuit opened do not get a say
            // in recovery; only the probe does.
            (HalfOpen, Success { probe: false })
            | (HalfOpen, Failure { probe: false })
            | (Open, Success { .. })
            | (Open, Failure { .. })
            | (Open, ProbeAbandoned)
            | (Closed, ProbeAbandoned) => Decision::Recorded,
        }
    }
}

impl Default for BreakerCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejection returned by [`CircuitBreaker::try_admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker is open")]
pub struct BreakerRejected;

/// Read-only view of the breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub probe_in_flight: bool,
}

/// Circuit breaker shared by every caller of one downstream target
///
/// # Example
/// ```
/// use breakwater_core_resilience::circuit_breaker::{
///     CircuitBreaker, CircuitBreakerConfig, CircuitState,
/// };
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig {
///     failure_threshold: 1,
///     ..Default::default()
/// });
///
/// let permit = breaker.try_admit().expect("closed circuit admits");
/// permit.record_failure();
///
/// assert_eq!(breaker.state(), CircuitState::Open);
/// assert!(breaker.try_admit().is_err());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    /// Create a breaker driven by the system clock
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a breaker driven by the given clock
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            core: Mutex::new(BreakerCore::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(&self, event: BreakerEvent) -> Decision {
        let now = self.clock.now();
        let mut core = self.lock();
        let before = core.state;
        let decision = core.apply(event, now, &self.config);
        let after = core.state;
        let failures = core.consecutive_failures;
        drop(core);

        if before != after {
            match after {
                CircuitState::Open => warn!(
                    from = %before,
                    consecutive_failures = failures,
                    cooldown_ms = self.config.recovery_timeout.as_millis() as u64,
                    "Circuit breaker opened"
                ),
                CircuitState::HalfOpen => debug!(from = %before, "Circuit breaker probing recovery"),
                CircuitState::Closed => info!(from = %before, "Circuit breaker closed"),
            }
        }

        decision
    }

    /// Ask to make a call
    ///
    /// Returns a permit that must be settled with the call's outcome. A permit
    /// dropped without an outcome gives up its probe slot without counting a
    /// failure.
    pub fn try_admit(&self) -> Result<CallPermit<'_>, BreakerRejected> {
        if !self.config.enabled {
            return Ok(CallPermit::new(self, false));
        }

        match self.apply(BreakerEvent::Admit) {
            Decision::Admitted { probe } => Ok(CallPermit::new(self, probe)),
            _ => Err(BreakerRejected),
        }
    }

    /// Effective state, see [`BreakerCore::effective_state`]
    pub fn state(&self) -> CircuitState {
        if !self.config.enabled {
            return CircuitState::Closed;
        }
        let now = self.clock.now();
        self.lock().effective_state(now, &self.config)
    }

    /// Get current consecutive failure count
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// When the circuit last opened, if it is open or probing
    pub fn opened_at(&self) -> Option<Instant> {
        self.lock().opened_at
    }

    pub fn probe_in_flight(&self) -> bool {
        self.lock().probe_in_flight
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let core = self.lock();
        BreakerSnapshot {
            state: if self.config.enabled {
                core.effective_state(now, &self.config)
            } else {
                CircuitState::Closed
            },
            consecutive_failures: core.consecutive_failures,
            opened_at: core.opened_at,
            probe_in_flight: core.probe_in_flight,
        }
    }

    /// Force the circuit closed (operator override)
    pub fn reset(&self) {
        let mut core = self.lock();
        let before = core.state;
        *core = BreakerCore::new();
        drop(core);
        warn!(from = %before, "Circuit breaker manually reset");
    }
}

/// Admission ticket for one call attempt
#[must_use = "a permit must be settled with the call's outcome"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// Whether this is the half-open probe call
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settle(BreakerEvent::Success { probe: self.probe });
    }

    pub fn record_failure(mut self) {
        self.settle(BreakerEvent::Failure { probe: self.probe });
    }

    fn settle(&mut self, event: BreakerEvent) {
        self.settled = true;
        if self.breaker.config.enabled {
            self.breaker.apply(event);
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.apply(BreakerEvent::ProbeAbandoned);
        }
    }
}
