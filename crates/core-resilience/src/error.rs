//! Error taxonomy for the outbound call pool
//!
//! Every failure the pool can surface is a [`PoolError`]. The downstream error
//! type `E` is opaque to the pool; only the caller-supplied classifier knows
//! whether a given downstream error is worth retrying.

use crate::slot_manager::SlotId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Whether a downstream failure is transient or terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient failure, worth another attempt after a backoff
    Retryable,
    /// Terminal failure, surfaced to the caller immediately
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Retryable => write!(f, "retryable"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Caller-supplied failure classifier
///
/// Only the caller's domain knows which downstream error codes are transient,
/// so the pool takes this as a plain function rather than inspecting errors.
pub type ClassifyFn<E> = Arc<dyn Fn(&E) -> ErrorClass + Send + Sync>;

/// Classifier that treats every downstream error as transient
pub fn classify_all_retryable<E: 'static>() -> ClassifyFn<E> {
    Arc::new(|_: &E| ErrorClass::Retryable)
}

/// Classifier that treats every downstream error as terminal
pub fn classify_all_fatal<E: 'static>() -> ClassifyFn<E> {
    Arc::new(|_: &E| ErrorClass::Fatal)
}

/// Errors surfaced by pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError<E> {
    /// No slot became free within the acquire timeout
    #[error("no connection slot became available within {0:?}")]
    AcquireTimeout(Duration),

    /// Call rejected by the circuit breaker without touching the downstream
    #[error("circuit breaker is open, call rejected")]
    CircuitOpen,

    /// The downstream call failed
    #[error("downstream call failed ({class}) after {attempts} attempt(s): {source}")]
    Downstream {
        #[source]
        source: E,
        class: ErrorClass,
        attempts: u32,
    },

    /// The downstream call did not finish within the caller's deadline
    #[error("downstream call exceeded its {deadline:?} deadline after {attempts} attempt(s)")]
    DeadlineExceeded { deadline: Duration, attempts: u32 },

    /// The client factory failed to construct a new client
    #[error("failed to construct downstream client: {0}")]
    ClientFactory(E),

    /// A slot was returned to the pool more than once
    #[error("slot {slot_id} was released more than once")]
    DoubleRelease { slot_id: SlotId },

    /// The pool has been shut down
    #[error("pool is closed")]
    PoolClosed,

    /// The pool configuration is invalid
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl<E> PoolError<E> {
    /// Fast-fail errors the caller is expected to recover from locally,
    /// typically by degrading to a fallback response.
    pub fn is_fast_fail(&self) -> bool {
        matches!(self, PoolError::AcquireTimeout(_) | PoolError::CircuitOpen)
    }

    /// Whether the failure was classified as transient
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::Downstream { class, .. } => *class == ErrorClass::Retryable,
            PoolError::DeadlineExceeded { .. } => true,
            _ => false,
        }
    }

    /// The downstream error, if this failure came from the downstream call
    pub fn downstream(&self) -> Option<&E> {
        match self {
            PoolError::Downstream { source, .. } => Some(source),
            PoolError::ClientFactory(source) => Some(source),
            _ => None,
        }
    }

    /// Short label used in log fields
    pub fn category(&self) -> &'static str {
        match self {
            PoolError::AcquireTimeout(_) => "acquire_timeout",
            PoolError::CircuitOpen => "circuit_open",
            PoolError::Downstream { .. } => "downstream",
            PoolError::DeadlineExceeded { .. } => "deadline_exceeded",
            PoolError::ClientFactory(_) => "client_factory",
            PoolError::DoubleRelease { .. } => "double_release",
            PoolError::PoolClosed => "pool_closed",
            PoolError::InvalidConfig(_) => "invalid_config",
        }
    }
}

/// Configuration validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("min_connections must be greater than zero")]
    ZeroMinConnections,

    #[error("min_connections ({min}) exceeds max_connections ({max})")]
    MinExceedsMax { min: usize, max: usize },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("circuit_breaker_failure_threshold must be greater than zero")]
    ZeroFailureThreshold,

    #[error("retry_base_delay ({base:?}) exceeds retry_max_delay ({max:?})")]
    BackoffInverted { base: Duration, max: Duration },
}
