//! Breakwater Core Resilience: outbound call pool with circuit-breaker protection
//!
//! # Overview
//!
//! This crate bounds and protects calls to rate-limited or unreliable remote
//! services (LLM APIs, search engines, internal microservices). It includes:
//!
//! - **Connection Slot Manager**: bounded set of reusable clients with a FIFO
//!   wait queue, acquire timeouts and a graceful drain on shutdown
//! - **Circuit Breaker**: CLOSED / OPEN / HALF_OPEN with a single recovery probe
//! - **Pool**: `execute` combines breaker, slot lease, deadline and retries
//!   with exponential backoff
//! - **Metrics and Health**: serializable snapshots for monitoring and scaling
//! - **Pool Registry**: one shared pool per downstream target
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - The client type being pooled (`C` is opaque)
//! - The downstream error type (`E` is opaque, a caller classifier decides
//!   whether it is retryable)
//! - Transport protocols (HTTP, gRPC, database drivers)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │ registry.get_or_create(target)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Pool Registry                     │  ← One pool per target
//! └─────────────┬───────────────────────────┘
//!               │ pool.execute(deadline, work)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Counts failures, single probe)        │
//! └─────────────┬───────────────────────────┘
//!               │ admitted
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Connection Slot Manager           │  ← Bounded concurrency
//! │  (Free set, FIFO waiters, timeouts)     │
//! └─────────────┬───────────────────────────┘
//!               │ leased client
//!               ▼
//!         Downstream Service
//!               │
//!     retryable failure?
//!               │
//!               ▼
//!      backoff, start over at the breaker
//!
//!  Always available:
//!   get_metrics() → PoolMetrics     get_health() → PoolHealth
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use breakwater_core_resilience::prelude::*;
//! use std::time::Duration;
//!
//! # #[derive(Debug)]
//! # struct HttpClient;
//! # impl HttpClient {
//! #     async fn get(&mut self, _path: &str) -> Result<u16, std::io::Error> { Ok(200) }
//! # }
//! # async fn example() -> Result<(), PoolError<std::io::Error>> {
//! let registry: PoolRegistry<HttpClient, std::io::Error> = PoolRegistry::new();
//!
//! let pool = registry
//!     .get_or_create(
//!         "search-api",
//!         PoolConfig::interactive_profile(),
//!         factory_fn(|| async { Ok(HttpClient) }),
//!         classify_all_retryable(),
//!     )
//!     .await?;
//!
//! let status = pool
//!     .execute(Duration::from_secs(2), |client| {
//!         Box::pin(async move { client.get("/health").await })
//!     })
//!     .await?;
//! assert_eq!(status, 200);
//!
//! registry.shutdown_all(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod slot_manager;

// Re-export main types for convenience
pub use circuit_breaker::{
    BreakerRejected, BreakerSnapshot, CallPermit, CircuitBreaker, CircuitBreakerConfig,
    CircuitState,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{
    classify_all_fatal, classify_all_retryable, ClassifyFn, ConfigError, ErrorClass, PoolError,
};
pub use health::PoolHealth;
pub use metrics::{PoolMetrics, PoolMetricsRecorder};
pub use pool::{Pool, PoolConfig, RetryPolicy};
pub use registry::PoolRegistry;
pub use slot_manager::{
    factory_fn, ClientFactory, ConnectionHandle, FnClientFactory, SlotCounts, SlotId,
    SlotManager,
};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use breakwater_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::error::{
        classify_all_fatal, classify_all_retryable, ClassifyFn, ErrorClass, PoolError,
    };
    pub use super::health::PoolHealth;
    pub use super::metrics::PoolMetrics;
    pub use super::pool::{Pool, PoolConfig, RetryPolicy};
    pub use super::registry::PoolRegistry;
    pub use super::slot_manager::{factory_fn, ClientFactory, ConnectionHandle};
}
