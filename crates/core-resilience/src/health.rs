//! Health reporting for a pool
//!
//! Health is a pure function of a few gauges: the breaker state, the slot
//! counts, and how long the free set has been empty. Computing it never
//! touches the waiter queue.
//!
//! # Example
//!
//! ```
//! use breakwater_core_resilience::circuit_breaker::CircuitState;
//! use breakwater_core_resilience::health::{assess, HealthInputs};
//! use std::time::Duration;
//!
//! let health = assess(HealthInputs {
//!     circuit_state: CircuitState::Open,
//!     pool_size: 4,
//!     active_connections: 1,
//!     available_connections: 3,
//!     exhausted_for: None,
//!     staleness_window: Duration::from_secs(30),
//!     closed: false,
//! });
//! assert!(!health.healthy);
//! ```

use crate::circuit_breaker::CircuitState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Structured health snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHealth {
    pub healthy: bool,
    pub circuit_state: CircuitState,
    pub pool_size: usize,
    pub active_connections: usize,
    pub available_connections: usize,
    /// Why the pool is unhealthy, if it is
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Gauges a health verdict is computed from
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    pub circuit_state: CircuitState,
    pub pool_size: usize,
    pub active_connections: usize,
    pub available_connections: usize,
    /// How long the free set has been empty, if it is empty
    pub exhausted_for: Option<Duration>,
    pub staleness_window: Duration,
    pub closed: bool,
}

/// Compute a health verdict
pub fn assess(inputs: HealthInputs) -> PoolHealth {
    let reason = if inputs.closed {
        Some("pool is closed".to_string())
    } else if inputs.circuit_state == CircuitState::Open {
        Some("circuit breaker is open".to_string())
    } else {
        match inputs.exhausted_for {
            Some(for_how_long)
                if inputs.available_connections == 0
                    && for_how_long > inputs.staleness_window =>
            {
                Some(format!(
                    "no free connection for {}ms",
                    for_how_long.as_millis()
                ))
            }
            _ => None,
        }
    };

    PoolHealth {
        healthy: reason.is_none(),
        circuit_state: inputs.circuit_state,
        pool_size: inputs.pool_size,
        active_connections: inputs.active_connections,
        available_connections: inputs.available_connections,
        reason,
    }
}
