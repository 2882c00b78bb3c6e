/*!
 * Breakwater - resilient outbound calls
 *
 * Application shell around `breakwater-core-resilience`:
 * - TOML configuration for logging and per-target pool settings
 * - Structured logging via tracing-subscriber
 * - A simulated downstream and load driver for exercising pools
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod simulate;

// Re-export commonly used types
pub use breakwater_core_resilience as resilience;
pub use config::{AppConfig, LogLevel, LoggingConfig, TargetConfig};
pub use error::{BreakwaterError, Result};
pub use simulate::{run_load, DownstreamProfile, LoadPlan, LoadReport, SimError, SimulatedDownstream};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
