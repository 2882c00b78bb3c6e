/*!
 * Configuration types for Breakwater
 *
 * One TOML file describes logging and every downstream target. Durations are
 * written in milliseconds so the file stays plain integers.
 */

use breakwater_core_resilience::PoolConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BreakwaterError, Result};

/// Top-level application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// One entry per downstream target
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            targets: vec![TargetConfig::named("default")],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level when RUST_LOG is unset
    #[serde(default)]
    pub level: LogLevel,

    /// Write logs to this file instead of stderr
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Emit JSON lines on stderr as well (files are always JSON)
    #[serde(default)]
    pub json: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Pool settings for one downstream target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Registry key, e.g. "llm" or "search"
    pub name: String,

    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_health_staleness_ms")]
    pub health_staleness_ms: u64,
}

impl TargetConfig {
    /// A target with every pool setting at its default
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            max_retries: default_max_retries(),
            circuit_breaker_enabled: true,
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            health_staleness_ms: default_health_staleness_ms(),
        }
    }

    /// Convert to the pool library's config, rejecting invalid combinations
    pub fn to_pool_config(&self) -> Result<PoolConfig> {
        let config = PoolConfig {
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            max_retries: self.max_retries,
            circuit_breaker_enabled: self.circuit_breaker_enabled,
            circuit_breaker_failure_threshold: self.failure_threshold,
            circuit_breaker_recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
            health_staleness_window: Duration::from_millis(self.health_staleness_ms),
        };

        config
            .validate()
            .map_err(|e| BreakwaterError::Config(format!("target '{}': {}", self.name, e)))?;
        Ok(config)
    }
}

const TEMPLATE_HEADER: &str = "\
# Breakwater configuration
#
# [logging]
#   level = error | warn | info | debug | trace  (RUST_LOG overrides)
#   file  = path for JSON log output (omit to log to stderr)
#   json  = true for JSON lines on stderr
#
# [[targets]] defines one pool per downstream service. Every field except
# `name` is optional; durations are in milliseconds.

";

// Default value functions for serde, mirroring PoolConfig::default()
fn default_true() -> bool {
    true
}

fn default_min_connections() -> usize {
    2
}

fn default_max_connections() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_health_staleness_ms() -> u64 {
    30_000
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|source| BreakwaterError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Write a commented starter config; refuses to replace an existing file
    /// unless `overwrite` is set
    pub fn write_template(path: &Path, overwrite: bool) -> Result<()> {
        if path.exists() && !overwrite {
            return Err(BreakwaterError::Config(format!(
                "{} already exists (use --force to overwrite)",
                path.display()
            )));
        }
        let body = toml::to_string_pretty(&AppConfig::default())?;
        std::fs::write(path, format!("{}{}", TEMPLATE_HEADER, body))?;
        Ok(())
    }

    /// Look up a target by name
    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Validate every target, returning the pool configs in file order
    pub fn validate(&self) -> Result<Vec<(String, PoolConfig)>> {
        if self.targets.is_empty() {
            return Err(BreakwaterError::Config("no [[targets]] defined".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        let mut validated = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            if !seen.insert(target.name.as_str()) {
                return Err(BreakwaterError::Config(format!(
                    "duplicate target '{}'",
                    target.name
                )));
            }
            validated.push((target.name.clone(), target.to_pool_config()?));
        }
        Ok(validated)
    }
}
