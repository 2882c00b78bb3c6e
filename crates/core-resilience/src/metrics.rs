//! Pool metrics accumulator
//!
//! Counters are monotonic atomics; gauges (pool size, active, available) are
//! read from the slot manager when a snapshot is taken. Snapshots are pure
//! views and never feed back into pool behavior.

use crate::circuit_breaker::CircuitState;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Number of acquire wait samples kept for the rolling average
const WAIT_WINDOW: usize = 256;

/// Thread-safe counters for one pool
#[derive(Debug)]
pub struct PoolMetricsRecorder {
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    total_timeouts: AtomicU64,
    total_rejections: AtomicU64,
    total_retries: AtomicU64,
    wait_samples: Mutex<VecDeque<Duration>>,
}

impl PoolMetricsRecorder {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            wait_samples: Mutex::new(VecDeque::with_capacity(WAIT_WINDOW)),
        }
    }

    /// A logical call completed successfully
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A logical call ended in a terminal downstream error
    pub fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// An acquire gave up waiting for a slot
    pub fn record_timeout(&self) {
        self.total_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// A call was rejected by the open circuit
    pub fn record_rejection(&self) {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long an acquire waited, successful or not
    pub fn record_wait(&self, waited: Duration) {
        let mut samples = self.wait_samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.len() == WAIT_WINDOW {
            samples.pop_front();
        }
        samples.push_back(waited);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub fn total_timeouts(&self) -> u64 {
        self.total_timeouts.load(Ordering::Relaxed)
    }

    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Mean of the retained wait samples in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let samples = self.wait_samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.is_empty() {
            return 0.0;
        }
        let total: Duration = samples.iter().sum();
        total.as_secs_f64() * 1000.0 / samples.len() as f64
    }
}

impl Default for PoolMetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a pool
///
/// Field names are a stable contract with external monitoring and scaling
/// consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub pool_size: usize,
    pub max_connections: usize,
    pub active_connections: usize,
    pub available_connections: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub total_timeouts: u64,
    pub total_rejections: u64,
    pub total_retries: u64,
    pub avg_wait_time_ms: f64,
    pub circuit_breaker_state: CircuitState,
    /// Wall-clock capture time for export; not driven by the pool's `Clock`
    pub captured_at: SystemTime,
}

impl PoolMetrics {
    /// Leased slots as a percentage of the configured maximum
    pub fn utilization(&self) -> f64 {
        if self.max_connections == 0 {
            0.0
        } else {
            (self.active_connections as f64 / self.max_connections as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent() {
        let recorder = PoolMetricsRecorder::new();
        recorder.record_request();
        recorder.record_request();
        recorder.record_timeout();
        recorder.record_rejection();

        assert_eq!(recorder.total_requests(), 2);
        assert_eq!(recorder.total_timeouts(), 1);
        assert_eq!(recorder.total_rejections(), 1);
        assert_eq!(recorder.total_errors(), 0);
        assert_eq!(recorder.total_retries(), 0);
    }

    #[test]
    fn test_wait_average_rolls() {
        let recorder = PoolMetricsRecorder::new();
        assert_eq!(recorder.avg_wait_time_ms(), 0.0);

        recorder.record_wait(Duration::from_millis(10));
        recorder.record_wait(Duration::from_millis(30));
        assert!((recorder.avg_wait_time_ms() - 20.0).abs() < 1e-9);

        for _ in 0..WAIT_WINDOW {
            recorder.record_wait(Duration::from_millis(4));
        }
        assert!((recorder.avg_wait_time_ms() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_serializes_with_stable_names() {
        let metrics = PoolMetrics {
            pool_size: 4,
            max_connections: 8,
            active_connections: 2,
            available_connections: 2,
            total_requests: 10,
            total_errors: 1,
            total_timeouts: 0,
            total_rejections: 0,
            total_retries: 3,
            avg_wait_time_ms: 1.5,
            circuit_breaker_state: CircuitState::HalfOpen,
            captured_at: SystemTime::UNIX_EPOCH,
        };

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["active_connections"], 2);
        assert_eq!(json["available_connections"], 2);
        assert_eq!(json["circuit_breaker_state"], "half_open");
        assert_eq!(metrics.utilization(), 25.0);
    }
}
