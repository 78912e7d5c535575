//! Stream counters and cross-rate refresh latency tracking
//!
//! The collector lives inside the stream's event loop, so it is mutated
//! through `&mut self` without any locking.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Maximum number of refresh samples to keep for percentile calculation
const MAX_SAMPLES: usize = 100;

/// Snapshot of stream counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Inbound frames read from the socket
    pub frames_received: u64,
    /// Frames dropped because they could not be decoded
    pub frames_dropped: u64,
    /// Ticks delivered to at least one subscriber
    pub ticks_dispatched: u64,
    /// Invalid-subscription notices received
    pub invalid_notices: u64,
    /// Re-subscriptions through the cross pair
    pub fallback_retries: u64,
    /// Broadcast envelopes received from other contexts
    pub envelopes_received: u64,
    /// Successful cross-rate refreshes
    pub rate_refreshes: u64,
    /// Failed cross-rate refreshes
    pub rate_refresh_failures: u64,
    /// 50th percentile refresh latency in milliseconds
    pub rate_latency_p50_ms: f64,
    /// 99th percentile refresh latency in milliseconds
    pub rate_latency_p99_ms: f64,
}

/// Collects stream counters
#[derive(Debug, Default)]
pub struct StreamMetrics {
    counters: MetricsSnapshot,
    /// Rolling window of successful refresh latencies
    samples: VecDeque<f64>,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            counters: MetricsSnapshot::default(),
            samples: VecDeque::with_capacity(MAX_SAMPLES),
        }
    }

    pub fn record_frame(&mut self) {
        self.counters.frames_received += 1;
    }

    pub fn record_dropped(&mut self) {
        self.counters.frames_dropped += 1;
    }

    pub fn record_tick(&mut self) {
        self.counters.ticks_dispatched += 1;
    }

    pub fn record_invalid(&mut self) {
        self.counters.invalid_notices += 1;
    }

    pub fn record_retry(&mut self) {
        self.counters.fallback_retries += 1;
    }

    pub fn record_envelope(&mut self) {
        self.counters.envelopes_received += 1;
    }

    /// Records a cross-rate refresh with its duration and outcome
    pub fn record_refresh(&mut self, duration: Duration, success: bool) {
        if !success {
            self.counters.rate_refresh_failures += 1;
            return;
        }

        self.counters.rate_refreshes += 1;
        if self.samples.len() >= MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(duration.as_secs_f64() * 1000.0);
    }

    /// Computes the current snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut latencies: Vec<f64> = self.samples.iter().copied().collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        MetricsSnapshot {
            rate_latency_p50_ms: percentile(&latencies, 50.0),
            rate_latency_p99_ms: percentile(&latencies, 99.0),
            ..self.counters.clone()
        }
    }
}

/// Calculate percentile from sorted values
fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }

    let idx = (p / 100.0 * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[idx.min(sorted_values.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_metrics() {
        let mut metrics = StreamMetrics::new();

        metrics.record_refresh(Duration::from_millis(100), true);
        metrics.record_refresh(Duration::from_millis(200), true);
        metrics.record_refresh(Duration::from_millis(150), false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rate_refreshes, 2);
        assert_eq!(snapshot.rate_refresh_failures, 1);
        assert!(snapshot.rate_latency_p99_ms >= snapshot.rate_latency_p50_ms);
        assert!((snapshot.rate_latency_p99_ms - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_sample_window_is_bounded() {
        let mut metrics = StreamMetrics::new();
        for ms in 0..(MAX_SAMPLES as u64 + 20) {
            metrics.record_refresh(Duration::from_millis(ms), true);
        }
        assert_eq!(metrics.samples.len(), MAX_SAMPLES);
        assert_eq!(metrics.snapshot().rate_refreshes, MAX_SAMPLES as u64 + 20);
    }

    #[test]
    fn test_percentile() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        assert_eq!(percentile(&values, 50.0), 5.0);
        assert_eq!(percentile(&values, 99.0), 9.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
