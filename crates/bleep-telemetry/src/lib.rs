//! In-memory metrics sink.
//!
//! The core only records counters; plotting, sampling and persistence are
//! an external collector's job. `(node_id, metric name)` is the series key,
//! matching the shape an external dashboard would pull by.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub timestamp: f64,
    pub value: f64,
}

#[derive(Debug, Default)]
pub struct Metrics {
    series: Mutex<HashMap<(u32, &'static str), Vec<Sample>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, node_id: u32, metric: &'static str, value: f64) {
        let timestamp = Utc::now().timestamp_millis() as f64 / 1000.0;
        self.series
            .lock()
            .entry((node_id, metric))
            .or_default()
            .push(Sample { timestamp, value });
    }

    pub fn record_messages_sent(&self, node_id: u32, count: u64) {
        self.record(node_id, "messages_sent", count as f64);
    }

    pub fn record_messages_received(&self, node_id: u32, count: u64) {
        self.record(node_id, "messages_received", count as f64);
    }

    pub fn record_latency(&self, node_id: u32, seconds: f64) {
        self.record(node_id, "latency_seconds", seconds);
    }

    /// Sample CPU/memory usage for `node_id`. The core never samples this
    /// itself (that belongs to an external collector); this entry point
    /// only exists so a collector can push readings into the same series
    /// store as everything else.
    pub fn record_cpu_memory(&self, node_id: u32, cpu_percent: f64, memory_mb: f64) {
        self.record(node_id, "cpu_percent", cpu_percent);
        self.record(node_id, "memory_mb", memory_mb);
    }

    pub fn series(&self, node_id: u32, metric: &'static str) -> Vec<Sample> {
        self.series
            .lock()
            .get(&(node_id, metric))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_per_node_and_metric() {
        let metrics = Metrics::new();
        metrics.record_messages_sent(0, 1);
        metrics.record_messages_sent(0, 2);
        metrics.record_messages_sent(1, 1);
        assert_eq!(metrics.series(0, "messages_sent").len(), 2);
        assert_eq!(metrics.series(1, "messages_sent").len(), 1);
    }

    #[test]
    fn cpu_memory_sample_writes_both_series() {
        let metrics = Metrics::new();
        metrics.record_cpu_memory(0, 12.5, 256.0);
        assert_eq!(metrics.series(0, "cpu_percent")[0].value, 12.5);
        assert_eq!(metrics.series(0, "memory_mb")[0].value, 256.0);
    }
}
