use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::trace::CaptureOptions;

/// Observer interface fed by the engine at every step boundary.
///
/// Labels are step display names. The engine does not depend on any
/// particular exporter; implementations decide where the numbers go.
pub trait MetricsSink: Send + Sync {
    fn record_processing(&self, step: &str, elapsed: Duration, errored: bool);
    fn record_total(&self, step: &str, elapsed: Duration, errored: bool);
    fn record_waiting(&self, step: &str, elapsed: Duration);
    fn step_started(&self, step: &str);
    fn step_finished(&self, step: &str);
    fn wait_started(&self, step: &str);
    fn wait_finished(&self, step: &str);
}

/// Sink that drops every event.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record_processing(&self, _step: &str, _elapsed: Duration, _errored: bool) {}
    fn record_total(&self, _step: &str, _elapsed: Duration, _errored: bool) {}
    fn record_waiting(&self, _step: &str, _elapsed: Duration) {}
    fn step_started(&self, _step: &str) {}
    fn step_finished(&self, _step: &str) {}
    fn wait_started(&self, _step: &str) {}
    fn wait_finished(&self, _step: &str) {}
}

/// Shared engine-wide context handed down to every running step.
#[derive(Clone)]
pub struct EngineContext {
    pub metrics: Arc<dyn MetricsSink>,
    pub capture: CaptureOptions,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self {
            metrics: Arc::new(NullSink),
            capture: CaptureOptions::default(),
        }
    }
}

/// Per-step aggregate counters with EWMA means and maxima.
#[derive(Debug, Clone, Default)]
pub struct StepStats {
    pub started: u64,
    pub finished: u64,
    pub errors: u64,
    pub in_flight: i64,
    pub waiting: i64,
    pub avg_processing_us: f32,
    pub max_processing_us: u64,
    pub avg_waiting_us: f32,
    pub max_waiting_us: u64,
    pub avg_total_us: f32,
    pub max_total_us: u64,
}

/// In-process default sink aggregating per-step timing statistics.
pub struct StatsCollector {
    stats: Mutex<HashMap<String, StepStats>>,
}

const ALPHA: f32 = 0.1; // EWMA smoothing factor

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, StepStats> {
        self.stats.lock().unwrap().clone()
    }

    fn with_entry(&self, step: &str, update: impl FnOnce(&mut StepStats)) {
        let mut stats = self.stats.lock().unwrap();
        update(stats.entry(step.to_owned()).or_default());
    }

    fn update_ewma(current: f32, new_value: u64) -> f32 {
        current * (1.0 - ALPHA) + new_value as f32 * ALPHA
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for StatsCollector {
    fn record_processing(&self, step: &str, elapsed: Duration, errored: bool) {
        let us = elapsed.as_micros() as u64;
        self.with_entry(step, |entry| {
            entry.avg_processing_us = Self::update_ewma(entry.avg_processing_us, us);
            entry.max_processing_us = entry.max_processing_us.max(us);
            if errored {
                entry.errors += 1;
            }
        });
    }

    fn record_total(&self, step: &str, elapsed: Duration, _errored: bool) {
        let us = elapsed.as_micros() as u64;
        self.with_entry(step, |entry| {
            entry.avg_total_us = Self::update_ewma(entry.avg_total_us, us);
            entry.max_total_us = entry.max_total_us.max(us);
        });
    }

    fn record_waiting(&self, step: &str, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.with_entry(step, |entry| {
            entry.avg_waiting_us = Self::update_ewma(entry.avg_waiting_us, us);
            entry.max_waiting_us = entry.max_waiting_us.max(us);
        });
    }

    fn step_started(&self, step: &str) {
        self.with_entry(step, |entry| {
            entry.started += 1;
            entry.in_flight += 1;
        });
    }

    fn step_finished(&self, step: &str) {
        self.with_entry(step, |entry| {
            entry.finished += 1;
            entry.in_flight -= 1;
        });
    }

    fn wait_started(&self, step: &str) {
        self.with_entry(step, |entry| entry.waiting += 1);
    }

    fn wait_finished(&self, step: &str) {
        self.with_entry(step, |entry| entry.waiting -= 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_tracks_in_flight_and_errors() {
        let collector = StatsCollector::new();
        collector.step_started("upper");
        collector.record_processing("upper", Duration::from_millis(5), true);
        collector.record_total("upper", Duration::from_millis(6), true);
        collector.step_finished("upper");

        let stats = collector.snapshot();
        let entry = stats.get("upper").unwrap();
        assert_eq!(entry.started, 1);
        assert_eq!(entry.finished, 1);
        assert_eq!(entry.errors, 1);
        assert_eq!(entry.in_flight, 0);
        assert!(entry.max_processing_us >= 5_000);
    }

    #[test]
    fn test_waiting_gauge_balances() {
        let collector = StatsCollector::new();
        collector.wait_started("locked");
        collector.wait_started("locked");
        collector.wait_finished("locked");
        let stats = collector.snapshot();
        assert_eq!(stats.get("locked").unwrap().waiting, 1);
    }
}
