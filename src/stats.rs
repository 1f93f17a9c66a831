//! Running statistics, decaying averages, and per-function metrics.
//!
//! Every latency sample in the engine is a millisecond value folded into a
//! [`Statistics`] series (Welford's online algorithm, so mean and variance
//! are exact without storing samples). The [`MetricsRegistry`] keeps two
//! copies of everything: a cumulative view that lives for the instance, and
//! a window view drained by the stats ticker on each emission.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Online mean/variance/min/max over a stream of samples.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    samples: u64,
    mean: f64,
    m2: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        self.samples += 1;
        let delta = value - self.mean;
        self.mean += delta / self.samples as f64;
        self.m2 += delta * (value - self.mean);
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Mean of all samples, 0.0 when empty.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation, 0.0 when empty.
    pub fn stdev(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            (self.m2 / self.samples as f64).sqrt()
        }
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn summary(&self) -> SeriesSummary {
        SeriesSummary {
            mean: self.mean(),
            stdev: self.stdev(),
            min: self.min,
            max: self.max,
            samples: self.samples,
        }
    }
}

/// Serializable snapshot of a [`Statistics`] series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSummary {
    pub mean: f64,
    pub stdev: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub samples: u64,
}

/// Exponentially decaying average. Empty until the first sample, which is
/// adopted verbatim; later samples are folded with the configured weight.
#[derive(Debug, Clone)]
pub struct DecayingAverage {
    value: Option<f64>,
    smoothing: f64,
}

impl DecayingAverage {
    pub fn new(smoothing: f64) -> Self {
        Self { value: None, smoothing }
    }

    pub fn update(&mut self, sample: f64) {
        self.value = Some(match self.value {
            None => sample,
            Some(prev) => self.smoothing * sample + (1.0 - self.smoothing) * prev,
        });
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Monotonic per-function counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FunctionCounters {
    pub invocations: u64,
    pub completed: u64,
    pub retries: u64,
    pub errors: u64,
}

/// Latency series tracked per function name.
#[derive(Debug, Clone, Default)]
pub struct FunctionStats {
    pub local_start_latency: Statistics,
    pub remote_start_latency: Statistics,
    pub execution_time: Statistics,
    pub send_response_latency: Statistics,
    pub return_latency: Statistics,
    pub estimated_billed_time: Statistics,
}

impl FunctionStats {
    pub fn summary(&self) -> FunctionStatsSummary {
        FunctionStatsSummary {
            local_start_latency: self.local_start_latency.summary(),
            remote_start_latency: self.remote_start_latency.summary(),
            execution_time: self.execution_time.summary(),
            send_response_latency: self.send_response_latency.summary(),
            return_latency: self.return_latency.summary(),
            estimated_billed_time: self.estimated_billed_time.summary(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatsSummary {
    pub local_start_latency: SeriesSummary,
    pub remote_start_latency: SeriesSummary,
    pub execution_time: SeriesSummary,
    pub send_response_latency: SeriesSummary,
    pub return_latency: SeriesSummary,
    pub estimated_billed_time: SeriesSummary,
}

/// Latency samples computed for one terminal call outcome. Absent fields are
/// simply not recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallLatencies {
    pub local_start_latency: Option<f64>,
    pub remote_start_latency: Option<f64>,
    pub execution_time: Option<f64>,
    pub send_response_latency: Option<f64>,
    pub return_latency: Option<f64>,
    pub estimated_billed_time: Option<f64>,
}

/// One per-function entry in a stats tick.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionStatsEvent {
    pub name: String,
    pub counters: FunctionCounters,
    pub stats: FunctionStatsSummary,
}

/// Round execution time up to 100 ms billing increments, 100 ms floor.
pub fn estimated_billed_ms(execution_ms: f64) -> f64 {
    ((execution_ms / 100.0).ceil() * 100.0).max(100.0)
}

#[derive(Debug, Default)]
struct FunctionMetrics {
    counters: FunctionCounters,
    stats: FunctionStats,
    // Local send-to-terminal elapsed, drives the speculative retry trigger.
    completion_latency: Statistics,
}

#[derive(Debug, Default)]
struct View {
    by_name: HashMap<String, FunctionMetrics>,
    aggregate: FunctionMetrics,
}

impl View {
    fn apply(&mut self, name: &str, f: impl Fn(&mut FunctionMetrics)) {
        f(self.by_name.entry(name.to_owned()).or_default());
        f(&mut self.aggregate);
    }
}

/// Per-function and aggregate counters/stats, cumulative plus a drainable
/// window for the stats ticker. All updates go through one mutex so readers
/// observe consistent snapshots.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cumulative: View,
    window: View,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, name: &str, f: impl Fn(&mut FunctionMetrics)) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.cumulative.apply(name, &f);
        inner.window.apply(name, &f);
    }

    pub fn record_invocation(&self, name: &str) {
        self.apply(name, |m| m.counters.invocations += 1);
    }

    pub fn record_retry(&self, name: &str) {
        self.apply(name, |m| m.counters.retries += 1);
    }

    pub fn record_completion(&self, name: &str) {
        self.apply(name, |m| m.counters.completed += 1);
    }

    pub fn record_error(&self, name: &str) {
        self.apply(name, |m| m.counters.errors += 1);
    }

    pub fn record_remote_start(&self, name: &str, sample_ms: f64) {
        self.apply(name, |m| m.stats.remote_start_latency.update(sample_ms));
    }

    pub fn record_completion_latency(&self, name: &str, elapsed_ms: f64) {
        self.apply(name, |m| m.completion_latency.update(elapsed_ms));
    }

    pub fn record_latencies(&self, name: &str, lat: &CallLatencies) {
        self.apply(name, |m| {
            if let Some(v) = lat.local_start_latency {
                m.stats.local_start_latency.update(v);
            }
            if let Some(v) = lat.remote_start_latency {
                m.stats.remote_start_latency.update(v);
            }
            if let Some(v) = lat.execution_time {
                m.stats.execution_time.update(v);
            }
            if let Some(v) = lat.send_response_latency {
                m.stats.send_response_latency.update(v);
            }
            if let Some(v) = lat.return_latency {
                m.stats.return_latency.update(v);
            }
            if let Some(v) = lat.estimated_billed_time {
                m.stats.estimated_billed_time.update(v);
            }
        });
    }

    /// `mean + sigma * stdev` of the completion latency for `name`, provided
    /// at least `min_samples` completions have been observed.
    pub fn speculative_threshold_ms(
        &self,
        name: &str,
        sigma: f64,
        min_samples: u64,
    ) -> Option<f64> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let series = &inner.cumulative.by_name.get(name)?.completion_latency;
        if series.samples() < min_samples {
            return None;
        }
        Some(series.mean() + sigma * series.stdev())
    }

    pub fn counters(&self, name: &str) -> FunctionCounters {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.cumulative.by_name.get(name).map(|m| m.counters).unwrap_or_default()
    }

    pub fn aggregate_counters(&self) -> FunctionCounters {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.cumulative.aggregate.counters
    }

    pub fn stats(&self, name: &str) -> Option<FunctionStatsSummary> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.cumulative.by_name.get(name).map(|m| m.stats.summary())
    }

    pub fn aggregate_stats(&self) -> FunctionStatsSummary {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.cumulative.aggregate.stats.summary()
    }

    /// Drain the window view into per-function events, resetting the window.
    /// Functions with no activity since the last drain are omitted.
    pub fn drain_window(&self) -> Vec<FunctionStatsEvent> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let window = std::mem::take(&mut inner.window);
        let mut events: Vec<FunctionStatsEvent> = window
            .by_name
            .into_iter()
            .filter(|(_, m)| m.counters != FunctionCounters::default() || m.stats_active())
            .map(|(name, m)| FunctionStatsEvent {
                name,
                counters: m.counters,
                stats: m.stats.summary(),
            })
            .collect();
        events.sort_by(|a, b| a.name.cmp(&b.name));
        events
    }
}

impl FunctionMetrics {
    fn stats_active(&self) -> bool {
        self.stats.execution_time.samples() > 0
            || self.stats.remote_start_latency.samples() > 0
            || self.stats.return_latency.samples() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_mean_and_stdev() {
        let mut s = Statistics::new();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            s.update(v);
        }
        assert_eq!(s.samples(), 8);
        assert!((s.mean() - 5.0).abs() < 1e-9);
        assert!((s.stdev() - 2.0).abs() < 1e-9);
        assert_eq!(s.min(), Some(2.0));
        assert_eq!(s.max(), Some(9.0));
    }

    #[test]
    fn statistics_empty_is_zero() {
        let s = Statistics::new();
        assert_eq!(s.mean(), 0.0);
        assert_eq!(s.stdev(), 0.0);
        assert_eq!(s.min(), None);
    }

    #[test]
    fn decaying_average_adopts_first_sample() {
        let mut avg = DecayingAverage::new(0.3);
        assert_eq!(avg.value(), None);
        avg.update(100.0);
        assert_eq!(avg.value(), Some(100.0));
        avg.update(200.0);
        assert!((avg.value().unwrap() - 130.0).abs() < 1e-9);
    }

    #[test]
    fn billed_time_rounds_up_with_floor() {
        assert_eq!(estimated_billed_ms(1.0), 100.0);
        assert_eq!(estimated_billed_ms(100.0), 100.0);
        assert_eq!(estimated_billed_ms(101.0), 200.0);
        assert_eq!(estimated_billed_ms(950.0), 1000.0);
    }

    #[test]
    fn registry_counters_are_monotonic_and_aggregated() {
        let reg = MetricsRegistry::new();
        reg.record_invocation("hello");
        reg.record_invocation("hello");
        reg.record_invocation("world");
        reg.record_completion("hello");
        reg.record_error("world");
        reg.record_retry("hello");

        let hello = reg.counters("hello");
        assert_eq!(hello.invocations, 2);
        assert_eq!(hello.completed, 1);
        assert_eq!(hello.retries, 1);
        let agg = reg.aggregate_counters();
        assert_eq!(agg.invocations, 3);
        assert_eq!(agg.errors, 1);
        assert!(agg.completed + agg.errors <= agg.invocations);
    }

    #[test]
    fn window_drains_and_resets_while_cumulative_persists() {
        let reg = MetricsRegistry::new();
        reg.record_invocation("f");
        reg.record_completion("f");

        let events = reg.drain_window();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].counters.invocations, 1);

        // Window resets; cumulative keeps the totals.
        assert!(reg.drain_window().is_empty());
        assert_eq!(reg.counters("f").invocations, 1);

        reg.record_invocation("f");
        let events = reg.drain_window();
        assert_eq!(events[0].counters.invocations, 1, "delta, not cumulative");
        assert_eq!(reg.counters("f").invocations, 2);
    }

    #[test]
    fn speculative_threshold_requires_min_samples() {
        let reg = MetricsRegistry::new();
        for _ in 0..4 {
            reg.record_completion_latency("f", 100.0);
        }
        assert_eq!(reg.speculative_threshold_ms("f", 3.0, 5), None);
        reg.record_completion_latency("f", 100.0);
        let threshold = reg.speculative_threshold_ms("f", 3.0, 5).unwrap();
        assert!((threshold - 100.0).abs() < 1e-9, "zero stdev keeps threshold at mean");
    }
}
