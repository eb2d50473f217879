// Run metrics
//
// Process-wide counters, gauges and histograms for:
// - Run outcomes (completed, threw, timed out) and verdicts
// - Rejected and cancelled runs
// - Capture truncation and late emissions
// - Active runs and run duration

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::types::{OutcomeKind, Verdict};

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down, never below zero)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram bucket for latency tracking
#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Histogram metric for run durations
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    /// Buckets sized for interactive snippets: milliseconds up to the
    /// longest sensible timeout.
    pub fn new_latency() -> Self {
        let buckets = [0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 3.0, 10.0, 30.0]
            .into_iter()
            .map(|le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in self.buckets.iter().filter(|b| seconds <= b.le) {
            bucket.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn write_prometheus(&self, name: &str, help: &str, output: &mut String) {
        output.push_str(&format!("# HELP {name} {help}\n"));
        output.push_str(&format!("# TYPE {name} histogram\n"));
        for bucket in &self.buckets {
            output.push_str(&format!(
                "{name}_bucket{{le=\"{}\"}} {}\n",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "{name}_bucket{{le=\"+Inf\"}} {}\n",
            self.get_count()
        ));
        output.push_str(&format!(
            "{name}_sum {}\n",
            self.get_sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!("{name}_count {}\n", self.get_count()));
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    // Run outcomes
    pub runs_total: Counter,
    pub runs_completed: Counter,
    pub runs_threw: Counter,
    pub runs_timed_out: Counter,

    // Verdicts
    pub verdict_correct: Counter,
    pub verdict_incorrect: Counter,
    pub verdict_not_applicable: Counter,

    // Lifecycle
    pub runs_rejected: Counter,
    pub runs_cancelled: Counter,
    pub stale_results_discarded: Counter,
    pub worker_faults: Counter,

    // Capture
    pub capture_truncated: Counter,
    pub late_emissions_dropped: Counter,

    pub active_runs: Gauge,

    pub run_duration: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            runs_total: Counter::new(),
            runs_completed: Counter::new(),
            runs_threw: Counter::new(),
            runs_timed_out: Counter::new(),
            verdict_correct: Counter::new(),
            verdict_incorrect: Counter::new(),
            verdict_not_applicable: Counter::new(),
            runs_rejected: Counter::new(),
            runs_cancelled: Counter::new(),
            stale_results_discarded: Counter::new(),
            worker_faults: Counter::new(),
            capture_truncated: Counter::new(),
            late_emissions_dropped: Counter::new(),
            active_runs: Gauge::new(),
            run_duration: Histogram::new_latency(),
        }
    }

    /// Record how a run ended and how long it took
    pub fn record_outcome(&self, kind: OutcomeKind, elapsed: Duration) {
        self.runs_total.inc();
        match kind {
            OutcomeKind::Completed => self.runs_completed.inc(),
            OutcomeKind::Threw => self.runs_threw.inc(),
            OutcomeKind::TimedOut => self.runs_timed_out.inc(),
        }
        self.run_duration.observe(elapsed);
    }

    pub fn record_verdict(&self, verdict: Verdict) {
        match verdict {
            Verdict::Correct => self.verdict_correct.inc(),
            Verdict::Incorrect => self.verdict_incorrect.inc(),
            Verdict::NotApplicable => self.verdict_not_applicable.inc(),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP gradebox_runs_total Total number of finished runs\n");
        output.push_str("# TYPE gradebox_runs_total counter\n");
        output.push_str(&format!("gradebox_runs_total {}\n", self.runs_total.get()));

        output.push_str("# HELP gradebox_runs_by_outcome Finished runs by outcome\n");
        output.push_str("# TYPE gradebox_runs_by_outcome counter\n");
        for (outcome, counter) in [
            (OutcomeKind::Completed, &self.runs_completed),
            (OutcomeKind::Threw, &self.runs_threw),
            (OutcomeKind::TimedOut, &self.runs_timed_out),
        ] {
            output.push_str(&format!(
                "gradebox_runs_by_outcome{{outcome=\"{}\"}} {}\n",
                outcome,
                counter.get()
            ));
        }

        output.push_str("# HELP gradebox_verdicts_total Verdicts by result\n");
        output.push_str("# TYPE gradebox_verdicts_total counter\n");
        for (verdict, counter) in [
            (Verdict::Correct, &self.verdict_correct),
            (Verdict::Incorrect, &self.verdict_incorrect),
            (Verdict::NotApplicable, &self.verdict_not_applicable),
        ] {
            output.push_str(&format!(
                "gradebox_verdicts_total{{verdict=\"{}\"}} {}\n",
                verdict,
                counter.get()
            ));
        }

        for (name, help, counter) in [
            (
                "gradebox_runs_rejected_total",
                "Run requests rejected while another run was active",
                &self.runs_rejected,
            ),
            (
                "gradebox_runs_cancelled_total",
                "Runs cancelled by reset, cancel or session drop",
                &self.runs_cancelled,
            ),
            (
                "gradebox_stale_results_discarded_total",
                "Results that arrived for a superseded run",
                &self.stale_results_discarded,
            ),
            (
                "gradebox_worker_faults_total",
                "Host-side failures of the execution machinery",
                &self.worker_faults,
            ),
            (
                "gradebox_capture_truncated_total",
                "Runs whose capture hit its limit",
                &self.capture_truncated,
            ),
            (
                "gradebox_late_emissions_dropped_total",
                "Emissions dropped after a run's capture closed",
                &self.late_emissions_dropped,
            ),
        ] {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} counter\n"));
            output.push_str(&format!("{name} {}\n", counter.get()));
        }

        output.push_str("# HELP gradebox_active_runs Currently active runs\n");
        output.push_str("# TYPE gradebox_active_runs gauge\n");
        output.push_str(&format!("gradebox_active_runs {}\n", self.active_runs.get()));

        self.run_duration.write_prometheus(
            "gradebox_run_duration_seconds",
            "Wall time from launch to outcome",
            &mut output,
        );

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Get global metrics registry
pub fn get_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_gauge_never_underflows() {
        let gauge = Gauge::new();
        gauge.inc();
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.set(3);
        assert_eq!(gauge.get(), 3);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = Histogram::new_latency();
        histogram.observe(Duration::from_millis(3));
        histogram.observe(Duration::from_millis(200));

        assert_eq!(histogram.get_count(), 2);
        assert_eq!(histogram.get_sum_micros(), 203_000);
        assert_eq!(histogram.get_bucket_count(0.001), 0);
        assert_eq!(histogram.get_bucket_count(0.005), 1);
        assert_eq!(histogram.get_bucket_count(0.25), 2);
        assert_eq!(histogram.get_bucket_count(30.0), 2);
    }

    #[test]
    fn test_record_outcome_and_verdict() {
        let metrics = MetricsRegistry::new();
        metrics.record_outcome(OutcomeKind::Completed, Duration::from_millis(5));
        metrics.record_outcome(OutcomeKind::TimedOut, Duration::from_secs(3));
        metrics.record_verdict(Verdict::Correct);
        metrics.record_verdict(Verdict::NotApplicable);

        assert_eq!(metrics.runs_total.get(), 2);
        assert_eq!(metrics.runs_completed.get(), 1);
        assert_eq!(metrics.runs_timed_out.get(), 1);
        assert_eq!(metrics.verdict_correct.get(), 1);
        assert_eq!(metrics.verdict_not_applicable.get(), 1);
        assert_eq!(metrics.run_duration.get_count(), 2);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = MetricsRegistry::new();
        metrics.record_outcome(OutcomeKind::Threw, Duration::from_millis(2));
        metrics.runs_rejected.inc();

        let output = metrics.export_prometheus();
        assert!(output.contains("gradebox_runs_total 1"));
        assert!(output.contains("gradebox_runs_by_outcome{outcome=\"threw\"} 1"));
        assert!(output.contains("gradebox_runs_rejected_total 1"));
        assert!(output.contains("gradebox_run_duration_seconds_bucket{le=\"+Inf\"} 1"));
        assert!(output.contains("# TYPE gradebox_active_runs gauge"));
    }

    #[test]
    fn test_global_metrics_is_shared() {
        let a = get_metrics();
        let b = get_metrics();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
