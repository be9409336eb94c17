//! In-process metrics registry with Prometheus text exposition.
//!
//! Counters, gauges, and histograms are keyed by `(name, labels)`. The
//! registry is process-wide; updates are atomic per series (one mutex guards
//! the registry, which is plenty at Squire's event rates).

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, OnceLock};

/// Upper bounds for duration histograms, in seconds. `+Inf` is implicit.
pub const DURATION_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0,
];

type Labels = BTreeMap<String, String>;

fn labels_of(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[derive(Debug, Clone)]
struct HistogramSeries {
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl HistogramSeries {
    fn new(bounds_len: usize) -> Self {
        Self {
            bucket_counts: vec![0; bounds_len],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, bounds: &[f64], value: f64) {
        for (i, bound) in bounds.iter().enumerate() {
            if value <= *bound {
                self.bucket_counts[i] += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

#[derive(Debug)]
struct HistogramFamily {
    bounds: Vec<f64>,
    series: BTreeMap<Labels, HistogramSeries>,
}

#[derive(Debug, Default)]
struct Inner {
    counters: BTreeMap<String, BTreeMap<Labels, u64>>,
    gauges: BTreeMap<String, BTreeMap<Labels, f64>>,
    histograms: BTreeMap<String, HistogramFamily>,
    help: BTreeMap<String, String>,
}

/// Registry of counters, gauges, and histograms.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    inner: Mutex<Inner>,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        let registry = Self::default();
        registry.register_defaults();
        registry
    }

    /// Pre-register Squire's standard series so scrapes always expose them.
    fn register_defaults(&self) {
        self.register_counter("squire_tasks_created_total", "Tasks created");
        self.register_counter("squire_tasks_completed_total", "Tasks completed");
        self.register_gauge("squire_tasks_running", "Tasks currently running");
        self.register_histogram(
            "squire_task_duration_seconds",
            "Task wall-clock duration",
            DURATION_BUCKETS,
        );
        self.register_counter("squire_container_starts_total", "Worker starts");
        self.register_counter("squire_api_requests_total", "API requests received");
        self.register_histogram(
            "squire_api_request_duration_seconds",
            "API request duration",
            DURATION_BUCKETS,
        );
    }

    pub fn register_counter(&self, name: &str, help: &str) {
        let mut inner = self.inner.lock().expect("metrics registry poisoned");
        inner.help.insert(name.to_string(), help.to_string());
        inner
            .counters
            .entry(name.to_string())
            .or_default()
            .entry(Labels::new())
            .or_insert(0);
    }

    pub fn register_gauge(&self, name: &str, help: &str) {
        let mut inner = self.inner.lock().expect("metrics registry poisoned");
        inner.help.insert(name.to_string(), help.to_string());
        inner
            .gauges
            .entry(name.to_string())
            .or_default()
            .entry(Labels::new())
            .or_insert(0.0);
    }

    pub fn register_histogram(&self, name: &str, help: &str, bounds: &[f64]) {
        let mut inner = self.inner.lock().expect("metrics registry poisoned");
        inner.help.insert(name.to_string(), help.to_string());
        inner
            .histograms
            .entry(name.to_string())
            .or_insert_with(|| HistogramFamily {
                bounds: bounds.to_vec(),
                series: BTreeMap::new(),
            });
    }

    pub fn inc_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.add_counter(name, labels, 1);
    }

    pub fn add_counter(&self, name: &str, labels: &[(&str, &str)], delta: u64) {
        let mut inner = self.inner.lock().expect("metrics registry poisoned");
        *inner
            .counters
            .entry(name.to_string())
            .or_default()
            .entry(labels_of(labels))
            .or_insert(0) += delta;
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut inner = self.inner.lock().expect("metrics registry poisoned");
        inner
            .gauges
            .entry(name.to_string())
            .or_default()
            .insert(labels_of(labels), value);
    }

    pub fn add_gauge(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let mut inner = self.inner.lock().expect("metrics registry poisoned");
        *inner
            .gauges
            .entry(name.to_string())
            .or_default()
            .entry(labels_of(labels))
            .or_insert(0.0) += delta;
    }

    /// Record one observation. Unregistered names get the duration buckets.
    pub fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut inner = self.inner.lock().expect("metrics registry poisoned");
        let family = inner
            .histograms
            .entry(name.to_string())
            .or_insert_with(|| HistogramFamily {
                bounds: DURATION_BUCKETS.to_vec(),
                series: BTreeMap::new(),
            });
        let bounds = family.bounds.clone();
        family
            .series
            .entry(labels_of(labels))
            .or_insert_with(|| HistogramSeries::new(bounds.len()))
            .observe(&bounds, value);
    }

    #[must_use]
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let inner = self.inner.lock().expect("metrics registry poisoned");
        inner
            .counters
            .get(name)
            .and_then(|series| series.get(&labels_of(labels)))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let inner = self.inner.lock().expect("metrics registry poisoned");
        inner
            .gauges
            .get(name)
            .and_then(|series| series.get(&labels_of(labels)))
            .copied()
            .unwrap_or(0.0)
    }

    /// Render the full registry in Prometheus text exposition format.
    ///
    /// Counters emit integer counts, gauges signed numbers; histogram
    /// buckets are cumulative, ordered by increasing `le`, and followed by
    /// `_sum` and `_count`. Labels are formatted sorted by key.
    #[must_use]
    pub fn export(&self) -> String {
        let inner = self.inner.lock().expect("metrics registry poisoned");
        let mut out = String::new();

        for (name, series) in &inner.counters {
            write_header(&mut out, &inner.help, name, "counter");
            for (labels, value) in series {
                let _ = writeln!(out, "{name}{} {value}", format_labels(labels));
            }
        }

        for (name, series) in &inner.gauges {
            write_header(&mut out, &inner.help, name, "gauge");
            for (labels, value) in series {
                let _ = writeln!(out, "{name}{} {value}", format_labels(labels));
            }
        }

        for (name, family) in &inner.histograms {
            write_header(&mut out, &inner.help, name, "histogram");
            for (labels, data) in &family.series {
                // bucket_counts are cumulative by construction (observe
                // increments every bucket whose bound covers the value).
                for (bound, bucket) in family.bounds.iter().zip(&data.bucket_counts) {
                    let _ = writeln!(
                        out,
                        "{name}_bucket{} {bucket}",
                        format_labels_with(labels, "le", &format_bound(*bound)),
                    );
                }
                let _ = writeln!(
                    out,
                    "{name}_bucket{} {}",
                    format_labels_with(labels, "le", "+Inf"),
                    data.count
                );
                let _ = writeln!(out, "{name}_sum{} {}", format_labels(labels), data.sum);
                let _ = writeln!(out, "{name}_count{} {}", format_labels(labels), data.count);
            }
        }

        out
    }

    /// Clear every series and restore the pre-registered defaults.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock().expect("metrics registry poisoned");
            *inner = Inner::default();
        }
        self.register_defaults();
    }
}

fn write_header(out: &mut String, help: &BTreeMap<String, String>, name: &str, kind: &str) {
    if let Some(text) = help.get(name) {
        let _ = writeln!(out, "# HELP {name} {text}");
    }
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn format_bound(bound: f64) -> String {
    // f64 Display gives "1" for 1.0 and "0.1" for 0.1, which is what the
    // exposition format expects.
    format!("{bound}")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_labels(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let body = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{body}}}")
}

fn format_labels_with(labels: &Labels, extra_key: &str, extra_value: &str) -> String {
    let mut all = labels.clone();
    all.insert(extra_key.to_string(), extra_value.to_string());
    format_labels(&all)
}

/// The process-wide registry.
pub fn metrics() -> &'static MetricsRegistry {
    static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();
    REGISTRY.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_export_integer_counts() {
        let registry = MetricsRegistry::new();
        registry.inc_counter("squire_tasks_created_total", &[]);
        registry.inc_counter("squire_tasks_created_total", &[]);

        let text = registry.export();
        assert!(text.contains("# TYPE squire_tasks_created_total counter"));
        assert!(text.contains("squire_tasks_created_total 2\n"));
    }

    #[test]
    fn labels_are_sorted_by_key() {
        let registry = MetricsRegistry::new();
        registry.inc_counter(
            "squire_api_requests_total",
            &[("status", "200"), ("method", "POST")],
        );

        let text = registry.export();
        assert!(
            text.contains(r#"squire_api_requests_total{method="POST",status="200"} 1"#),
            "unexpected export:\n{text}"
        );
    }

    #[test]
    fn gauges_track_signed_values() {
        let registry = MetricsRegistry::new();
        registry.add_gauge("squire_tasks_running", &[], 3.0);
        registry.add_gauge("squire_tasks_running", &[], -1.0);
        assert_eq!(registry.gauge_value("squire_tasks_running", &[]), 2.0);

        registry.set_gauge("squire_tasks_running", &[], -4.0);
        let text = registry.export();
        assert!(text.contains("squire_tasks_running -4\n"));
    }

    #[test]
    fn histogram_buckets_are_cumulative_and_monotone() {
        let registry = MetricsRegistry::new();
        for value in [0.05, 0.3, 0.7, 4.0, 45.0, 2000.0] {
            registry.observe_histogram("squire_task_duration_seconds", &[], value);
        }

        let text = registry.export();
        // |{v <= 0.1}| = 1, |{v <= 0.5}| = 2, |{v <= 1}| = 3, |{v <= 5}| = 4,
        // |{v <= 30}| = 4, |{v <= 60}| = 5, ... |{v <= 1800}| = 5, +Inf = 6.
        assert!(text.contains(r#"squire_task_duration_seconds_bucket{le="0.1"} 1"#));
        assert!(text.contains(r#"squire_task_duration_seconds_bucket{le="0.5"} 2"#));
        assert!(text.contains(r#"squire_task_duration_seconds_bucket{le="1"} 3"#));
        assert!(text.contains(r#"squire_task_duration_seconds_bucket{le="5"} 4"#));
        assert!(text.contains(r#"squire_task_duration_seconds_bucket{le="30"} 4"#));
        assert!(text.contains(r#"squire_task_duration_seconds_bucket{le="60"} 5"#));
        assert!(text.contains(r#"squire_task_duration_seconds_bucket{le="1800"} 5"#));
        assert!(text.contains(r#"squire_task_duration_seconds_bucket{le="+Inf"} 6"#));
        assert!(text.contains("squire_task_duration_seconds_count 6"));

        let sum: f64 = [0.05, 0.3, 0.7, 4.0, 45.0, 2000.0].iter().sum();
        assert!(text.contains(&format!("squire_task_duration_seconds_sum {sum}")));
    }

    #[test]
    fn reset_restores_preregistered_series() {
        let registry = MetricsRegistry::new();
        registry.inc_counter("squire_tasks_created_total", &[]);
        registry.reset();

        assert_eq!(registry.counter_value("squire_tasks_created_total", &[]), 0);
        let text = registry.export();
        assert!(text.contains("squire_tasks_created_total 0\n"));
        assert!(text.contains("# TYPE squire_api_request_duration_seconds histogram"));
    }
}
