use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-operation call metrics for the job API, Prometheus text output
pub struct MetricsCollector {
    calls: DashMap<&'static str, AtomicU64>,
    failures: DashMap<&'static str, AtomicU64>,
    durations: DashMap<&'static str, Vec<u64>>, // last 100 durations for percentiles
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            failures: DashMap::new(),
            durations: DashMap::new(),
        }
    }

    pub fn record_call(&self, operation: &'static str, duration_ms: u64, ok: bool) {
        self.calls
            .entry(operation)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        if !ok {
            self.failures
                .entry(operation)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }

        let mut entry = self.durations.entry(operation).or_insert_with(Vec::new);
        entry.push(duration_ms);
        let len = entry.len();
        if len > 100 {
            entry.drain(0..len - 100);
        }
    }

    pub fn calls(&self, operation: &str) -> u64 {
        self.calls.get(operation).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn failures(&self, operation: &str) -> u64 {
        self.failures.get(operation).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Generate Prometheus-compatible metrics output
    pub fn export(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP jobgate_api_calls_total Total number of job API calls\n");
        output.push_str("# TYPE jobgate_api_calls_total counter\n");
        for entry in self.calls.iter() {
            output.push_str(&format!(
                "jobgate_api_calls_total{{operation=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }
        output.push('\n');

        output.push_str("# HELP jobgate_api_failures_total Total number of failed job API calls\n");
        output.push_str("# TYPE jobgate_api_failures_total counter\n");
        for entry in self.failures.iter() {
            output.push_str(&format!(
                "jobgate_api_failures_total{{operation=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }
        output.push('\n');

        output.push_str("# HELP jobgate_api_duration_ms Job API call duration percentiles\n");
        output.push_str("# TYPE jobgate_api_duration_ms gauge\n");
        for entry in self.durations.iter() {
            let mut durations = entry.value().clone();
            if durations.is_empty() {
                continue;
            }
            durations.sort_unstable();
            for (label, p) in [("0.5", 50.0), ("0.95", 95.0), ("0.99", 99.0)] {
                output.push_str(&format!(
                    "jobgate_api_duration_ms{{operation=\"{}\",quantile=\"{}\"}} {}\n",
                    entry.key(),
                    label,
                    percentile(&durations, p)
                ));
            }
        }

        output
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let index = ((p / 100.0) * (sorted_data.len() as f64 - 1.0)).round() as usize;
    sorted_data[index.min(sorted_data.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_calls_and_failures_per_operation() {
        let metrics = MetricsCollector::new();
        metrics.record_call("create_job", 3, true);
        metrics.record_call("create_job", 5, false);
        metrics.record_call("list_jobs", 1, true);

        assert_eq!(metrics.calls("create_job"), 2);
        assert_eq!(metrics.failures("create_job"), 1);
        assert_eq!(metrics.failures("list_jobs"), 0);
        assert_eq!(metrics.calls("inspect_job"), 0);

        let text = metrics.export();
        assert!(text.contains("jobgate_api_calls_total{operation=\"create_job\"} 2"));
        assert!(text.contains("jobgate_api_failures_total{operation=\"create_job\"} 1"));
        let median = "jobgate_api_duration_ms{operation=\"list_jobs\",quantile=\"0.5\"} 1";
        assert!(text.contains(median));
    }

    #[test]
    fn keeps_only_recent_durations() {
        let metrics = MetricsCollector::new();
        for ms in 0..150 {
            metrics.record_call("inspect_job", ms, true);
        }
        assert_eq!(metrics.durations.get("inspect_job").unwrap().len(), 100);
        assert_eq!(percentile(&[1, 2, 3], 50.0), 2);
        assert_eq!(percentile(&[], 99.0), 0);
    }
}
