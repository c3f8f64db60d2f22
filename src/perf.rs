//! Per-operation timing.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Aggregated timings for one operation name.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OperationStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl OperationStats {
    fn new(elapsed: Duration) -> Self {
        Self {
            count: 1,
            total: elapsed,
            min: elapsed,
            max: elapsed,
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.min = self.min.min(elapsed);
        self.max = self.max.max(elapsed);
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((self.total.as_nanos() / u128::from(self.count)) as u64)
    }
}

/// Records how long named operations take. Shared across workers.
#[derive(Default)]
pub struct PerformanceMonitor {
    stats: Mutex<HashMap<String, OperationStats>>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time `f` under `name`. The closure's result is returned untouched.
    pub fn measure<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.record(name, start.elapsed());
        result
    }

    /// Async form of [`measure`](Self::measure).
    pub async fn measure_async<F: Future>(&self, name: &str, fut: F) -> F::Output {
        let start = Instant::now();
        let result = fut.await;
        self.record(name, start.elapsed());
        result
    }

    pub fn record(&self, name: &str, elapsed: Duration) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        match stats.get_mut(name) {
            Some(s) => s.record(elapsed),
            None => {
                stats.insert(name.to_string(), OperationStats::new(elapsed));
            }
        }
    }

    pub fn stats(&self, name: &str) -> Option<OperationStats> {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    /// Snapshot of every operation, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, OperationStats)> {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<_> = stats.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Human-readable summary, one line per operation.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for (name, s) in self.snapshot() {
            let _ = writeln!(
                out,
                "{}: count={} total={:.2}ms avg={:.2}ms min={:.2}ms max={:.2}ms",
                name,
                s.count,
                ms(s.total),
                ms(s.average()),
                ms(s.min),
                ms(s.max),
            );
        }
        out
    }

    pub fn reset(&self) {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_returns_result_unchanged() {
        let monitor = PerformanceMonitor::new();
        let out = monitor.measure("parse", || 41 + 1);
        assert_eq!(out, 42);

        let err: Result<(), String> = monitor.measure("parse", || Err("boom".to_string()));
        assert_eq!(err, Err("boom".to_string()));

        let stats = monitor.stats("parse").unwrap();
        assert_eq!(stats.count, 2);
        assert!(stats.min <= stats.max);
        assert!(stats.average() <= stats.max);
    }

    #[test]
    fn test_record_aggregates() {
        let monitor = PerformanceMonitor::new();
        monitor.record("op", Duration::from_millis(10));
        monitor.record("op", Duration::from_millis(30));
        let s = monitor.stats("op").unwrap();
        assert_eq!(s.count, 2);
        assert_eq!(s.total, Duration::from_millis(40));
        assert_eq!(s.average(), Duration::from_millis(20));
        assert_eq!(s.min, Duration::from_millis(10));
        assert_eq!(s.max, Duration::from_millis(30));
        assert!(monitor.stats("other").is_none());
    }

    #[test]
    fn test_average_with_count_beyond_u32() {
        let count = u64::from(u32::MAX) + 1;
        let stats = OperationStats {
            count,
            total: Duration::from_nanos(count * 3),
            min: Duration::from_nanos(1),
            max: Duration::from_nanos(5),
        };
        assert_eq!(stats.average(), Duration::from_nanos(3));
    }

    #[test]
    fn test_report_sorted() {
        let monitor = PerformanceMonitor::new();
        monitor.record("validate", Duration::from_millis(2));
        monitor.record("cache_lookup", Duration::from_millis(1));
        let report = monitor.report();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("cache_lookup: count=1 total=1.00ms"));
        assert!(lines[1].starts_with("validate:"));

        monitor.reset();
        assert!(monitor.report().is_empty());
    }

    #[tokio::test]
    async fn test_measure_async() {
        let monitor = PerformanceMonitor::new();
        let v = monitor
            .measure_async("sleep", async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                "done"
            })
            .await;
        assert_eq!(v, "done");
        assert!(monitor.stats("sleep").unwrap().total >= Duration::from_millis(5));
    }
}
