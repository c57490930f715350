use ahash::AHashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Gauge: child processes currently holding an admission slot.
pub const RUNNING_APPS: &str = "running_apps";
/// Gauge: configured admission capacity.
pub const MAX_CONCURRENT_APPS: &str = "max_concurrent_apps";
/// Counter: spawn attempts, labelled by `result`.
pub const APP_SPAWNS_TOTAL: &str = "app_spawns_total";
/// Counter: WebSocket terminal sessions opened.
pub const TERMINAL_SESSIONS_TOTAL: &str = "terminal_sessions_total";
/// Histogram: wall-clock lifetime of a child process.
pub const APP_RUN_DURATION_SECONDS: &str = "app_run_duration_seconds";
/// Histogram: HTTP request latency.
pub const API_REQUEST_DURATION_SECONDS: &str = "api_request_duration_seconds";
/// Counter: HTTP requests, labelled by `method`, `path`, `status`.
pub const API_REQUESTS_TOTAL: &str = "api_requests_total";

/// Upper bounds for a histogram, picked by metric name.
fn bucket_bounds(name: &str) -> &'static [f64] {
    match name {
        // Apps run for seconds to hours.
        APP_RUN_DURATION_SECONDS => &[1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0],
        _ => &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
    }
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Per-bucket counts; made cumulative only when exported.
#[derive(Debug)]
struct Histogram {
    bounds: &'static [f64],
    hits: Vec<AtomicU64>,
    /// f64 bits.
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn for_metric(name: &str) -> Self {
        let bounds = bucket_bounds(name);
        Self {
            bounds,
            hits: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        if let Some(i) = self.bounds.iter().position(|le| value <= *le) {
            self.hits[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn write_prometheus(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {name} histogram");
        let mut cumulative = 0;
        for (le, hits) in self.bounds.iter().zip(&self.hits) {
            cumulative += hits.load(Ordering::Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{le}\"}} {cumulative}");
        }
        let count = self.count();
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(out, "{name}_sum {}", self.sum());
        let _ = writeln!(out, "{name}_count {count}");
    }
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Label pairs sorted by key, so the same set always names the same series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        pairs.sort();
        Self(pairs)
    }

    /// `{key="value",...}`, or nothing for an empty set.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
        format!("{{{}}}", inner.join(","))
    }

    fn series_name(&self, name: &str) -> String {
        format!("{name}{}", self.prometheus_str())
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

type CounterKey = (String, Labels);

/// Process-wide counters, gauges and histograms.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<CounterKey, AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

fn shared<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn exclusive<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(c) = shared(&self.counters).get(&key) {
            c.fetch_add(1, Ordering::Relaxed);
            return;
        }
        exclusive(&self.counters)
            .entry(key)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        shared(&self.counters)
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        if let Some(g) = shared(&self.gauges).get(name) {
            g.store(value, Ordering::Relaxed);
            return;
        }
        exclusive(&self.gauges)
            .entry(name.to_string())
            .or_default()
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        shared(&self.gauges)
            .get(name)
            .map_or(0, |g| g.load(Ordering::Relaxed))
    }

    /// Record one observation. Buckets are chosen by metric name on first use.
    pub fn record_histogram(&self, name: &str, value: f64) {
        if let Some(h) = shared(&self.histograms).get(name) {
            h.observe(value);
            return;
        }
        exclusive(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram::for_metric(name))
            .observe(value);
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        shared(&self.histograms)
            .get(name)
            .map_or(0, Histogram::count)
    }

    pub fn histogram_sum(&self, name: &str) -> f64 {
        shared(&self.histograms)
            .get(name)
            .map_or(0.0, Histogram::sum)
    }

    /// Prometheus text exposition format, every family sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let counters = shared(&self.counters);
            let mut series: Vec<(&CounterKey, u64)> = counters
                .iter()
                .map(|(key, c)| (key, c.load(Ordering::Relaxed)))
                .collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            let mut last: Option<&str> = None;
            for ((name, labels), value) in series {
                if last != Some(name.as_str()) {
                    let _ = writeln!(out, "# TYPE {name} counter");
                    last = Some(name.as_str());
                }
                let _ = writeln!(out, "{} {value}", labels.series_name(name));
            }
        }

        {
            let gauges = shared(&self.gauges);
            let mut names: Vec<&String> = gauges.keys().collect();
            names.sort();
            for name in names {
                let value = gauges[name].load(Ordering::Relaxed);
                let _ = writeln!(out, "# TYPE {name} gauge\n{name} {value}");
            }
        }

        {
            let histograms = shared(&self.histograms);
            let mut names: Vec<&String> = histograms.keys().collect();
            names.sort();
            for name in names {
                histograms[name].write_prometheus(name, &mut out);
            }
        }

        out
    }

    /// Counters (keyed by series name) and gauges as JSON.
    pub fn export_json(&self) -> serde_json::Value {
        let counters: serde_json::Map<String, serde_json::Value> = shared(&self.counters)
            .iter()
            .map(|((name, labels), c)| (labels.series_name(name), c.load(Ordering::Relaxed).into()))
            .collect();
        let gauges: serde_json::Map<String, serde_json::Value> = shared(&self.gauges)
            .iter()
            .map(|(name, g)| (name.clone(), g.load(Ordering::Relaxed).into()))
            .collect();
        serde_json::json!({ "counters": counters, "gauges": gauges })
    }
}

/// The collector every crate in the process records into.
pub fn global_metrics() -> &'static MetricsCollector {
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::new)
}
