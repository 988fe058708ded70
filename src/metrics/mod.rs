//! In-process metrics for the ledger service
//!
//! Counters, gauges and latency histograms keyed by dotted names, exported as
//! JSON or Prometheus text on `/metrics`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Global metrics registry
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    histograms: RwLock<BTreeMap<String, Arc<Histogram>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    pub async fn inc_counter(&self, name: &str) {
        if let Some(counter) = self.counters.read().await.get(name) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut counters = self.counters.write().await;
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub async fn set_gauge(&self, name: &str, value: u64) {
        if let Some(gauge) = self.gauges.read().await.get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }

        let mut gauges = self.gauges.write().await;
        gauges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .store(value, Ordering::Relaxed);
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .await
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record one observation, creating the histogram with latency buckets on first use.
    pub async fn observe_histogram(&self, name: &str, value: f64) {
        if let Some(histogram) = self.histograms.read().await.get(name) {
            histogram.observe(value);
            return;
        }

        let mut histograms = self.histograms.write().await;
        histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::default()))
            .observe(value);
    }

    /// Observation count of a histogram
    pub async fn histogram_count(&self, name: &str) -> u64 {
        self.histograms
            .read()
            .await
            .get(name)
            .map(|h| h.count())
            .unwrap_or(0)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let counters: BTreeMap<String, u64> = self
            .counters
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let gauges: BTreeMap<String, u64> = self
            .gauges
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let histograms: BTreeMap<String, serde_json::Value> = self
            .histograms
            .read()
            .await
            .iter()
            .map(|(k, h)| (k.clone(), h.to_json()))
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }

    /// Prometheus text exposition format
    pub async fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP mro_ledger_uptime_seconds Time since service start\n");
        output.push_str("# TYPE mro_ledger_uptime_seconds gauge\n");
        output.push_str(&format!(
            "mro_ledger_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        for (name, counter) in self.counters.read().await.iter() {
            let prometheus_name = prometheus_name(name);
            output.push_str(&format!("# TYPE {prometheus_name} counter\n"));
            output.push_str(&format!(
                "{prometheus_name} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }

        for (name, gauge) in self.gauges.read().await.iter() {
            let prometheus_name = prometheus_name(name);
            output.push_str(&format!("# TYPE {prometheus_name} gauge\n"));
            output.push_str(&format!(
                "{prometheus_name} {}\n",
                gauge.load(Ordering::Relaxed)
            ));
        }

        for (name, histogram) in self.histograms.read().await.iter() {
            output.push_str(&histogram.to_prometheus(name));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn prometheus_name(name: &str) -> String {
    name.replace(['.', '-', '/'], "_")
}

/// Fixed-bucket histogram; each observation lands in its first fitting bucket.
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// f64 bits
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        self.count.fetch_add(1, Ordering::Relaxed);

        if let Some(i) = self.buckets.iter().position(|bucket| value <= *bucket) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn to_json(&self) -> serde_json::Value {
        let bucket_counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();

        serde_json::json!({
            "buckets": self.buckets,
            "counts": bucket_counts,
            "sum": self.sum(),
            "count": self.count(),
        })
    }

    pub fn to_prometheus(&self, name: &str) -> String {
        let prometheus_name = prometheus_name(name);
        let mut output = format!("# TYPE {prometheus_name} histogram\n");

        let mut cumulative = 0u64;
        for (bucket, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            output.push_str(&format!(
                "{prometheus_name}_bucket{{le=\"{bucket}\"}} {cumulative}\n"
            ));
        }
        output.push_str(&format!(
            "{prometheus_name}_bucket{{le=\"+Inf\"}} {}\n",
            self.count()
        ));
        output.push_str(&format!("{prometheus_name}_sum {}\n", self.sum()));
        output.push_str(&format!("{prometheus_name}_count {}\n", self.count()));

        output
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // Latency buckets in seconds
        Self::new(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ])
    }
}

/// Predefined metric names
pub mod metric_names {
    // Ledger
    pub const LEDGER_APPENDS_OK: &str = "ledger.appends.ok";
    pub const LEDGER_APPENDS_FAILED: &str = "ledger.appends.failed";
    pub const LEDGER_APPENDS_REJECTED: &str = "ledger.appends.rejected";
    pub const LEDGER_DEAD_LETTERED: &str = "ledger.dead_lettered";
    pub const LEDGER_APPEND_LATENCY: &str = "ledger.append.latency_seconds";

    // Anchoring
    pub const ANCHORS_PUBLISHED: &str = "anchors.published";
    pub const ANCHORS_CONFIRMED: &str = "anchors.confirmed";
    pub const ANCHORS_FAILED: &str = "anchors.failed";
    /// Gauge, sampled on scrape
    pub const ANCHORS_PENDING: &str = "anchors.pending";

    // Dead letters
    /// Gauge, sampled on scrape
    pub const DEAD_LETTER_ENTRIES: &str = "dead_letter.entries";

    // Evidence
    pub const EVIDENCE_EXPORTS: &str = "evidence.exports";
    pub const EVIDENCE_VERIFICATIONS: &str = "evidence.verifications";

    // Verification aggregator
    pub const VERIFICATION_OK: &str = "verification.requests.ok";
    pub const VERIFICATION_FAIL: &str = "verification.requests.fail";
    pub const VERIFICATION_RATE_LIMITED: &str = "verification.rate_limited";
    pub const VERIFICATION_LATENCY: &str = "verification.latency_seconds";
    pub const VERIFICATION_AUTHZ_LATENCY: &str = "verification.authz_seconds";
    pub const VERIFICATION_LEDGER_LATENCY: &str = "verification.ledger_seconds";
    /// Suffixed with the skip reason
    pub const VERIFICATION_SKIPPED_PREFIX: &str = "verification.skipped.";
}

/// Time an async operation into a histogram
pub async fn timed<F, T>(metrics: &MetricsRegistry, metric_name: &str, f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = f.await;
    metrics
        .observe_histogram(metric_name, start.elapsed().as_secs_f64())
        .await;
    result
}
