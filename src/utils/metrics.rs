use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latency samples kept per stage
const MAX_LATENCY_SAMPLES: usize = 10_000;

/// Pipeline stage whose latency is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Detect,
    Extract,
    Classify,
    Request,
}

/// Failure kinds counted separately, one per error category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Fetch,
    Decode,
    Detection,
    Extraction,
    Classification,
}

/// Process-wide metrics collector.
///
/// Thread-safe and cheap to clone; every clone shares the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    requests_total: AtomicUsize,
    urls_processed: AtomicUsize,
    urls_failed: AtomicUsize,
    fetch_retries: AtomicUsize,

    fetch_failures: AtomicUsize,
    decode_failures: AtomicUsize,
    detection_failures: AtomicUsize,
    extraction_failures: AtomicUsize,
    classification_failures: AtomicUsize,

    regions_detected: AtomicUsize,
    banners_emitted: AtomicUsize,

    fetch_ms: RwLock<VecDeque<u64>>,
    detect_ms: RwLock<VecDeque<u64>>,
    extract_ms: RwLock<VecDeque<u64>>,
    classify_ms: RwLock<VecDeque<u64>>,
    request_ms: RwLock<VecDeque<u64>>,

    // Banners per label
    label_counters: DashMap<String, AtomicUsize>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                requests_total: AtomicUsize::new(0),
                urls_processed: AtomicUsize::new(0),
                urls_failed: AtomicUsize::new(0),
                fetch_retries: AtomicUsize::new(0),
                fetch_failures: AtomicUsize::new(0),
                decode_failures: AtomicUsize::new(0),
                detection_failures: AtomicUsize::new(0),
                extraction_failures: AtomicUsize::new(0),
                classification_failures: AtomicUsize::new(0),
                regions_detected: AtomicUsize::new(0),
                banners_emitted: AtomicUsize::new(0),
                fetch_ms: RwLock::new(VecDeque::new()),
                detect_ms: RwLock::new(VecDeque::new()),
                extract_ms: RwLock::new(VecDeque::new()),
                classify_ms: RwLock::new(VecDeque::new()),
                request_ms: RwLock::new(VecDeque::new()),
                label_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_request(&self, num_urls: usize, duration: Duration) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inner.urls_processed.fetch_add(num_urls, Ordering::Relaxed);
        self.record_duration(Stage::Request, duration);
    }

    pub fn record_url_failed(&self) {
        self.inner.urls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_retry(&self) {
        self.inner.fetch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::Fetch => &self.inner.fetch_failures,
            FailureKind::Decode => &self.inner.decode_failures,
            FailureKind::Detection => &self.inner.detection_failures,
            FailureKind::Extraction => &self.inner.extraction_failures,
            FailureKind::Classification => &self.inner.classification_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_regions_detected(&self, count: usize) {
        self.inner.regions_detected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_banner(&self, label: &str) {
        self.inner.banners_emitted.fetch_add(1, Ordering::Relaxed);
        self.inner
            .label_counters
            .entry(label.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duration(&self, stage: Stage, duration: Duration) {
        let samples = match stage {
            Stage::Fetch => &self.inner.fetch_ms,
            Stage::Detect => &self.inner.detect_ms,
            Stage::Extract => &self.inner.extract_ms,
            Stage::Classify => &self.inner.classify_ms,
            Stage::Request => &self.inner.request_ms,
        };
        let mut samples = samples.write();
        if samples.len() == MAX_LATENCY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(duration.as_millis() as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let request_ms = self.inner.request_ms.read();
        let request_avg = avg(&request_ms);
        let request_p50 = percentile(&request_ms, 0.5);
        let request_p95 = percentile(&request_ms, 0.95);
        let request_p99 = percentile(&request_ms, 0.99);
        drop(request_ms);

        let banners_by_label: BTreeMap<String, usize> = self
            .inner
            .label_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            requests_total: self.inner.requests_total.load(Ordering::Relaxed),
            urls_processed: self.inner.urls_processed.load(Ordering::Relaxed),
            urls_failed: self.inner.urls_failed.load(Ordering::Relaxed),
            fetch_retries: self.inner.fetch_retries.load(Ordering::Relaxed),
            fetch_failures: self.inner.fetch_failures.load(Ordering::Relaxed),
            decode_failures: self.inner.decode_failures.load(Ordering::Relaxed),
            detection_failures: self.inner.detection_failures.load(Ordering::Relaxed),
            extraction_failures: self.inner.extraction_failures.load(Ordering::Relaxed),
            classification_failures: self.inner.classification_failures.load(Ordering::Relaxed),
            regions_detected: self.inner.regions_detected.load(Ordering::Relaxed),
            banners_emitted: self.inner.banners_emitted.load(Ordering::Relaxed),
            banners_by_label,
            fetch_avg_ms: avg(&self.inner.fetch_ms.read()),
            detect_avg_ms: avg(&self.inner.detect_ms.read()),
            extract_avg_ms: avg(&self.inner.extract_ms.read()),
            classify_avg_ms: avg(&self.inner.classify_ms.read()),
            request_avg_ms: request_avg,
            request_p50_ms: request_p50,
            request_p95_ms: request_p95,
            request_p99_ms: request_p99,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP analyze_requests_total Total number of analyze requests
# TYPE analyze_requests_total counter
analyze_requests_total {}

# HELP analyze_urls_total Image URLs received
# TYPE analyze_urls_total counter
analyze_urls_total {}

# HELP analyze_urls_failed_total Image URLs that contributed no banners because of a failure
# TYPE analyze_urls_failed_total counter
analyze_urls_failed_total {}

# HELP fetch_retries_total Image fetch retries
# TYPE fetch_retries_total counter
fetch_retries_total {}

# HELP pipeline_failures_total Local pipeline failures by kind
# TYPE pipeline_failures_total counter
pipeline_failures_total{{kind="fetch"}} {}
pipeline_failures_total{{kind="decode"}} {}
pipeline_failures_total{{kind="detection"}} {}
pipeline_failures_total{{kind="extraction"}} {}
pipeline_failures_total{{kind="classification"}} {}

# HELP regions_detected_total Regions above the confidence threshold
# TYPE regions_detected_total counter
regions_detected_total {}

# HELP stage_avg_duration_ms Average stage duration in milliseconds
# TYPE stage_avg_duration_ms gauge
stage_avg_duration_ms{{stage="fetch"}} {}
stage_avg_duration_ms{{stage="detect"}} {}
stage_avg_duration_ms{{stage="extract"}} {}
stage_avg_duration_ms{{stage="classify"}} {}
stage_avg_duration_ms{{stage="request"}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {}

# HELP banners_emitted_total Banner records returned, by label
# TYPE banners_emitted_total counter
"#,
            snapshot.requests_total,
            snapshot.urls_processed,
            snapshot.urls_failed,
            snapshot.fetch_retries,
            snapshot.fetch_failures,
            snapshot.decode_failures,
            snapshot.detection_failures,
            snapshot.extraction_failures,
            snapshot.classification_failures,
            snapshot.regions_detected,
            snapshot.fetch_avg_ms,
            snapshot.detect_avg_ms,
            snapshot.extract_avg_ms,
            snapshot.classify_avg_ms,
            snapshot.request_avg_ms,
            snapshot.uptime_seconds,
        );

        for (label, count) in &snapshot.banners_by_label {
            out.push_str(&format!("banners_emitted_total{{label=\"{}\"}} {}\n", label, count));
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_total: usize,
    pub urls_processed: usize,
    pub urls_failed: usize,
    pub fetch_retries: usize,
    pub fetch_failures: usize,
    pub decode_failures: usize,
    pub detection_failures: usize,
    pub extraction_failures: usize,
    pub classification_failures: usize,
    pub regions_detected: usize,
    pub banners_emitted: usize,
    pub banners_by_label: BTreeMap<String, usize>,
    pub fetch_avg_ms: u64,
    pub detect_avg_ms: u64,
    pub extract_avg_ms: u64,
    pub classify_avg_ms: u64,
    pub request_avg_ms: u64,
    pub request_p50_ms: u64,
    pub request_p95_ms: u64,
    pub request_p99_ms: u64,
    pub uptime_seconds: u64,
}

fn percentile(values: &VecDeque<u64>, p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = values.iter().copied().collect();
    sorted.sort_unstable();
    let idx = ((sorted.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &VecDeque<u64>) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}
