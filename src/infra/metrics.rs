//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations so the control loop never contends
//! with the status endpoint. Reporting swaps the per-interval counters;
//! `snapshot` only reads, and serves the monotonic histogram to scrapes.
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries for frame processing latency (microseconds)
/// Buckets: ≤500, ≤1000, ≤2000, ... ≤256000, >256000
pub const METRICS_BUCKET_BOUNDS: [u64; 10] =
    [500, 1000, 2000, 4000, 8000, 16000, 32000, 64000, 128000, 256000];
pub const METRICS_NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] =
        [500, 1000, 2000, 4000, 8000, 16000, 32000, 64000, 128000, 256000, 512000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Frames analyzed successfully (monotonic)
    frames_total: AtomicU64,
    /// Frames since last report (reset on report)
    frames_since_report: AtomicU64,
    /// Sum of frame latencies (reset on report)
    frame_latency_sum_us: AtomicU64,
    /// Max frame latency (reset on report)
    frame_latency_max_us: AtomicU64,
    /// Frame latency histogram (reset on report)
    frame_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    /// Frame latency histogram (monotonic)
    frame_latency_buckets_total: [AtomicU64; METRICS_NUM_BUCKETS],
    /// Sum of all frame latencies (monotonic)
    frame_latency_sum_total_us: AtomicU64,
    /// Iterations that failed and backed off (monotonic)
    frame_errors_total: AtomicU64,
    /// Frames in which a single usable line was found (monotonic)
    lines_detected_total: AtomicU64,
    /// Snapshots written to the position slot (monotonic)
    positions_published_total: AtomicU64,
    /// registerClient calls (monotonic)
    clients_registered_total: AtomicU64,
    /// Currently streaming subscribers
    subscribers_active: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_total: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            frame_latency_sum_us: AtomicU64::new(0),
            frame_latency_max_us: AtomicU64::new(0),
            frame_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            frame_latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            frame_latency_sum_total_us: AtomicU64::new(0),
            frame_errors_total: AtomicU64::new(0),
            lines_detected_total: AtomicU64::new(0),
            positions_published_total: AtomicU64::new(0),
            clients_registered_total: AtomicU64::new(0),
            subscribers_active: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a frame analyzed with the given latency
    #[inline]
    pub fn record_frame_processed(&self, latency_us: u64) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.frame_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        let bucket = bucket_index(latency_us);
        self.frame_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.frame_latency_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);
        self.frame_latency_sum_total_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.frame_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_frame_error(&self) {
        self.frame_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_line_detected(&self) {
        self.lines_detected_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position_published(&self) {
        self.positions_published_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_client_registered(&self) {
        self.clients_registered_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_subscribers_active(&self, count: usize) {
        self.subscribers_active.store(count as u64, Ordering::Relaxed);
    }

    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    pub fn frame_errors_total(&self) -> u64 {
        self.frame_errors_total.load(Ordering::Relaxed)
    }

    pub fn positions_published_total(&self) -> u64 {
        self.positions_published_total.load(Ordering::Relaxed)
    }

    pub fn subscribers_active(&self) -> u64 {
        self.subscribers_active.load(Ordering::Relaxed)
    }

    /// Swap the per-interval counters and build a summary
    pub fn report(&self) -> MetricsSummary {
        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let frames = self.frames_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.frame_latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.frame_latency_max_us.swap(0, Ordering::Relaxed);
        let buckets = swap_buckets(&self.frame_latency_buckets);

        let secs = elapsed.as_secs_f64();
        MetricsSummary {
            frames_total: self.frames_total.load(Ordering::Relaxed),
            frames_per_sec: if secs > 0.0 { frames as f64 / secs } else { 0.0 },
            avg_frame_latency_us: if frames > 0 { latency_sum / frames } else { 0 },
            max_frame_latency_us: latency_max,
            lat_sum_us: latency_sum,
            lat_buckets: buckets,
            lat_p50_us: percentile_from_buckets(&buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&buckets, 0.99),
            frame_errors_total: self.frame_errors_total.load(Ordering::Relaxed),
            lines_detected_total: self.lines_detected_total.load(Ordering::Relaxed),
            positions_published_total: self.positions_published_total.load(Ordering::Relaxed),
            clients_registered_total: self.clients_registered_total.load(Ordering::Relaxed),
            subscribers_active: self.subscribers_active.load(Ordering::Relaxed),
        }
    }

    /// Read-only summary: cumulative latency histogram, rate and max for the
    /// interval in progress. Leaves the reporter's counters untouched.
    pub fn snapshot(&self) -> MetricsSummary {
        let elapsed = self.last_report_time.lock().elapsed();
        let frames = self.frames_since_report.load(Ordering::Relaxed);
        let frames_total = self.frames_total.load(Ordering::Relaxed);
        let latency_sum = self.frame_latency_sum_total_us.load(Ordering::Relaxed);

        let mut buckets = [0u64; METRICS_NUM_BUCKETS];
        for (i, bucket) in self.frame_latency_buckets_total.iter().enumerate() {
            buckets[i] = bucket.load(Ordering::Relaxed);
        }

        let secs = elapsed.as_secs_f64();
        MetricsSummary {
            frames_total,
            frames_per_sec: if secs > 0.0 { frames as f64 / secs } else { 0.0 },
            avg_frame_latency_us: if frames_total > 0 { latency_sum / frames_total } else { 0 },
            max_frame_latency_us: self.frame_latency_max_us.load(Ordering::Relaxed),
            lat_sum_us: latency_sum,
            lat_buckets: buckets,
            lat_p50_us: percentile_from_buckets(&buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&buckets, 0.99),
            frame_errors_total: self.frame_errors_total.load(Ordering::Relaxed),
            lines_detected_total: self.lines_detected_total.load(Ordering::Relaxed),
            positions_published_total: self.positions_published_total.load(Ordering::Relaxed),
            clients_registered_total: self.clients_registered_total.load(Ordering::Relaxed),
            subscribers_active: self.subscribers_active.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time metrics for logging and the status endpoint
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub frames_total: u64,
    pub frames_per_sec: f64,
    pub avg_frame_latency_us: u64,
    pub max_frame_latency_us: u64,
    pub lat_sum_us: u64,
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub frame_errors_total: u64,
    pub lines_detected_total: u64,
    pub positions_published_total: u64,
    pub clients_registered_total: u64,
    pub subscribers_active: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames_total = %self.frames_total,
            fps = %format!("{:.1}", self.frames_per_sec),
            avg_latency_us = %self.avg_frame_latency_us,
            max_latency_us = %self.max_frame_latency_us,
            p95_latency_us = %self.lat_p95_us,
            frame_errors = %self.frame_errors_total,
            lines_detected = %self.lines_detected_total,
            positions_published = %self.positions_published_total,
            subscribers = %self.subscribers_active,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(500), 0);
        assert_eq!(bucket_index(501), 1);
        assert_eq!(bucket_index(256000), 9);
        assert_eq!(bucket_index(1_000_000), 10);
    }

    #[test]
    fn test_percentile_from_buckets() {
        let mut buckets = [0u64; METRICS_NUM_BUCKETS];
        assert_eq!(percentile_from_buckets(&buckets, 0.5), 0);
        buckets[0] = 90;
        buckets[3] = 10;
        assert_eq!(percentile_from_buckets(&buckets, 0.5), 500);
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 4000);
    }

    #[test]
    fn test_report_resets_interval_counters() {
        let metrics = Metrics::new();
        metrics.record_frame_processed(300);
        metrics.record_frame_processed(700);
        metrics.record_position_published();
        metrics.record_frame_error();
        metrics.set_subscribers_active(2);

        let summary = metrics.report();
        assert_eq!(summary.frames_total, 2);
        assert_eq!(summary.avg_frame_latency_us, 500);
        assert_eq!(summary.max_frame_latency_us, 700);
        assert_eq!(summary.lat_buckets[0], 1);
        assert_eq!(summary.lat_buckets[1], 1);
        assert_eq!(summary.positions_published_total, 1);
        assert_eq!(summary.frame_errors_total, 1);
        assert_eq!(summary.subscribers_active, 2);

        let second = metrics.report();
        assert_eq!(second.frames_total, 2);
        assert_eq!(second.avg_frame_latency_us, 0);
        assert_eq!(second.lat_buckets.iter().sum::<u64>(), 0);
    }

    #[test]
    fn test_snapshot_leaves_report_intact() {
        let metrics = Metrics::new();
        metrics.record_frame_processed(300);
        metrics.record_frame_processed(700);

        let scrape = metrics.snapshot();
        assert_eq!(scrape.lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(scrape.lat_sum_us, 1000);
        assert_eq!(scrape.max_frame_latency_us, 700);
        assert_eq!(metrics.snapshot().lat_buckets, scrape.lat_buckets);

        let summary = metrics.report();
        assert_eq!(summary.lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(summary.max_frame_latency_us, 700);

        // Cumulative histogram keeps counting across reports
        metrics.record_frame_processed(1500);
        let scrape = metrics.snapshot();
        assert_eq!(scrape.lat_buckets.iter().sum::<u64>(), 3);
        assert_eq!(scrape.lat_sum_us, 2500);
        assert_eq!(scrape.avg_frame_latency_us, 833);
    }
}
