//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::Outcome;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Match lag bucket boundaries (milliseconds)
/// Buckets: ≤0, ≤100, ≤200, ≤300, ≤500, ≤750, ≤1000, ≤1500, ≤2000, ≤3000, >3000 ms
const LAG_BOUNDS: [u64; 10] = [0, 100, 200, 300, 500, 750, 1000, 1500, 2000, 3000];

/// Number of distinct decision outcomes
const NUM_OUTCOMES: usize = 6;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Compute bucket index for a match lag (ms) using binary search
#[inline]
fn lag_bucket_index(lag_ms: u64) -> usize {
    LAG_BOUNDS.partition_point(|&bound| bound < lag_ms)
}

#[inline]
fn outcome_index(outcome: Outcome) -> usize {
    match outcome {
        Outcome::Matched => 0,
        Outcome::Timeout => 1,
        Outcome::NoMatch => 2,
        Outcome::BindingConflict => 3,
        Outcome::NoRead => 4,
        Outcome::NoRule => 5,
    }
}

/// Outcomes in counter order (for reporting)
pub const OUTCOMES: [Outcome; NUM_OUTCOMES] = [
    Outcome::Matched,
    Outcome::Timeout,
    Outcome::NoMatch,
    Outcome::BindingConflict,
    Outcome::NoRead,
    Outcome::NoRule,
];

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

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Trigger signals admitted to the wait pool (monotonic)
    signals_admitted: AtomicU64,
    /// Trigger reports discarded because the id was already pending (monotonic)
    signals_duplicate: AtomicU64,
    /// Trigger reports dropped because the ingestion channel was full (monotonic)
    signals_dropped: AtomicU64,
    /// Parcel events consumed by the correlator (monotonic)
    parcels_total: AtomicU64,
    /// Parcels since last report (reset on report)
    parcels_since_report: AtomicU64,
    /// Decisions by outcome (monotonic)
    decisions: [AtomicU64; NUM_OUTCOMES],
    /// Correlation latency sum in microseconds (reset on report)
    correlate_sum_us: AtomicU64,
    /// Max correlation latency in microseconds (reset on report)
    correlate_max_us: AtomicU64,
    /// Correlation latency histogram buckets (reset on report)
    correlate_buckets: [AtomicU64; NUM_BUCKETS],
    /// Lag between signal and parcel for matched pairs, ms (cumulative)
    match_lag_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of matched lags, ms (cumulative, signed)
    match_lag_sum_ms: AtomicI64,
    /// Sort commands written to the device (monotonic)
    dispatch_sent: AtomicU64,
    /// Sort commands that failed on the transport (monotonic)
    dispatch_failed: AtomicU64,
    /// Decisions dropped because their window had elapsed (monotonic)
    dispatch_stale: AtomicU64,
    /// Decisions dropped because the dispatch queue was full (monotonic)
    decisions_dropped: AtomicU64,
    /// Dispatch queue delay histogram (time from enqueue to worker pickup)
    dispatch_queue_delay_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of dispatch queue delays (reset on report)
    dispatch_queue_delay_sum_us: AtomicU64,
    /// Max dispatch queue delay (reset on report)
    dispatch_queue_delay_max_us: AtomicU64,
    /// Parcel reads that waited for room in the correlation channel (monotonic)
    parcels_backpressured: AtomicU64,
    /// Malformed device frames dropped (monotonic)
    frames_malformed: AtomicU64,
    /// Command feedback frames received (monotonic)
    feedback_total: AtomicU64,
    /// Command feedback frames carrying a non-zero error code (monotonic)
    feedback_errors: AtomicU64,
    /// Successful device connections (monotonic)
    device_connects: AtomicU64,
    /// Sink notifications dropped because the queue was full (monotonic)
    sink_dropped: AtomicU64,
    /// Correlation units aborted on an internal invariant violation (monotonic)
    invariant_violations: AtomicU64,
    /// Current wait pool size (gauge)
    pool_size: AtomicU64,
    /// Parcels held waiting for a late signal (gauge)
    held_parcels: AtomicU64,
    /// Device connection state (gauge, 0/1)
    device_connected: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            signals_admitted: AtomicU64::new(0),
            signals_duplicate: AtomicU64::new(0),
            signals_dropped: AtomicU64::new(0),
            parcels_total: AtomicU64::new(0),
            parcels_since_report: AtomicU64::new(0),
            decisions: std::array::from_fn(|_| AtomicU64::new(0)),
            correlate_sum_us: AtomicU64::new(0),
            correlate_max_us: AtomicU64::new(0),
            correlate_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            match_lag_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            match_lag_sum_ms: AtomicI64::new(0),
            dispatch_sent: AtomicU64::new(0),
            dispatch_failed: AtomicU64::new(0),
            dispatch_stale: AtomicU64::new(0),
            decisions_dropped: AtomicU64::new(0),
            dispatch_queue_delay_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            dispatch_queue_delay_sum_us: AtomicU64::new(0),
            dispatch_queue_delay_max_us: AtomicU64::new(0),
            parcels_backpressured: AtomicU64::new(0),
            frames_malformed: AtomicU64::new(0),
            feedback_total: AtomicU64::new(0),
            feedback_errors: AtomicU64::new(0),
            device_connects: AtomicU64::new(0),
            sink_dropped: AtomicU64::new(0),
            invariant_violations: AtomicU64::new(0),
            pool_size: AtomicU64::new(0),
            held_parcels: AtomicU64::new(0),
            device_connected: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_signal_admitted(&self) {
        self.signals_admitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_signal_duplicate(&self) {
        self.signals_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_signal_dropped(&self) {
        self.signals_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a parcel was correlated with given latency (lock-free)
    #[inline]
    pub fn record_parcel_processed(&self, latency_us: u64) {
        self.parcels_total.fetch_add(1, Ordering::Relaxed);
        self.parcels_since_report.fetch_add(1, Ordering::Relaxed);
        self.correlate_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.correlate_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.correlate_max_us, latency_us);
    }

    /// Record a decision by outcome (lock-free)
    #[inline]
    pub fn record_decision(&self, outcome: Outcome) {
        self.decisions[outcome_index(outcome)].fetch_add(1, Ordering::Relaxed);
    }

    /// Record the signal-to-parcel lag of a matched pair
    #[inline]
    pub fn record_match_lag(&self, lag_ms: i64) {
        let bucket = lag_bucket_index(lag_ms.max(0) as u64);
        self.match_lag_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.match_lag_sum_ms.fetch_add(lag_ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dispatch_sent(&self) {
        self.dispatch_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dispatch_failed(&self) {
        self.dispatch_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dispatch_stale(&self) {
        self.dispatch_stale.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decision dropped due to dispatch queue full (lock-free)
    #[inline]
    pub fn record_decision_dropped(&self) {
        self.decisions_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record dispatch queue delay (time from enqueue to worker pickup)
    #[inline]
    pub fn record_dispatch_queue_delay(&self, delay_us: u64) {
        self.dispatch_queue_delay_buckets[bucket_index(delay_us)].fetch_add(1, Ordering::Relaxed);
        self.dispatch_queue_delay_sum_us.fetch_add(delay_us, Ordering::Relaxed);
        update_atomic_max(&self.dispatch_queue_delay_max_us, delay_us);
    }

    #[inline]
    pub fn record_parcel_backpressure(&self) {
        self.parcels_backpressured.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_feedback(&self, error_code: u8) {
        self.feedback_total.fetch_add(1, Ordering::Relaxed);
        if error_code != 0 {
            self.feedback_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_device_connected(&self, connected: bool) {
        if connected {
            self.device_connects.fetch_add(1, Ordering::Relaxed);
        }
        self.device_connected.store(connected as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sink_dropped(&self) {
        self.sink_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invariant_violation(&self) {
        self.invariant_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Set current wait pool size (called on admit/claim)
    #[inline]
    pub fn set_pool_size(&self, size: usize) {
        self.pool_size.store(size as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_held_parcels(&self, count: usize) {
        self.held_parcels.store(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn decisions_total(&self, outcome: Outcome) -> u64 {
        self.decisions[outcome_index(outcome)].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn signals_admitted(&self) -> u64 {
        self.signals_admitted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn signals_duplicate(&self) -> u64 {
        self.signals_duplicate.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_malformed(&self) -> u64 {
        self.frames_malformed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dispatch_sent(&self) -> u64 {
        self.dispatch_sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dispatch_failed(&self) -> u64 {
        self.dispatch_failed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dispatch_stale(&self) -> u64 {
        self.dispatch_stale.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn decisions_dropped(&self) -> u64 {
        self.decisions_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn device_connected(&self) -> bool {
        self.device_connected.load(Ordering::Relaxed) != 0
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let parcels_count = self.parcels_since_report.swap(0, Ordering::Relaxed);
        let correlate_sum = self.correlate_sum_us.swap(0, Ordering::Relaxed);
        let correlate_max = self.correlate_max_us.swap(0, Ordering::Relaxed);
        let correlate_buckets = swap_buckets(&self.correlate_buckets);

        let queue_delay_buckets = swap_buckets(&self.dispatch_queue_delay_buckets);
        let queue_delay_sum = self.dispatch_queue_delay_sum_us.swap(0, Ordering::Relaxed);
        let queue_delay_max = self.dispatch_queue_delay_max_us.swap(0, Ordering::Relaxed);
        let queue_delay_count: u64 = queue_delay_buckets.iter().sum();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let parcels_per_sec = if elapsed.as_secs_f64() > 0.0 {
            parcels_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let mut decisions = [0u64; NUM_OUTCOMES];
        for (i, counter) in self.decisions.iter().enumerate() {
            decisions[i] = counter.load(Ordering::Relaxed);
        }

        MetricsSummary {
            signals_admitted: self.signals_admitted.load(Ordering::Relaxed),
            signals_duplicate: self.signals_duplicate.load(Ordering::Relaxed),
            signals_dropped: self.signals_dropped.load(Ordering::Relaxed),
            parcels_total: self.parcels_total.load(Ordering::Relaxed),
            parcels_per_sec,
            decisions,
            correlate_buckets,
            correlate_avg_us: if parcels_count > 0 { correlate_sum / parcels_count } else { 0 },
            correlate_max_us: correlate_max,
            correlate_p99_us: percentile_from_buckets(&correlate_buckets, 0.99),
            match_lag_buckets: load_buckets(&self.match_lag_buckets),
            match_lag_sum_ms: self.match_lag_sum_ms.load(Ordering::Relaxed),
            dispatch_sent: self.dispatch_sent.load(Ordering::Relaxed),
            dispatch_failed: self.dispatch_failed.load(Ordering::Relaxed),
            dispatch_stale: self.dispatch_stale.load(Ordering::Relaxed),
            decisions_dropped: self.decisions_dropped.load(Ordering::Relaxed),
            dispatch_queue_delay_buckets: queue_delay_buckets,
            dispatch_queue_delay_avg_us: if queue_delay_count > 0 {
                queue_delay_sum / queue_delay_count
            } else {
                0
            },
            dispatch_queue_delay_max_us: queue_delay_max,
            dispatch_queue_delay_p99_us: percentile_from_buckets(&queue_delay_buckets, 0.99),
            parcels_backpressured: self.parcels_backpressured.load(Ordering::Relaxed),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
            feedback_total: self.feedback_total.load(Ordering::Relaxed),
            feedback_errors: self.feedback_errors.load(Ordering::Relaxed),
            device_connects: self.device_connects.load(Ordering::Relaxed),
            sink_dropped: self.sink_dropped.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
            pool_size: self.pool_size.load(Ordering::Relaxed),
            held_parcels: self.held_parcels.load(Ordering::Relaxed),
            device_connected: self.device_connected.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for the Prometheus endpoint)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_LAG_BOUNDS: [u64; 10] = LAG_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub signals_admitted: u64,
    pub signals_duplicate: u64,
    pub signals_dropped: u64,
    pub parcels_total: u64,
    pub parcels_per_sec: f64,
    /// Decisions by outcome, indexed like `OUTCOMES`
    pub decisions: [u64; NUM_OUTCOMES],
    /// Correlation latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub correlate_buckets: [u64; NUM_BUCKETS],
    pub correlate_avg_us: u64,
    pub correlate_max_us: u64,
    pub correlate_p99_us: u64,
    /// Matched pair lag histogram (ms), bounds in `METRICS_LAG_BOUNDS`
    pub match_lag_buckets: [u64; NUM_BUCKETS],
    /// Signed sum of matched lags (ms)
    pub match_lag_sum_ms: i64,
    pub dispatch_sent: u64,
    pub dispatch_failed: u64,
    pub dispatch_stale: u64,
    pub decisions_dropped: u64,
    pub dispatch_queue_delay_buckets: [u64; NUM_BUCKETS],
    pub dispatch_queue_delay_avg_us: u64,
    pub dispatch_queue_delay_max_us: u64,
    pub dispatch_queue_delay_p99_us: u64,
    pub parcels_backpressured: u64,
    pub frames_malformed: u64,
    pub feedback_total: u64,
    pub feedback_errors: u64,
    pub device_connects: u64,
    pub sink_dropped: u64,
    pub invariant_violations: u64,
    pub pool_size: u64,
    pub held_parcels: u64,
    pub device_connected: u64,
}

impl MetricsSummary {
    pub fn decisions_for(&self, outcome: Outcome) -> u64 {
        self.decisions[outcome_index(outcome)]
    }

    pub fn log(&self) {
        info!(
            signals = %self.signals_admitted,
            duplicates = %self.signals_duplicate,
            parcels = %self.parcels_total,
            parcels_per_sec = format!("{:.1}", self.parcels_per_sec),
            matched = %self.decisions_for(Outcome::Matched),
            timeout = %self.decisions_for(Outcome::Timeout),
            no_match = %self.decisions_for(Outcome::NoMatch),
            no_read = %self.decisions_for(Outcome::NoRead),
            conflicts = %self.decisions_for(Outcome::BindingConflict),
            correlate_p99_us = %self.correlate_p99_us,
            dispatch_sent = %self.dispatch_sent,
            dispatch_failed = %self.dispatch_failed,
            pool_size = %self.pool_size,
            device_connected = %self.device_connected,
            "metrics"
        );
    }
}
