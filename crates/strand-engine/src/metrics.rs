//! Processing instrumentation.
//!
//! One [`ProcessingMetrics`] instance exists per stream processor. All
//! metrics are atomics updated with relaxed ordering; readers take a
//! [`MetricsSnapshot`].

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use strand_types::Position;

/// Upper bounds of the processing latency buckets in microseconds.
const LATENCY_BUCKETS_US: [u64; 6] = [100, 500, 1_000, 5_000, 25_000, 100_000];

#[derive(Debug)]
pub struct ProcessingMetrics {
    // === Throughput Counters ===
    records_processed: AtomicU64,
    records_skipped: AtomicU64,
    records_blacklisted: AtomicU64,
    records_reprocessed: AtomicU64,
    processing_errors: AtomicU64,
    recoverable_retries: AtomicU64,
    side_effect_failures: AtomicU64,

    // === Latency Histogram ===
    /// Last bucket counts everything above the largest bound.
    latency_buckets: [AtomicU64; LATENCY_BUCKETS_US.len() + 1],
    latency_sum_us: AtomicU64,

    // === Position Gauges ===
    last_processed_position: AtomicI64,
    last_written_position: AtomicI64,
    /// Error path runs since the last successfully processed record.
    error_retries: AtomicU32,
}

impl Default for ProcessingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingMetrics {
    pub const fn new() -> Self {
        Self {
            records_processed: AtomicU64::new(0),
            records_skipped: AtomicU64::new(0),
            records_blacklisted: AtomicU64::new(0),
            records_reprocessed: AtomicU64::new(0),
            processing_errors: AtomicU64::new(0),
            recoverable_retries: AtomicU64::new(0),
            side_effect_failures: AtomicU64::new(0),
            latency_buckets: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            latency_sum_us: AtomicU64::new(0),
            last_processed_position: AtomicI64::new(-1),
            last_written_position: AtomicI64::new(-1),
            error_retries: AtomicU32::new(0),
        }
    }

    pub fn increment_processed(&self) {
        self.records_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_blacklisted(&self) {
        self.records_blacklisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reprocessed(&self) {
        self.records_reprocessed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_processing_errors(&self) {
        self.processing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_recoverable_retries(&self) {
        self.recoverable_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_side_effect_failures(&self) {
        self.side_effect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the time from reading a record to committing it.
    pub fn record_processing_latency(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let bucket = LATENCY_BUCKETS_US
            .iter()
            .position(|bound| us <= *bound)
            .unwrap_or(LATENCY_BUCKETS_US.len());
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn set_positions(&self, last_processed: Position, last_written: Position) {
        self.last_processed_position
            .store(last_processed.as_i64(), Ordering::Relaxed);
        self.last_written_position
            .store(last_written.as_i64(), Ordering::Relaxed);
    }

    pub fn set_error_retries(&self, retries: u32) {
        self.error_retries.store(retries, Ordering::Relaxed);
    }

    pub fn error_retries(&self) -> u32 {
        self.error_retries.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency_buckets = std::array::from_fn(|i| self.latency_buckets[i].load(Ordering::Relaxed));
        MetricsSnapshot {
            records_processed: self.records_processed.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            records_blacklisted: self.records_blacklisted.load(Ordering::Relaxed),
            records_reprocessed: self.records_reprocessed.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
            recoverable_retries: self.recoverable_retries.load(Ordering::Relaxed),
            side_effect_failures: self.side_effect_failures.load(Ordering::Relaxed),
            latency_count: latency_buckets.iter().sum(),
            latency_buckets,
            latency_sum_us: self.latency_sum_us.load(Ordering::Relaxed),
            last_processed_position: Position::new(
                self.last_processed_position.load(Ordering::Relaxed),
            ),
            last_written_position: Position::new(
                self.last_written_position.load(Ordering::Relaxed),
            ),
            error_retries: self.error_retries(),
        }
    }
}

/// Point-in-time copy of [`ProcessingMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub records_processed: u64,
    pub records_skipped: u64,
    pub records_blacklisted: u64,
    pub records_reprocessed: u64,
    pub processing_errors: u64,
    pub recoverable_retries: u64,
    pub side_effect_failures: u64,
    pub latency_buckets: [u64; LATENCY_BUCKETS_US.len() + 1],
    pub latency_count: u64,
    pub latency_sum_us: u64,
    pub last_processed_position: Position,
    pub last_written_position: Position,
    pub error_retries: u32,
}
