//! Ambient, in-process counters. `lkstream` doesn't expose a metrics
//! endpoint of its own (the transport and export surface are out of scope),
//! but the broker still tracks the handful of numbers an operator embedding
//! this crate would want to read out — the same bare-counter style the
//! teacher keeps on its `SystemMetrics` before anything is wired to a
//! scrape endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    records_appended: AtomicU64,
    bytes_appended: AtomicU64,
    records_read: AtomicU64,
    backpressure_rejections: AtomicU64,
    segments_rotated: AtomicU64,
    segments_retained_deleted: AtomicU64,
}

impl Metrics {
    pub fn record_append(&self, count: u64, bytes: u64) {
        self.records_appended.fetch_add(count, Ordering::Relaxed);
        self.bytes_appended.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_read(&self, count: u64) {
        self.records_read.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_backpressure_rejection(&self) {
        self.backpressure_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_rotated(&self) {
        self.segments_rotated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_deleted(&self) {
        self.segments_retained_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_appended: self.records_appended.load(Ordering::Relaxed),
            bytes_appended: self.bytes_appended.load(Ordering::Relaxed),
            records_read: self.records_read.load(Ordering::Relaxed),
            backpressure_rejections: self.backpressure_rejections.load(Ordering::Relaxed),
            segments_rotated: self.segments_rotated.load(Ordering::Relaxed),
            segments_retained_deleted: self.segments_retained_deleted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub records_appended: u64,
    pub bytes_appended: u64,
    pub records_read: u64,
    pub backpressure_rejections: u64,
    pub segments_rotated: u64,
    pub segments_retained_deleted: u64,
}
