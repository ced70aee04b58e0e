//! Process-level request counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters updated by the handlers
#[derive(Debug, Default)]
pub struct ServiceMetrics {
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
    images_processed: AtomicU64,
    images_failed: AtomicU64,
    batches_total: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// Point-in-time copy of [`ServiceMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub images_processed: u64,
    pub images_failed: u64,
    pub batches_total: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl ServiceMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_image_success(&self, input_bytes: usize, output_bytes: usize) {
        self.images_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(input_bytes as u64, Ordering::Relaxed);
        self.bytes_out.fetch_add(output_bytes as u64, Ordering::Relaxed);
    }

    pub fn record_image_failure(&self) {
        self.images_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            images_processed: self.images_processed.load(Ordering::Relaxed),
            images_failed: self.images_failed.load(Ordering::Relaxed),
            batches_total: self.batches_total.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = ServiceMetrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_batch();
        metrics.record_image_success(100, 40);
        metrics.record_image_failure();
        metrics.record_request_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.batches_total, 1);
        assert_eq!(snapshot.images_processed, 1);
        assert_eq!(snapshot.images_failed, 1);
        assert_eq!(snapshot.bytes_in, 100);
        assert_eq!(snapshot.bytes_out, 40);
    }
}
