//! Prometheus-compatible counters for remote backend traffic.
//!
//! The worker is the only writer; producers and exporters read snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A single named counter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetric {
    /// The metric name.
    pub name: String,
    /// Help text describing the metric.
    pub help: String,
    /// Counter value.
    pub value: u64,
}

/// Lock-free statistics for one backend pipeline.
#[derive(Debug)]
pub struct BackendMetrics {
    /// Backend calls issued (puts, gets, lists, deletes).
    remote_calls: AtomicU64,
    /// Bytes handed to the backend.
    bytes_uploaded: AtomicU64,
    /// Bytes received from the backend.
    bytes_downloaded: AtomicU64,
    /// Failed attempts that were retried or exhausted.
    retry_attempts: AtomicU64,
}

impl BackendMetrics {
    /// Create a new BackendMetrics with all counters at zero.
    #[inline]
    pub fn new() -> Self {
        Self {
            remote_calls: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            retry_attempts: AtomicU64::new(0),
        }
    }

    /// Record one backend call.
    #[inline]
    pub fn record_remote_call(&self) {
        self.remote_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed upload of `bytes`.
    #[inline]
    pub fn record_upload(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a completed download of `bytes`.
    #[inline]
    pub fn record_download(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a failed attempt.
    #[inline]
    pub fn record_retry(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            remote_calls: self.remote_calls.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
        }
    }

    /// Collect all counters with Prometheus names and help text.
    pub fn collect(&self) -> Vec<RemoteMetric> {
        let snap = self.snapshot();
        vec![
            RemoteMetric {
                name: "dedupvault_remote_calls_total".to_string(),
                help: "Total backend calls issued by the worker".to_string(),
                value: snap.remote_calls,
            },
            RemoteMetric {
                name: "dedupvault_remote_bytes_uploaded_total".to_string(),
                help: "Total bytes uploaded to the backend".to_string(),
                value: snap.bytes_uploaded,
            },
            RemoteMetric {
                name: "dedupvault_remote_bytes_downloaded_total".to_string(),
                help: "Total bytes downloaded from the backend".to_string(),
                value: snap.bytes_downloaded,
            },
            RemoteMetric {
                name: "dedupvault_remote_retry_attempts_total".to_string(),
                help: "Total failed backend attempts".to_string(),
                value: snap.retry_attempts,
            },
        ]
    }
}

impl Default for BackendMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of [`BackendMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Backend calls issued.
    pub remote_calls: u64,
    /// Bytes uploaded.
    pub bytes_uploaded: u64,
    /// Bytes downloaded.
    pub bytes_downloaded: u64,
    /// Failed attempts.
    pub retry_attempts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_new_metrics_are_zero() {
        let m = BackendMetrics::new();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_records_accumulate() {
        let m = BackendMetrics::new();
        m.record_remote_call();
        m.record_remote_call();
        m.record_upload(100);
        m.record_upload(28);
        m.record_download(64);
        m.record_retry();

        let snap = m.snapshot();
        assert_eq!(snap.remote_calls, 2);
        assert_eq!(snap.bytes_uploaded, 128);
        assert_eq!(snap.bytes_downloaded, 64);
        assert_eq!(snap.retry_attempts, 1);
    }

    #[test]
    fn test_collect_uses_prometheus_names() {
        let m = BackendMetrics::new();
        m.record_upload(7);
        let metrics = m.collect();
        assert_eq!(metrics.len(), 4);
        assert!(metrics.iter().all(|x| x.name.starts_with("dedupvault_remote_")));
        assert!(metrics.iter().all(|x| x.name.ends_with("_total")));
        let uploaded = metrics
            .iter()
            .find(|x| x.name == "dedupvault_remote_bytes_uploaded_total")
            .unwrap();
        assert_eq!(uploaded.value, 7);
    }

    #[test]
    fn test_concurrent_updates() {
        let m = Arc::new(BackendMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_remote_call();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.snapshot().remote_calls, 4000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = BackendMetrics::new();
        m.record_download(3);
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"bytes_downloaded\":3"));
    }
}
