//! Counters and diagnostics describing the pipeline itself

use crate::observability::model::EventKind;
use crate::observability::ring::RingBuffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

const DIAGNOSTICS_CAPACITY: usize = 100;

/// A problem the pipeline hit while running, reported instead of raised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub sequence: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    pub hits: u64,
    pub logs: u64,
    pub exceptions: u64,
}

impl KindCounts {
    fn load(counters: &[AtomicU64; 3]) -> Self {
        Self {
            hits: counters[0].load(Ordering::Relaxed),
            logs: counters[1].load(Ordering::Relaxed),
            exceptions: counters[2].load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub admitted: KindCounts,
    pub rejected: KindCounts,
    /// Entries pushed out of the live rings by newer ones
    pub live_evicted: KindCounts,
    /// Events dropped because the durable queue was full
    pub durable_queue_dropped: u64,
    /// Events dropped after the durable store failed to persist them
    pub durable_failed: u64,
    pub persisted: u64,
    pub recent_diagnostics: Vec<Diagnostic>,
}

impl HealthSnapshot {
    /// Total events lost from any path
    pub fn dropped_total(&self) -> u64 {
        self.durable_queue_dropped + self.durable_failed
    }
}

#[derive(Debug)]
pub struct PipelineHealth {
    admitted: [AtomicU64; 3],
    rejected: [AtomicU64; 3],
    live_evicted: [AtomicU64; 3],
    durable_queue_dropped: AtomicU64,
    durable_failed: AtomicU64,
    persisted: AtomicU64,
    diagnostics: RingBuffer<Diagnostic>,
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            admitted: Default::default(),
            rejected: Default::default(),
            live_evicted: Default::default(),
            durable_queue_dropped: AtomicU64::new(0),
            durable_failed: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            diagnostics: RingBuffer::new(DIAGNOSTICS_CAPACITY),
        }
    }

    pub(crate) fn record_admitted(&self, kind: EventKind) {
        self.admitted[kind.index()].fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_admitted(kind);
    }

    pub(crate) fn record_rejected(&self, kind: EventKind, reason: &str) {
        self.rejected[kind.index()].fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_rejected(kind);
        self.diagnose("dispatch", reason, None);
    }

    pub(crate) fn record_live_eviction(&self, kind: EventKind) {
        self.live_evicted[kind.index()].fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_live_eviction(kind);
    }

    pub(crate) fn record_queue_drop(&self, sequence: u64) {
        let dropped = self.durable_queue_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        crate::metrics::record_durable_drop("queue_full");
        // Diagnose the first drop and every thousandth after it
        if dropped == 1 || dropped % 1000 == 0 {
            self.diagnose(
                "durable_queue",
                &format!("durable queue full, dropped oldest queued event ({} total)", dropped),
                Some(sequence),
            );
        }
    }

    pub(crate) fn record_durable_failure(&self, sequence: u64, error: &str) {
        self.durable_failed.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_durable_drop("write_failed");
        self.diagnose("durable_writer", error, Some(sequence));
    }

    pub(crate) fn record_persisted(&self, count: u64) {
        self.persisted.fetch_add(count, Ordering::Relaxed);
        crate::metrics::record_persisted(count);
    }

    pub(crate) fn diagnose(&self, source: &str, message: &str, sequence: Option<u64>) {
        self.diagnostics.push(Diagnostic {
            timestamp: Utc::now(),
            source: source.to_string(),
            message: message.to_string(),
            sequence,
        });
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            admitted: KindCounts::load(&self.admitted),
            rejected: KindCounts::load(&self.rejected),
            live_evicted: KindCounts::load(&self.live_evicted),
            durable_queue_dropped: self.durable_queue_dropped.load(Ordering::Relaxed),
            durable_failed: self.durable_failed.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            recent_diagnostics: self.diagnostics.newest(0, DIAGNOSTICS_CAPACITY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_per_kind() {
        let health = PipelineHealth::new();
        health.record_admitted(EventKind::Hit);
        health.record_admitted(EventKind::Hit);
        health.record_admitted(EventKind::Log);
        health.record_live_eviction(EventKind::Exception);

        let snapshot = health.snapshot();
        assert_eq!(snapshot.admitted.hits, 2);
        assert_eq!(snapshot.admitted.logs, 1);
        assert_eq!(snapshot.live_evicted.exceptions, 1);
        assert_eq!(snapshot.dropped_total(), 0);
    }

    #[test]
    fn test_durable_failure_records_diagnostic() {
        let health = PipelineHealth::new();
        health.record_durable_failure(42, "disk full");

        let snapshot = health.snapshot();
        assert_eq!(snapshot.durable_failed, 1);
        assert_eq!(snapshot.recent_diagnostics.len(), 1);
        assert_eq!(snapshot.recent_diagnostics[0].sequence, Some(42));
        assert_eq!(snapshot.recent_diagnostics[0].message, "disk full");
    }

    #[test]
    fn test_queue_drops_do_not_flood_diagnostics() {
        let health = PipelineHealth::new();
        for seq in 0..50 {
            health.record_queue_drop(seq);
        }

        let snapshot = health.snapshot();
        assert_eq!(snapshot.durable_queue_dropped, 50);
        assert_eq!(snapshot.recent_diagnostics.len(), 1);
    }
}
