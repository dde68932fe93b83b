//! Live store: the in-memory view of what is happening right now

use crate::config::LiveConfig;
use crate::observability::model::{ExceptionEvent, ObservedEvent, RequestHit, RuntimeLogEntry};
use crate::observability::ring::RingBuffer;
use crate::observability::stats::StatsTable;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A request that has entered capture and not finished yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlightRequest {
    pub correlation_id: String,
    pub method: String,
    pub path: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct LiveStore {
    pub(crate) hits: RingBuffer<Arc<RequestHit>>,
    pub(crate) logs: RingBuffer<Arc<RuntimeLogEntry>>,
    pub(crate) exceptions: RingBuffer<Arc<ExceptionEvent>>,
    pub(crate) stats: StatsTable,
    pub(crate) in_flight: DashMap<String, InFlightRequest>,
}

impl LiveStore {
    pub(crate) fn new(config: &LiveConfig) -> Self {
        let max_age = (config.stats_max_age_secs > 0)
            .then(|| Duration::from_secs(config.stats_max_age_secs));
        Self {
            hits: RingBuffer::new(config.hits_capacity),
            logs: RingBuffer::new(config.logs_capacity),
            exceptions: RingBuffer::new(config.exceptions_capacity),
            stats: StatsTable::new(config.stats_window, max_age),
            in_flight: DashMap::new(),
        }
    }

    /// Put an already-sequenced event back into its ring (rehydration)
    pub(crate) fn restore(&self, event: ObservedEvent) {
        match event {
            ObservedEvent::Hit(hit) => {
                self.stats.record(&hit);
                self.hits.push(hit);
            }
            ObservedEvent::Log(entry) => {
                self.logs.push(entry);
            }
            ObservedEvent::Exception(exception) => {
                self.exceptions.push(exception);
            }
        }
    }

    pub(crate) fn begin_request(&self, request: InFlightRequest) {
        self.in_flight.insert(request.correlation_id.clone(), request);
    }

    pub(crate) fn end_request(&self, correlation_id: &str) {
        self.in_flight.remove(correlation_id);
    }

    /// Requests in flight, oldest first
    pub(crate) fn in_flight(&self) -> Vec<InFlightRequest> {
        let mut requests: Vec<InFlightRequest> =
            self.in_flight.iter().map(|entry| entry.value().clone()).collect();
        requests.sort_by_key(|r| r.started_at);
        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_rebuilds_stats() {
        let live = LiveStore::new(&LiveConfig::default());
        for status in [200, 200, 503] {
            let mut hit = RequestHit::new("GET", "/users", status, Duration::from_millis(4));
            hit.sequence = live.hits.len() as u64 + 1;
            live.restore(hit.into());
        }

        assert_eq!(live.hits.len(), 3);
        let stats = live.stats.get("GET", "/users").unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.error_count, 1);
    }

    #[test]
    fn test_in_flight_tracking() {
        let live = LiveStore::new(&LiveConfig::default());
        live.begin_request(InFlightRequest {
            correlation_id: "c1".into(),
            method: "GET".into(),
            path: "/slow".into(),
            started_at: Utc::now(),
        });

        assert_eq!(live.in_flight().len(), 1);
        live.end_request("c1");
        assert!(live.in_flight().is_empty());
    }
}
