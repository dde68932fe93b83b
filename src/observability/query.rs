//! Query and subscription interface
//!
//! The only read path into the pipeline. Every result is a copy taken under
//! the owning ring's read lock (or the stats entry's lock), so callers never
//! observe a value under construction. Polling reads each ring once.

use crate::error::ObserverError;
use crate::observability::database::{EventDb, SessionInfo};
use crate::observability::health::HealthSnapshot;
use crate::observability::hub::DispatchHub;
use crate::observability::live::InFlightRequest;
use crate::observability::model::{
    EventKind, ExceptionEvent, ObservedEvent, RequestHit, RuntimeLogEntry,
};
use crate::observability::stats::{EndpointStats, StatsSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Largest page the query interface returns
pub const MAX_PAGE_SIZE: usize = 1000;

/// Newest-first paging
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: default_limit(),
        }
    }
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    fn limit(&self) -> usize {
        self.limit.min(MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Live,
    Durable,
}

/// Everything recorded for one correlation id
#[derive(Debug, Clone, Serialize)]
pub struct CorrelatedEvents {
    pub correlation_id: String,
    pub hit: Option<Arc<RequestHit>>,
    pub logs: Vec<Arc<RuntimeLogEntry>>,
    pub exceptions: Vec<Arc<ExceptionEvent>>,
    pub source: EventSource,
}

impl CorrelatedEvents {
    fn empty(correlation_id: &str, source: EventSource) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            hit: None,
            logs: Vec::new(),
            exceptions: Vec::new(),
            source,
        }
    }

    fn from_events(correlation_id: &str, events: Vec<ObservedEvent>) -> Self {
        let mut result = Self::empty(correlation_id, EventSource::Durable);
        for event in events {
            match event {
                ObservedEvent::Hit(hit) => result.hit = Some(hit),
                ObservedEvent::Log(entry) => result.logs.push(entry),
                ObservedEvent::Exception(exception) => result.exceptions.push(exception),
            }
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.hit.is_none() && self.logs.is_empty() && self.exceptions.is_empty()
    }
}

/// Point-in-time copy of all endpoint statistics
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub endpoints: Vec<EndpointStats>,
    pub summary: StatsSummary,
    pub taken_at: DateTime<Utc>,
}

/// Highest sequence id already seen, per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCursor {
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub logs: u64,
    #[serde(default)]
    pub exceptions: u64,
}

/// Events admitted after a cursor, oldest first, plus the cursor to poll with next
#[derive(Debug, Clone, Serialize)]
pub struct PollResult {
    pub hits: Vec<Arc<RequestHit>>,
    pub logs: Vec<Arc<RuntimeLogEntry>>,
    pub exceptions: Vec<Arc<ExceptionEvent>>,
    pub cursor: PollCursor,
}

impl PollResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty() && self.logs.is_empty() && self.exceptions.is_empty()
    }
}

#[derive(Clone)]
pub struct ObserverQuery {
    hub: Arc<DispatchHub>,
    db: Option<Arc<EventDb>>,
}

impl ObserverQuery {
    pub(crate) fn new(hub: Arc<DispatchHub>, db: Option<Arc<EventDb>>) -> Self {
        Self { hub, db }
    }

    pub fn recent_hits(&self, page: Page) -> Vec<Arc<RequestHit>> {
        self.hub.live().hits.newest(page.offset, page.limit())
    }

    pub fn recent_logs(&self, page: Page) -> Vec<Arc<RuntimeLogEntry>> {
        self.hub.live().logs.newest(page.offset, page.limit())
    }

    pub fn recent_exceptions(&self, page: Page) -> Vec<Arc<ExceptionEvent>> {
        self.hub.live().exceptions.newest(page.offset, page.limit())
    }

    /// Recent live events of one kind, newest first
    pub fn recent(&self, kind: EventKind, page: Page) -> Vec<ObservedEvent> {
        match kind {
            EventKind::Hit => self.recent_hits(page).into_iter().map(Into::into).collect(),
            EventKind::Log => self.recent_logs(page).into_iter().map(Into::into).collect(),
            EventKind::Exception => self
                .recent_exceptions(page)
                .into_iter()
                .map(Into::into)
                .collect(),
        }
    }

    /// Live events for one correlation id
    pub fn correlated(&self, correlation_id: &str) -> CorrelatedEvents {
        let live = self.hub.live();
        let hits = live.hits.filter(|h| h.correlation_id == correlation_id);
        CorrelatedEvents {
            correlation_id: correlation_id.to_string(),
            // A cycle records one hit; keep the newest if a caller submitted more
            hit: hits.into_iter().last(),
            logs: live
                .logs
                .filter(|e| e.correlation_id.as_deref() == Some(correlation_id)),
            exceptions: live
                .exceptions
                .filter(|e| e.correlation_id.as_deref() == Some(correlation_id)),
            source: EventSource::Live,
        }
    }

    /// Live events for one correlation id, falling back to durable history
    pub async fn correlated_or_history(
        &self,
        correlation_id: &str,
    ) -> Result<CorrelatedEvents, ObserverError> {
        let live = self.correlated(correlation_id);
        match &self.db {
            Some(db) if live.is_empty() => {
                let events = db.by_correlation(correlation_id).await?;
                Ok(CorrelatedEvents::from_events(correlation_id, events))
            }
            _ => Ok(live),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        let endpoints = self.hub.live().stats.snapshot();
        StatsSnapshot {
            summary: StatsSummary::from_endpoints(&endpoints),
            endpoints,
            taken_at: Utc::now(),
        }
    }

    pub fn endpoint_stats(&self, method: &str, path: &str) -> Option<EndpointStats> {
        self.hub.live().stats.get(method, path)
    }

    /// Live events admitted after `cursor`
    pub fn since(&self, cursor: PollCursor) -> PollResult {
        let live = self.hub.live();
        let hits = live.hits.after(cursor.hits, |h| h.sequence);
        let logs = live.logs.after(cursor.logs, |e| e.sequence);
        let exceptions = live.exceptions.after(cursor.exceptions, |e| e.sequence);

        let next = PollCursor {
            hits: hits.last().map_or(cursor.hits, |h| h.sequence),
            logs: logs.last().map_or(cursor.logs, |e| e.sequence),
            exceptions: exceptions.last().map_or(cursor.exceptions, |e| e.sequence),
        };

        PollResult {
            hits,
            logs,
            exceptions,
            cursor: next,
        }
    }

    /// Push notification of every admitted event
    pub fn subscribe(&self) -> broadcast::Receiver<ObservedEvent> {
        self.hub.subscribe()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.hub.health().snapshot()
    }

    pub fn in_flight(&self) -> Vec<InFlightRequest> {
        self.hub.live().in_flight()
    }

    pub fn has_history(&self) -> bool {
        self.db.is_some()
    }

    /// Most recent durable events of one kind, newest first
    pub async fn history(&self, kind: EventKind, limit: usize) -> Result<Vec<ObservedEvent>, ObserverError> {
        match &self.db {
            Some(db) => db.recent(kind, limit.min(MAX_PAGE_SIZE)).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, ObserverError> {
        match &self.db {
            Some(db) => db.list_sessions().await,
            None => Ok(Vec::new()),
        }
    }
}
