//! Dispatch hub: the single admission point for every event
//!
//! `submit` runs synchronously on the caller's task:
//! validate → redact → sequence + live ring insert → stats update →
//! durable enqueue → subscriber broadcast.
//!
//! None of these steps block on I/O. Sequence ids are drawn while holding the
//! target ring's write lock, so each ring is strictly ordered by sequence and
//! events submitted in program order by one request keep that order.

use crate::config::{CaptureConfig, ObserverConfig};
use crate::error::ObserverError;
use crate::observability::context::{self, RequestContext};
use crate::observability::health::PipelineHealth;
use crate::observability::live::{InFlightRequest, LiveStore};
use crate::observability::model::{
    EventKind, ExceptionEvent, LogLevel, ObservedEvent, Payload, RequestHit, RuntimeLogEntry,
    Sequenced,
};
use crate::observability::panic;
use crate::observability::redaction::Redactor;
use crate::observability::ring::RingBuffer;
use crate::observability::writer::DurableWriter;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct DispatchHub {
    capture: CaptureConfig,
    excluded_methods: BTreeSet<String>,
    redactor: Redactor,
    live: Arc<LiveStore>,
    health: Arc<PipelineHealth>,
    durable: Option<Arc<DurableWriter>>,
    next_sequence: AtomicU64,
    events: broadcast::Sender<ObservedEvent>,
}

impl DispatchHub {
    pub(crate) fn new(
        config: &ObserverConfig,
        live: Arc<LiveStore>,
        health: Arc<PipelineHealth>,
        durable: Option<Arc<DurableWriter>>,
        first_sequence: u64,
    ) -> Self {
        let (events, _) = broadcast::channel(config.live.subscriber_buffer.max(1));
        Self {
            capture: config.capture.clone(),
            excluded_methods: config
                .capture
                .exclude_methods
                .iter()
                .map(|m| m.to_ascii_uppercase())
                .collect(),
            redactor: Redactor::new(&config.redaction),
            live,
            health,
            durable,
            next_sequence: AtomicU64::new(first_sequence.max(1)),
            events,
        }
    }

    /// Admit any event. Returns its sequence id, or `None` if its kind is disabled.
    pub fn submit(&self, event: ObservedEvent) -> Result<Option<u64>, ObserverError> {
        match event {
            ObservedEvent::Hit(hit) => self.submit_request_hit(Arc::unwrap_or_clone(hit)),
            ObservedEvent::Log(entry) => self.submit_runtime_log(Arc::unwrap_or_clone(entry)),
            ObservedEvent::Exception(exception) => {
                self.submit_exception(Arc::unwrap_or_clone(exception))
            }
        }
    }

    pub fn submit_request_hit(&self, mut hit: RequestHit) -> Result<Option<u64>, ObserverError> {
        if !self.capture.enable_request_logging {
            return Ok(None);
        }
        self.validate(EventKind::Hit, hit.validate())?;
        self.redactor.redact_hit(&mut hit);

        crate::metrics::record_request_duration(&hit.method, hit.route.as_deref(), hit.duration());
        let hit = self.insert(&self.live.hits, EventKind::Hit, hit);
        self.live.stats.record(&hit);

        Ok(Some(self.fan_out(ObservedEvent::Hit(hit))))
    }

    pub fn submit_runtime_log(&self, mut entry: RuntimeLogEntry) -> Result<Option<u64>, ObserverError> {
        if !self.capture.enable_runtime_logs {
            return Ok(None);
        }
        self.validate(EventKind::Log, entry.validate())?;
        self.redactor.redact_log(&mut entry);

        let entry = self.insert(&self.live.logs, EventKind::Log, entry);
        Ok(Some(self.fan_out(ObservedEvent::Log(entry))))
    }

    pub fn submit_exception(&self, exception: ExceptionEvent) -> Result<Option<u64>, ObserverError> {
        if !self.capture.enable_exceptions {
            return Ok(None);
        }
        self.validate(EventKind::Exception, exception.validate())?;

        let exception = self.insert(&self.live.exceptions, EventKind::Exception, exception);
        Ok(Some(self.fan_out(ObservedEvent::Exception(exception))))
    }

    /// Record a runtime log entry tied to the current request, if any
    pub fn emit_runtime_log(
        &self,
        payload: Payload,
        level: Option<LogLevel>,
    ) -> Result<Option<u64>, ObserverError> {
        let mut entry =
            RuntimeLogEntry::new(payload).with_correlation_id(context::current_correlation_id());
        entry.level = level;
        self.submit_runtime_log(entry)
    }

    /// Record an error the application handled itself.
    ///
    /// The message includes the error's `source()` chain. The trace is
    /// captured here; if no frames can be resolved it falls back to the
    /// caller's location. Endpoint and method default to the current request.
    #[track_caller]
    pub fn report_exception<E>(
        &self,
        error: &E,
        endpoint: Option<&str>,
        method: Option<&str>,
    ) -> Result<Option<u64>, ObserverError>
    where
        E: std::error::Error + ?Sized,
    {
        let location = std::panic::Location::caller();
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str("\ncaused by: ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        let ctx = RequestContext::current();
        let mut exception = ExceptionEvent::new(
            std::any::type_name::<E>(),
            message,
            panic::capture_frames(location),
        );
        exception.correlation_id = ctx.as_ref().map(|c| c.correlation_id().to_string());
        exception.endpoint = endpoint
            .map(String::from)
            .or_else(|| ctx.as_ref().map(|c| c.path().to_string()));
        exception.method = method
            .map(String::from)
            .or_else(|| ctx.as_ref().map(|c| c.method().to_string()));

        self.submit_exception(exception)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObservedEvent> {
        self.events.subscribe()
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    pub(crate) fn live(&self) -> &Arc<LiveStore> {
        &self.live
    }

    pub(crate) fn events(&self) -> &broadcast::Sender<ObservedEvent> {
        &self.events
    }

    pub(crate) fn capture_config(&self) -> &CaptureConfig {
        &self.capture
    }

    /// Whether a request bypasses capture entirely
    pub fn is_excluded(&self, method: &str, path: &str) -> bool {
        self.capture.exclude_paths.contains(path)
            || (!self.excluded_methods.is_empty()
                && self.excluded_methods.contains(&method.to_ascii_uppercase()))
    }

    pub(crate) fn begin_request(&self, request: InFlightRequest) {
        self.live.begin_request(request);
    }

    pub(crate) fn end_request(&self, correlation_id: &str) {
        self.live.end_request(correlation_id);
    }

    fn validate(&self, kind: EventKind, result: Result<(), ObserverError>) -> Result<(), ObserverError> {
        if let Err(e) = &result {
            self.health.record_rejected(kind, &e.to_string());
            tracing::debug!(kind = %kind, error = %e, "Rejected event at submission");
        }
        result
    }

    fn insert<T>(&self, ring: &RingBuffer<Arc<T>>, kind: EventKind, mut event: T) -> Arc<T>
    where
        T: Sequenced,
    {
        let (stored, evicted) = ring.push_with(|| {
            event.assign_sequence(self.next_sequence.fetch_add(1, Ordering::Relaxed));
            Arc::new(event)
        });
        if evicted.is_some() {
            self.health.record_live_eviction(kind);
        }
        stored
    }

    fn fan_out(&self, event: ObservedEvent) -> u64 {
        let sequence = event.sequence();
        self.health.record_admitted(event.kind());
        if let Some(durable) = &self.durable {
            durable.enqueue(event.clone());
        }
        // No subscribers is not an error
        let _ = self.events.send(event);
        sequence
    }
}
