//! Event model
//!
//! Typed records that flow through the pipeline. Every record carries a
//! sequence id assigned by the dispatch hub at admission; any value a producer
//! sets there is overwritten.

use crate::error::ObserverError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Free-form structured payload of a runtime log entry
pub type Payload = Map<String, Value>;

/// The three event kinds the pipeline stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Hit,
    Log,
    Exception,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Hit, EventKind::Log, EventKind::Exception];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Hit => "hit",
            EventKind::Log => "log",
            EventKind::Exception => "exception",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            EventKind::Hit => 0,
            EventKind::Log => 1,
            EventKind::Exception => 2,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ObserverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hit" | "hits" | "request" | "requests" => Ok(EventKind::Hit),
            "log" | "logs" => Ok(EventKind::Log),
            "exception" | "exceptions" | "error" | "errors" => Ok(EventKind::Exception),
            other => Err(ObserverError::InvalidEvent(format!("unknown event kind '{}'", other))),
        }
    }
}

/// Severity of a runtime log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

/// How a captured request cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitOutcome {
    /// Handler returned a response
    Completed,
    /// Handler panicked; recorded with status 500
    Failed,
    /// Cycle was dropped before the handler finished; recorded with status 499
    Cancelled,
}

/// A captured request or response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CapturedBody {
    /// Parsed structured body (JSON or url-encoded form)
    Json { value: Value },
    /// Text body, possibly cut at the capture limit
    Text {
        text: String,
        truncated: bool,
        /// Size of the original body in bytes
        size: usize,
    },
    /// Body not kept (binary, multipart)
    Omitted {
        content_type: Option<String>,
        size: usize,
    },
}

/// One request/response cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestHit {
    pub sequence: u64,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    /// Matched route template, when the router exposes one
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub client: Option<String>,
    pub status: u16,
    pub duration_us: u64,
    pub outcome: HitOutcome,
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub request_body: Option<CapturedBody>,
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub response_body: Option<CapturedBody>,
}

impl RequestHit {
    /// Create a completed hit with a fresh correlation id
    pub fn new(method: impl Into<String>, path: impl Into<String>, status: u16, duration: Duration) -> Self {
        Self {
            sequence: 0,
            correlation_id: crate::observability::context::new_correlation_id(),
            timestamp: Utc::now(),
            method: method.into(),
            path: path.into(),
            route: None,
            query: BTreeMap::new(),
            client: None,
            status,
            duration_us: duration.as_micros().min(u64::MAX as u128) as u64,
            outcome: HitOutcome::Completed,
            request_headers: BTreeMap::new(),
            request_body: None,
            response_headers: BTreeMap::new(),
            response_body: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Path used for statistics: the route template if known, else the concrete path
    pub fn endpoint(&self) -> &str {
        self.route.as_deref().unwrap_or(&self.path)
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.duration_us)
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration_us as f64 / 1000.0
    }

    pub(crate) fn validate(&self) -> Result<(), ObserverError> {
        if self.method.is_empty() || !self.method.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(ObserverError::InvalidEvent(format!(
                "request hit has invalid method '{}'",
                self.method
            )));
        }
        if !self.path.starts_with('/') {
            return Err(ObserverError::InvalidEvent(format!(
                "request hit path '{}' must start with '/'",
                self.path
            )));
        }
        if !(100..=599).contains(&self.status) {
            return Err(ObserverError::InvalidEvent(format!(
                "request hit has out-of-range status {}",
                self.status
            )));
        }
        if self.correlation_id.is_empty() {
            return Err(ObserverError::InvalidEvent(
                "request hit has empty correlation id".to_string(),
            ));
        }
        Ok(())
    }
}

/// Application-emitted log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeLogEntry {
    pub sequence: u64,
    /// Owning request, `None` when emitted outside any request
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: Option<LogLevel>,
    pub payload: Payload,
}

impl RuntimeLogEntry {
    pub fn new(payload: Payload) -> Self {
        Self {
            sequence: 0,
            correlation_id: None,
            timestamp: Utc::now(),
            level: None,
            payload,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// The `message` field of the payload, if it is a string
    pub fn message(&self) -> Option<&str> {
        self.payload.get("message").and_then(Value::as_str)
    }

    pub(crate) fn validate(&self) -> Result<(), ObserverError> {
        if self.payload.is_empty() {
            return Err(ObserverError::InvalidEvent("runtime log payload is empty".to_string()));
        }
        if matches!(&self.correlation_id, Some(id) if id.is_empty()) {
            return Err(ObserverError::InvalidEvent(
                "runtime log has empty correlation id".to_string(),
            ));
        }
        Ok(())
    }
}

/// One frame of a captured stack trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{} at {}:{}", self.function, file, line),
            (Some(file), None) => write!(f, "{} at {}", self.function, file),
            _ => f.write_str(&self.function),
        }
    }
}

/// An unhandled failure observed in the host application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionEvent {
    pub sequence: u64,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Classification, e.g. `panic` or an error type name
    pub kind: String,
    pub message: String,
    /// Innermost frame first
    pub frames: Vec<StackFrame>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

impl ExceptionEvent {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, frames: Vec<StackFrame>) -> Self {
        Self {
            sequence: 0,
            correlation_id: None,
            timestamp: Utc::now(),
            kind: kind.into(),
            message: message.into(),
            frames,
            endpoint: None,
            method: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ObserverError> {
        if self.kind.is_empty() {
            return Err(ObserverError::InvalidEvent("exception kind is empty".to_string()));
        }
        if self.frames.is_empty() {
            return Err(ObserverError::InvalidEvent("exception has no stack frames".to_string()));
        }
        Ok(())
    }
}

/// Records that carry a pipeline sequence id
pub(crate) trait Sequenced {
    fn sequence(&self) -> u64;
    fn assign_sequence(&mut self, sequence: u64);
}

macro_rules! impl_sequenced {
    ($($ty:ty),*) => {
        $(impl Sequenced for $ty {
            fn sequence(&self) -> u64 {
                self.sequence
            }

            fn assign_sequence(&mut self, sequence: u64) {
                self.sequence = sequence;
            }
        })*
    };
}

impl_sequenced!(RequestHit, RuntimeLogEntry, ExceptionEvent);

/// Any admitted event, shared by the live rings, subscribers and the durable queue.
/// Tagged with `event`; `kind` belongs to `ExceptionEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ObservedEvent {
    Hit(Arc<RequestHit>),
    Log(Arc<RuntimeLogEntry>),
    Exception(Arc<ExceptionEvent>),
}

impl ObservedEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ObservedEvent::Hit(_) => EventKind::Hit,
            ObservedEvent::Log(_) => EventKind::Log,
            ObservedEvent::Exception(_) => EventKind::Exception,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            ObservedEvent::Hit(e) => e.sequence,
            ObservedEvent::Log(e) => e.sequence,
            ObservedEvent::Exception(e) => e.sequence,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ObservedEvent::Hit(e) => Some(&e.correlation_id),
            ObservedEvent::Log(e) => e.correlation_id.as_deref(),
            ObservedEvent::Exception(e) => e.correlation_id.as_deref(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ObservedEvent::Hit(e) => e.timestamp,
            ObservedEvent::Log(e) => e.timestamp,
            ObservedEvent::Exception(e) => e.timestamp,
        }
    }
}

impl From<RequestHit> for ObservedEvent {
    fn from(hit: RequestHit) -> Self {
        ObservedEvent::Hit(Arc::new(hit))
    }
}

impl From<RuntimeLogEntry> for ObservedEvent {
    fn from(entry: RuntimeLogEntry) -> Self {
        ObservedEvent::Log(Arc::new(entry))
    }
}

impl From<ExceptionEvent> for ObservedEvent {
    fn from(event: ExceptionEvent) -> Self {
        ObservedEvent::Exception(Arc::new(event))
    }
}

impl From<Arc<RequestHit>> for ObservedEvent {
    fn from(hit: Arc<RequestHit>) -> Self {
        ObservedEvent::Hit(hit)
    }
}

impl From<Arc<RuntimeLogEntry>> for ObservedEvent {
    fn from(entry: Arc<RuntimeLogEntry>) -> Self {
        ObservedEvent::Log(entry)
    }
}

impl From<Arc<ExceptionEvent>> for ObservedEvent {
    fn from(event: Arc<ExceptionEvent>) -> Self {
        ObservedEvent::Exception(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_hit_validation() {
        let hit = RequestHit::new("GET", "/users", 200, Duration::from_millis(12));
        assert!(hit.validate().is_ok());
        assert_eq!(hit.duration_ms(), 12.0);

        let bad_method = RequestHit::new("", "/users", 200, Duration::ZERO);
        assert!(bad_method.validate().is_err());

        let bad_path = RequestHit::new("GET", "users", 200, Duration::ZERO);
        assert!(bad_path.validate().is_err());

        let bad_status = RequestHit::new("GET", "/users", 42, Duration::ZERO);
        assert!(bad_status.validate().is_err());
    }

    #[test]
    fn test_endpoint_prefers_route_template() {
        let mut hit = RequestHit::new("GET", "/users/7", 200, Duration::ZERO);
        assert_eq!(hit.endpoint(), "/users/7");
        hit.route = Some("/users/:id".to_string());
        assert_eq!(hit.endpoint(), "/users/:id");
    }

    #[test]
    fn test_empty_log_payload_rejected() {
        let entry = RuntimeLogEntry::new(Payload::new());
        assert!(entry.validate().is_err());
    }

    #[test]
    fn test_exception_requires_frames() {
        let event = ExceptionEvent::new("panic", "boom", Vec::new());
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_event_kind_parsing() {
        assert_eq!("hits".parse::<EventKind>().unwrap(), EventKind::Hit);
        assert_eq!("LOGS".parse::<EventKind>().unwrap(), EventKind::Log);
        assert_eq!("exceptions".parse::<EventKind>().unwrap(), EventKind::Exception);
        assert!("spans".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_observed_event_serializes_with_event_tag() {
        let mut payload = Payload::new();
        payload.insert("message".into(), json!("hello"));
        let event: ObservedEvent = RuntimeLogEntry::new(payload).with_level(LogLevel::Info).into();

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "log");
        assert_eq!(value["level"], "info");
        assert_eq!(value["payload"]["message"], "hello");

        let back: ObservedEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_exception_keeps_its_own_kind_when_tagged() {
        let mut exception = ExceptionEvent::new(
            "panic",
            "kaboom",
            vec![StackFrame {
                function: "handlers::boom".to_string(),
                file: Some("src/handlers.rs".to_string()),
                line: Some(9),
            }],
        );
        exception.endpoint = Some("/boom".to_string());
        let event: ObservedEvent = exception.into();

        let text = serde_json::to_string(&event).unwrap();
        assert_eq!(text.matches("\"kind\"").count(), 1);

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "exception");
        assert_eq!(value["kind"], "panic");

        let back: ObservedEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind(), EventKind::Exception);
        assert_eq!(back, event);
    }
}
