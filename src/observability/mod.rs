//! Event capture and observation pipeline
//!
//! Captures request/response cycles, application runtime logs and handler
//! panics, keeps a bounded live picture of them in memory and persists a copy
//! to SQLite in the background.
//!
//! ## Architecture
//!
//! ```text
//! capture interceptor ──┐
//! log sink / tracing ───┼──> DispatchHub::submit ──> redact ──> LiveStore (rings + stats)
//! report_exception ─────┘                    │                     │
//!                                            │                     └──> ObserverQuery / HTTP API
//!                                            ├──> broadcast (push subscribers)
//!                                            └──> DurableWriter queue ──> EventDb (SQLite)
//! ```
//!
//! The admission path never performs I/O. Only the durable writer's single
//! background task touches the database, and its failures are counted in
//! [`PipelineHealth`] instead of reaching the host application.

pub mod capture;
pub mod context;
pub mod database;
pub mod health;
pub mod hub;
pub mod layer;
pub(crate) mod live;
pub mod model;
pub mod observer;
pub mod panic;
pub mod query;
pub mod redaction;
pub mod ring;
pub mod sink;
pub mod stats;
pub mod writer;

pub use capture::{capture_middleware, instrument};
pub use context::{current_correlation_id, spawn_blocking_in_context, spawn_in_context, RequestContext};
pub use database::{DatabaseStats, EventDb, EventSink, SessionInfo};
pub use health::{HealthSnapshot, PipelineHealth};
pub use hub::DispatchHub;
pub use layer::RuntimeLogLayer;
pub use live::InFlightRequest;
pub use model::{
    CapturedBody, EventKind, ExceptionEvent, HitOutcome, LogLevel, ObservedEvent, Payload,
    RequestHit, RuntimeLogEntry, StackFrame,
};
pub use observer::Observer;
pub use query::{CorrelatedEvents, ObserverQuery, Page, PollCursor, PollResult, StatsSnapshot};
pub use redaction::Redactor;
pub use sink::LogSink;
pub use stats::{EndpointStats, StatsSummary};
