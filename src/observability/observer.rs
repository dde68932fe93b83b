//! The pipeline as one owned object
//!
//! An [`Observer`] is constructed once at host startup and handed to the
//! capture interceptor, the tracing layer and the query API. Dropping it (or
//! calling [`Observer::shutdown`]) ends the pipeline; there is no global state.

use crate::config::ObserverConfig;
use crate::error::ObserverError;
use crate::observability::capture;
use crate::observability::database::{EventDb, EventSink, SessionInfo};
use crate::observability::health::PipelineHealth;
use crate::observability::hub::DispatchHub;
use crate::observability::live::LiveStore;
use crate::observability::model::EventKind;
use crate::observability::query::ObserverQuery;
use crate::observability::sink::LogSink;
use crate::observability::writer::DurableWriter;
use axum::Router;
use std::sync::Arc;

pub struct Observer {
    hub: Arc<DispatchHub>,
    writer: Option<Arc<DurableWriter>>,
    db: Option<Arc<EventDb>>,
    session: Option<SessionInfo>,
}

impl Observer {
    /// Start the pipeline described by `config`.
    ///
    /// With storage enabled this opens the database file, restores recent
    /// events into the live store, starts a new session and spawns the
    /// durable writer. Must be called inside a tokio runtime.
    pub async fn start(config: &ObserverConfig) -> Result<Self, ObserverError> {
        config.validate()?;
        if !config.storage.enabled {
            return Ok(Self::in_memory(config));
        }

        let db = EventDb::open_path(&config.storage.database_path).await?;
        Self::with_database(config, Arc::new(db)).await
    }

    /// Pipeline backed by an already-open database
    pub async fn with_database(config: &ObserverConfig, db: Arc<EventDb>) -> Result<Self, ObserverError> {
        let live = Arc::new(LiveStore::new(&config.live));

        if config.storage.rehydrate {
            let mut restored = 0usize;
            for kind in EventKind::ALL {
                let capacity = match kind {
                    EventKind::Hit => config.live.hits_capacity,
                    EventKind::Log => config.live.logs_capacity,
                    EventKind::Exception => config.live.exceptions_capacity,
                };
                let mut events = db.recent(kind, capacity).await?;
                // Stored newest first; rings are filled oldest first
                events.reverse();
                restored += events.len();
                for event in events {
                    live.restore(event);
                }
            }
            tracing::info!(restored, "Rehydrated live store from durable history");
        }

        let first_sequence = db.max_sequence().await? + 1;
        let session = db
            .create_session(&format!("request-lens {}", env!("CARGO_PKG_VERSION")))
            .await?;
        tracing::info!(session = %session.id, first_sequence, "Started observation session");

        let health = Arc::new(PipelineHealth::new());
        let writer = Arc::new(DurableWriter::spawn(
            db.clone(),
            session.id.clone(),
            &config.storage,
            health.clone(),
        ));
        let hub = DispatchHub::new(config, live, health, Some(writer.clone()), first_sequence);

        Ok(Self {
            hub: Arc::new(hub),
            writer: Some(writer),
            db: Some(db),
            session: Some(session),
        })
    }

    /// Live-only pipeline: nothing is persisted
    pub fn in_memory(config: &ObserverConfig) -> Self {
        let live = Arc::new(LiveStore::new(&config.live));
        let hub = DispatchHub::new(config, live, Arc::new(PipelineHealth::new()), None, 1);
        Self {
            hub: Arc::new(hub),
            writer: None,
            db: None,
            session: None,
        }
    }

    /// Pipeline persisting through a custom sink. Must be called inside a tokio runtime.
    pub fn with_sink(config: &ObserverConfig, sink: Arc<dyn EventSink>) -> Self {
        let live = Arc::new(LiveStore::new(&config.live));
        let health = Arc::new(PipelineHealth::new());
        let writer = Arc::new(DurableWriter::spawn(
            sink,
            uuid::Uuid::new_v4().to_string(),
            &config.storage,
            health.clone(),
        ));
        let hub = DispatchHub::new(config, live, health, Some(writer.clone()), 1);
        Self {
            hub: Arc::new(hub),
            writer: Some(writer),
            db: None,
            session: None,
        }
    }

    pub fn hub(&self) -> &Arc<DispatchHub> {
        &self.hub
    }

    pub fn log_sink(&self) -> LogSink {
        LogSink::new(self.hub.clone())
    }

    pub fn query(&self) -> ObserverQuery {
        ObserverQuery::new(self.hub.clone(), self.db.clone())
    }

    /// Put every route of `router` behind the capture interceptor
    pub fn instrument<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        capture::instrument(router, self.hub.clone())
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    pub fn database(&self) -> Option<&Arc<EventDb>> {
        self.db.as_ref()
    }

    /// Flush queued events and close the database
    pub async fn shutdown(&self) {
        if let Some(writer) = &self.writer {
            writer.shutdown().await;
        }
        if let Some(db) = &self.db {
            db.close().await;
        }
        let health = self.hub.health().snapshot();
        tracing::info!(
            persisted = health.persisted,
            dropped = health.dropped_total(),
            "Observer shut down"
        );
    }
}
