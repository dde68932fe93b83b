//! SQLite durable store
//!
//! This module provides:
//! - One append-only table per event kind, keyed by sequence id
//! - Idempotent batch inserts (`INSERT OR IGNORE`), safe under redelivery
//! - "Most recent N" reads for rehydrating the live store
//! - Session bookkeeping: one session per process start
//! - WAL mode for concurrent reads/writes

use crate::error::ObserverError;
use crate::observability::model::{
    EventKind, ExceptionEvent, ObservedEvent, RequestHit, RuntimeLogEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Destination of the durable writer
///
/// Implementations must treat a repeated sequence id as a no-op.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn persist_batch(&self, session_id: &str, events: &[ObservedEvent]) -> Result<(), ObserverError>;
}

/// A process run that produced events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub hits: u64,
    pub logs: u64,
    pub exceptions: u64,
}

/// Row counts per table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub sessions: u64,
    pub hits: u64,
    pub logs: u64,
    pub exceptions: u64,
}

fn table_name(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Hit => "request_hits",
        EventKind::Log => "runtime_logs",
        EventKind::Exception => "exceptions",
    }
}

pub struct EventDb {
    pool: SqlitePool,
}

impl EventDb {
    /// Connect to `database_url` and apply migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let db = EventDb::new("sqlite:./data/request_lens.db").await?;
    /// ```
    pub async fn new(database_url: &str) -> Result<Self, ObserverError> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect(options, database_url.contains(":memory:")).await
    }

    /// Open (creating if needed) the database file at `path`
    pub async fn open_path(path: &Path) -> Result<Self, ObserverError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Self::connect(SqliteConnectOptions::new().filename(path), false).await
    }

    async fn connect(options: SqliteConnectOptions, in_memory: bool) -> Result<Self, ObserverError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("synchronous", "NORMAL")
            .pragma("temp_store", "memory");

        // Every connection to `:memory:` is a separate database
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), ObserverError> {
        sqlx::migrate!("./migrations").run(pool).await?;
        tracing::debug!("Event database migrations completed");
        Ok(())
    }

    /// Start a new session and return it
    pub async fn create_session(&self, label: &str) -> Result<SessionInfo, ObserverError> {
        let session = SessionInfo {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.to_string(),
            started_at: Utc::now(),
            hits: 0,
            logs: 0,
            exceptions: 0,
        };

        sqlx::query("INSERT INTO sessions (id, label, started_at) VALUES (?, ?, ?)")
            .bind(&session.id)
            .bind(&session.label)
            .bind(session.started_at.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(session)
    }

    /// All sessions, newest first, with event counts
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ObserverError> {
        let rows = sqlx::query(
            "SELECT s.id, s.label, s.started_at,
                    (SELECT COUNT(*) FROM request_hits h WHERE h.session_id = s.id) AS hits,
                    (SELECT COUNT(*) FROM runtime_logs l WHERE l.session_id = s.id) AS logs,
                    (SELECT COUNT(*) FROM exceptions e WHERE e.session_id = s.id) AS exceptions
             FROM sessions s
             ORDER BY s.started_at DESC, s.rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<SessionInfo, ObserverError> {
                let started_at: i64 = row.try_get("started_at")?;
                Ok(SessionInfo {
                    id: row.try_get("id")?,
                    label: row.try_get("label")?,
                    started_at: DateTime::from_timestamp_millis(started_at).unwrap_or_default(),
                    hits: row.try_get::<i64, _>("hits")? as u64,
                    logs: row.try_get::<i64, _>("logs")? as u64,
                    exceptions: row.try_get::<i64, _>("exceptions")? as u64,
                })
            })
            .collect()
    }

    /// Delete a session together with every event it recorded.
    /// Returns `false` if no such session exists.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, ObserverError> {
        let mut tx = self.pool.begin().await?;

        for kind in EventKind::ALL {
            let sql = format!("DELETE FROM {} WHERE session_id = ?", table_name(kind));
            sqlx::query(&sql).bind(session_id).execute(&mut *tx).await?;
        }
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    /// Insert events in one transaction; duplicates (same sequence id) are ignored.
    /// Returns the number of rows actually inserted.
    pub async fn insert_batch(&self, session_id: &str, events: &[ObservedEvent]) -> Result<u64, ObserverError> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for event in events {
            inserted += insert_event(&mut tx, session_id, event).await?;
        }

        tx.commit().await?;

        Ok(inserted)
    }

    /// Most recent `limit` events of `kind`, newest first
    pub async fn recent(&self, kind: EventKind, limit: usize) -> Result<Vec<ObservedEvent>, ObserverError> {
        let sql = format!(
            "SELECT data FROM {} ORDER BY seq DESC LIMIT ?",
            table_name(kind)
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<ObservedEvent, ObserverError> {
                decode_event(kind, &row.try_get::<String, _>("data")?)
            })
            .collect()
    }

    /// Every stored event carrying `correlation_id`, in sequence order
    pub async fn by_correlation(&self, correlation_id: &str) -> Result<Vec<ObservedEvent>, ObserverError> {
        let mut events = Vec::new();

        for kind in EventKind::ALL {
            let sql = format!(
                "SELECT data FROM {} WHERE correlation_id = ? ORDER BY seq ASC",
                table_name(kind)
            );
            let rows = sqlx::query(&sql)
                .bind(correlation_id)
                .fetch_all(&self.pool)
                .await?;
            for row in rows {
                events.push(decode_event(kind, &row.try_get::<String, _>("data")?)?);
            }
        }

        events.sort_by_key(ObservedEvent::sequence);
        Ok(events)
    }

    /// Highest sequence id stored in any table (0 when empty)
    pub async fn max_sequence(&self) -> Result<u64, ObserverError> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(seq) FROM (
                SELECT MAX(seq) AS seq FROM request_hits
                UNION ALL SELECT MAX(seq) FROM runtime_logs
                UNION ALL SELECT MAX(seq) FROM exceptions
             )",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(max.unwrap_or(0).max(0) as u64)
    }

    pub async fn get_stats(&self) -> Result<DatabaseStats, ObserverError> {
        let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        let hits: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM request_hits")
            .fetch_one(&self.pool)
            .await?;
        let logs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM runtime_logs")
            .fetch_one(&self.pool)
            .await?;
        let exceptions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM exceptions")
            .fetch_one(&self.pool)
            .await?;

        Ok(DatabaseStats {
            sessions: sessions as u64,
            hits: hits as u64,
            logs: logs as u64,
            exceptions: exceptions as u64,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn insert_event(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: &str,
    event: &ObservedEvent,
) -> Result<u64, ObserverError> {
    let result = match event {
        ObservedEvent::Hit(hit) => {
            sqlx::query(
                "INSERT OR IGNORE INTO request_hits
                 (seq, session_id, correlation_id, timestamp, method, path, route, status, duration_us, data)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(hit.sequence as i64)
            .bind(session_id)
            .bind(&hit.correlation_id)
            .bind(hit.timestamp.timestamp_millis())
            .bind(&hit.method)
            .bind(&hit.path)
            .bind(&hit.route)
            .bind(hit.status as i64)
            .bind(hit.duration_us as i64)
            .bind(serde_json::to_string(hit.as_ref())?)
            .execute(&mut **tx)
            .await?
        }
        ObservedEvent::Log(entry) => {
            sqlx::query(
                "INSERT OR IGNORE INTO runtime_logs
                 (seq, session_id, correlation_id, timestamp, level, data)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(entry.sequence as i64)
            .bind(session_id)
            .bind(&entry.correlation_id)
            .bind(entry.timestamp.timestamp_millis())
            .bind(entry.level.map(|l| l.as_str()))
            .bind(serde_json::to_string(entry.as_ref())?)
            .execute(&mut **tx)
            .await?
        }
        ObservedEvent::Exception(exception) => {
            sqlx::query(
                "INSERT OR IGNORE INTO exceptions
                 (seq, session_id, correlation_id, timestamp, kind, message, method, endpoint, data)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(exception.sequence as i64)
            .bind(session_id)
            .bind(&exception.correlation_id)
            .bind(exception.timestamp.timestamp_millis())
            .bind(&exception.kind)
            .bind(&exception.message)
            .bind(&exception.method)
            .bind(&exception.endpoint)
            .bind(serde_json::to_string(exception.as_ref())?)
            .execute(&mut **tx)
            .await?
        }
    };

    Ok(result.rows_affected())
}

fn decode_event(kind: EventKind, data: &str) -> Result<ObservedEvent, ObserverError> {
    Ok(match kind {
        EventKind::Hit => ObservedEvent::Hit(Arc::new(serde_json::from_str::<RequestHit>(data)?)),
        EventKind::Log => ObservedEvent::Log(Arc::new(serde_json::from_str::<RuntimeLogEntry>(data)?)),
        EventKind::Exception => {
            ObservedEvent::Exception(Arc::new(serde_json::from_str::<ExceptionEvent>(data)?))
        }
    })
}

#[async_trait]
impl EventSink for EventDb {
    async fn persist_batch(&self, session_id: &str, events: &[ObservedEvent]) -> Result<(), ObserverError> {
        self.insert_batch(session_id, events).await.map(|_| ())
    }
}
