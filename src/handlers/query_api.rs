//! HTTP query API for the presentation layer
//!
//! Mounted under `/_lens/api`, outside the capture interceptor so that
//! polling the pipeline never produces events of its own.

use crate::error::AppError;
use crate::observability::{
    CorrelatedEvents, EventKind, ExceptionEvent, HealthSnapshot, InFlightRequest, ObservedEvent,
    ObserverQuery, Page, PollCursor, PollResult, RequestHit, RuntimeLogEntry, SessionInfo,
    StatsSnapshot,
};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Path prefix the API is mounted under
pub const API_PREFIX: &str = "/_lens/api";

pub fn router(query: ObserverQuery) -> Router {
    Router::new()
        .route("/hits", get(recent_hits))
        .route("/logs", get(recent_logs))
        .route("/exceptions", get(recent_exceptions))
        .route("/history/:kind", get(history))
        .route("/correlation/:id", get(correlation))
        .route("/stats", get(stats))
        .route("/poll", get(poll))
        .route("/health", get(health))
        .route("/in-flight", get(in_flight))
        .route("/sessions", get(sessions))
        .route("/stream", get(stream))
        .with_state(query)
}

/// GET /hits - Recent request hits, newest first
///
/// Example: GET /_lens/api/hits?offset=0&limit=20
pub async fn recent_hits(
    State(query): State<ObserverQuery>,
    Query(page): Query<Page>,
) -> Json<Vec<Arc<RequestHit>>> {
    Json(query.recent_hits(page))
}

/// GET /logs - Recent runtime log entries, newest first
pub async fn recent_logs(
    State(query): State<ObserverQuery>,
    Query(page): Query<Page>,
) -> Json<Vec<Arc<RuntimeLogEntry>>> {
    Json(query.recent_logs(page))
}

/// GET /exceptions - Recent exceptions, newest first
pub async fn recent_exceptions(
    State(query): State<ObserverQuery>,
    Query(page): Query<Page>,
) -> Json<Vec<Arc<ExceptionEvent>>> {
    Json(query.recent_exceptions(page))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    100
}

/// GET /history/{kind} - Durable events of one kind, newest first
///
/// Example: GET /_lens/api/history/exceptions?limit=10
pub async fn history(
    State(query): State<ObserverQuery>,
    Path(kind): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<ObservedEvent>>, AppError> {
    let kind: EventKind = kind.parse()?;
    if !query.has_history() {
        return Err(AppError::Unavailable("durable storage is disabled".to_string()));
    }
    Ok(Json(query.history(kind, params.limit).await?))
}

/// GET /correlation/{id} - Every event of one request
pub async fn correlation(
    State(query): State<ObserverQuery>,
    Path(id): Path<String>,
) -> Result<Json<CorrelatedEvents>, AppError> {
    let events = query.correlated_or_history(&id).await?;
    if events.is_empty() {
        return Err(AppError::NotFound(format!("no events for correlation id '{}'", id)));
    }
    Ok(Json(events))
}

/// GET /stats - Endpoint statistics snapshot
pub async fn stats(State(query): State<ObserverQuery>) -> Json<StatsSnapshot> {
    Json(query.stats())
}

/// GET /poll - Events admitted after the given per-kind cursor
///
/// Example: GET /_lens/api/poll?hits=120&logs=118&exceptions=0
pub async fn poll(
    State(query): State<ObserverQuery>,
    Query(cursor): Query<PollCursor>,
) -> Json<PollResult> {
    Json(query.since(cursor))
}

/// GET /health - Pipeline counters and recent diagnostics
pub async fn health(State(query): State<ObserverQuery>) -> Json<HealthSnapshot> {
    Json(query.health())
}

/// GET /in-flight - Requests currently being handled
pub async fn in_flight(State(query): State<ObserverQuery>) -> Json<Vec<InFlightRequest>> {
    Json(query.in_flight())
}

/// GET /sessions - Recorded sessions, newest first
pub async fn sessions(State(query): State<ObserverQuery>) -> Result<Json<Vec<SessionInfo>>, AppError> {
    if !query.has_history() {
        return Err(AppError::Unavailable("durable storage is disabled".to_string()));
    }
    Ok(Json(query.sessions().await?))
}

/// GET /stream - Server-Sent Events, one per admitted event
///
/// Each event is named after its kind and carries its sequence id. A slow
/// client that falls behind receives a `lagged` event with the number of
/// events it missed.
pub async fn stream(
    State(query): State<ObserverQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = query.subscribe();

    let events = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let sse = Event::default()
                        .event(event.kind().as_str())
                        .id(event.sequence().to_string())
                        .json_data(&event);
                    match sse {
                        Ok(sse) => return Some((Ok(sse), receiver)),
                        Err(e) => {
                            tracing::warn!(error = %e, sequence = event.sequence(), "Failed to encode stream event");
                        }
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    let sse = Event::default().event("lagged").data(missed.to_string());
                    return Some((Ok(sse), receiver));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObserverConfig;
    use crate::observability::Observer;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_hits_and_correlation() {
        let observer = Observer::in_memory(&ObserverConfig::default());
        let hit = RequestHit::new("GET", "/users", 200, Duration::from_millis(3)).with_correlation_id("abc");
        observer.hub().submit_request_hit(hit).unwrap();
        let app = router(observer.query());

        let (status, body) = get_json(app.clone(), "/hits?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["path"], "/users");

        let (status, body) = get_json(app.clone(), "/correlation/abc").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hit"]["status"], 200);
        assert_eq!(body["source"], "live");

        let (status, body) = get_json(app, "/correlation/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["type"], "not_found");
    }

    #[tokio::test]
    async fn test_history_unavailable_without_storage() {
        let observer = Observer::in_memory(&ObserverConfig::default());
        let (status, _) = get_json(router(observer.query()), "/sessions").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_history_kind_is_bad_request() {
        let observer = Observer::in_memory(&ObserverConfig::default());
        let (status, _) = get_json(router(observer.query()), "/history/metrics").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_poll_and_stats() {
        let observer = Observer::in_memory(&ObserverConfig::default());
        observer
            .hub()
            .submit_request_hit(RequestHit::new("POST", "/orders", 503, Duration::from_millis(9)))
            .unwrap();
        let app = router(observer.query());

        let (_, body) = get_json(app.clone(), "/poll?hits=0").await;
        assert_eq!(body["hits"].as_array().unwrap().len(), 1);
        assert_eq!(body["cursor"]["hits"], 1);

        let (_, body) = get_json(app, "/stats").await;
        assert_eq!(body["summary"]["total_errors"], 1);
        assert_eq!(body["endpoints"][0]["path"], "/orders");
    }
}
