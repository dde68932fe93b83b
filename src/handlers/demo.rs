//! Demo host application
//!
//! A small user directory that exercises every capture path: JSON bodies with
//! sensitive fields, route parameters, slow requests, handled errors and
//! handler panics.

use crate::error::AppError;
use crate::observability::DispatchHub;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    /// Accepted and discarded; present so redaction has something to mask
    #[serde(default)]
    pub password: Option<String>,
}

/// Shared state of the demo handlers
#[derive(Clone)]
pub struct DemoState {
    users: Arc<RwLock<BTreeMap<u64, User>>>,
    next_id: Arc<AtomicU64>,
    hub: Arc<DispatchHub>,
}

impl DemoState {
    pub fn new(hub: Arc<DispatchHub>) -> Self {
        let state = Self {
            users: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            hub,
        };
        state.insert("Ada Lovelace", "ada@example.com");
        state.insert("Grace Hopper", "grace@example.com");
        state
    }

    fn insert(&self, name: &str, email: &str) -> User {
        let user = User {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            email: email.to_string(),
        };
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.id, user.clone());
        user
    }
}

/// GET /api/users
pub async fn list_users(State(state): State<DemoState>) -> Json<Vec<User>> {
    let users: Vec<User> = state
        .users
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect();
    tracing::info!(count = users.len(), "Listed users");
    Json(users)
}

/// POST /api/users
pub async fn create_user(
    State(state): State<DemoState>,
    Json(new_user): Json<NewUser>,
) -> Result<impl IntoResponse, AppError> {
    if new_user.name.trim().is_empty() {
        tracing::warn!("Rejected user without a name");
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }
    if !new_user.email.contains('@') {
        return Err(AppError::BadRequest(format!("invalid email '{}'", new_user.email)));
    }

    let user = state.insert(new_user.name.trim(), &new_user.email);
    tracing::info!(
        user_id = user.id,
        has_password = new_user.password.is_some(),
        "Created user"
    );
    Ok((StatusCode::CREATED, Json(user)))
}

/// GET /api/users/{id}
pub async fn get_user(
    State(state): State<DemoState>,
    Path(id): Path<u64>,
) -> Result<Json<User>, AppError> {
    state
        .users
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("user {} does not exist", id)))
}

#[derive(Debug, Deserialize)]
pub struct SlowParams {
    #[serde(default = "default_delay_ms")]
    pub ms: u64,
}

fn default_delay_ms() -> u64 {
    500
}

/// GET /api/slow?ms=N - Responds after N milliseconds (at most 10s)
pub async fn slow(Query(params): Query<SlowParams>) -> Json<serde_json::Value> {
    let delay = Duration::from_millis(params.ms.min(10_000));
    tracing::debug!(delay_ms = delay.as_millis() as u64, "Sleeping");
    tokio::time::sleep(delay).await;
    tracing::info!("Slow request finished");
    Json(serde_json::json!({ "slept_ms": delay.as_millis() as u64 }))
}

/// GET /api/panic - Panics inside the handler
pub async fn panic_handler() -> &'static str {
    tracing::warn!("About to panic");
    panic!("demo handler panicked on purpose");
}

/// GET /api/fail - Handles an internal error and reports it
pub async fn fail(State(state): State<DemoState>) -> Result<Json<User>, AppError> {
    let error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "user database unreachable");
    tracing::error!(error = %error, "Backend call failed");
    if let Err(e) = state.hub.report_exception(&error, None, None) {
        tracing::debug!(error = %e, "Exception not recorded");
    }
    Err(AppError::InternalError(error.to_string()))
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "healthy" })))
}
