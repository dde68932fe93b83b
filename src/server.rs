use anyhow::Result;
use axum::{extract::DefaultBodyLimit, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::Config,
    handlers::{demo, metrics_handler, query_api},
    metrics,
    observability::Observer,
    signals::setup_signal_handlers,
};

/// Start the demo application with the observation pipeline attached
///
/// This function:
/// 1. Initializes metrics
/// 2. Sets up signal handlers for graceful shutdown
/// 3. Creates the Axum application
/// 4. Binds to the configured address
/// 5. Serves requests with graceful shutdown support
/// 6. Flushes the durable writer once the server has stopped
pub async fn start_server(config: Config, observer: Observer) -> Result<()> {
    // Initialize metrics
    info!("Initializing Prometheus metrics...");
    let metrics_handle = Arc::new(metrics::init_metrics()?);

    // Setup signal handlers (SIGTERM, SIGINT for shutdown)
    let (shutdown_tx, signal_handle) = setup_signal_handlers();
    let mut shutdown_rx = shutdown_tx.subscribe();

    let app = create_router(&observer, Some(metrics_handle));

    // Create socket address
    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    info!("Starting request-lens demo on {}", addr);
    info!(
        "Query API at http://{}{}, durable storage {}",
        addr,
        query_api::API_PREFIX,
        if observer.database().is_some() { "enabled" } else { "disabled" }
    );
    if let Some(session) = observer.session() {
        info!("Recording session {}", session.id);
    }

    // Bind to address
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Serve with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        // Wait for shutdown signal
        let _ = shutdown_rx.recv().await;
        info!("Shutdown signal received, draining connections...");
    })
    .await?;

    // Wait for signal handler task to complete
    signal_handle.await?;

    observer.shutdown().await;
    info!("Server stopped gracefully");

    Ok(())
}

/// Create the Axum router with all routes and middleware
///
/// Demo routes sit behind the capture interceptor. The query API and
/// `/metrics` are mounted outside it.
pub fn create_router(observer: &Observer, metrics_handle: Option<Arc<PrometheusHandle>>) -> Router {
    let demo_routes = Router::new()
        .route("/api/users", get(demo::list_users).post(demo::create_user))
        .route("/api/users/:id", get(demo::get_user))
        .route("/api/slow", get(demo::slow))
        .route("/api/panic", get(demo::panic_handler))
        .route("/api/fail", get(demo::fail))
        .route("/health", get(demo::health_check))
        .with_state(demo::DemoState::new(observer.hub().clone()));

    let mut app = observer
        .instrument(demo_routes)
        .nest(query_api::API_PREFIX, query_api::router(observer.query()));

    if let Some(handle) = metrics_handle {
        app = app.route("/metrics", get(metrics_handler::metrics).with_state(handle));
    }

    app
        // Security: Limit request body size to 10MB to prevent memory exhaustion attacks
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        // Panics are recorded by the interceptor and then turned into 500s here
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}
