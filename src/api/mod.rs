//! REST API and WebSocket server for the checker
//!
//! ## Endpoints
//!
//! - `GET /api/v1/health` - Health check
//! - `GET /api/v1/stats` - Dashboard summary
//! - `GET /api/v1/monitors` - Scheduled monitors with incident state
//! - `GET /api/v1/monitors/:id/checks` - Recent check results
//! - `GET /api/v1/monitors/:id/incidents` - Incident history
//! - `GET /api/v1/monitors/:id/stats` - Uptime statistics
//! - `POST /api/v1/monitors/:id/resolve` - Close an open incident manually
//! - `WS /api/v1/ws` - Live monitor events

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod types;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;
pub use types::{
    ChecksResponse, HealthResponse, IncidentInfo, IncidentsResponse, MonitorInfo,
    MonitorStatsResponse, MonitorsResponse, StatsResponse,
};

use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ApiConfig;

/// Build the router with all routes and layers
pub fn build_router(config: &ApiConfig, state: ApiState) -> Router {
    let mut app = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/stats", get(routes::stats::get_stats))
        .route("/api/v1/monitors", get(routes::monitors::list_monitors))
        .route(
            "/api/v1/monitors/:id/checks",
            get(routes::monitors::get_checks),
        )
        .route(
            "/api/v1/monitors/:id/incidents",
            get(routes::monitors::get_incidents),
        )
        .route(
            "/api/v1/monitors/:id/stats",
            get(routes::monitors::get_monitor_stats),
        )
        .route(
            "/api/v1/monitors/:id/resolve",
            post(routes::monitors::resolve_incident),
        )
        .route("/api/v1/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    if let Some(token) = config.auth_token.clone() {
        app = app.layer(axum::middleware::from_fn_with_state(
            token,
            middleware::auth::auth_middleware,
        ));
    }

    app
}

/// Spawn the API server
///
/// Starts an Axum HTTP server in a background task that stops once
/// `shutdown` is cancelled. Returns the server's local address.
pub async fn spawn_api_server(
    config: ApiConfig,
    state: ApiState,
    shutdown: CancellationToken,
) -> anyhow::Result<SocketAddr> {
    info!("starting API server on {}", config.bind_addr);

    let app = build_router(&config, state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(addr)
}
