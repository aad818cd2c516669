//! Status server: a small Axum app exposing health and recent cycle results.
//!
//! CORS allows GET from any origin so the endpoints can be polled from a
//! browser during local development.

pub mod routes;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub use routes::{AppState, CycleKind, StatusState};

/// Start the status server on a background task.
pub fn spawn_status_server(state: AppState, port: u16) {
    let app = build_router(state);

    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(port, error = %e, "Failed to bind status port");
                return;
            }
        };
        info!(port, "Status server listening on http://localhost:{port}");

        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Status server stopped");
        }
    });
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/status", get(routes::get_status))
        .route("/api/cycles", get(routes::get_cycles))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
