//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Instances
        .route(
            "/instances",
            post(handlers::instance::start_instance).get(handlers::instance::list_instances),
        )
        .route("/instances/{id}", get(handlers::instance::get_instance))
        .route("/instances/{id}/resume", post(handlers::instance::resume_instance))
        .route("/instances/{id}/cancel", post(handlers::instance::cancel_instance))
        .route("/instances/{id}/recover", post(handlers::instance::recover_instance))
        // Time travel
        .route(
            "/instances/{id}/checkpoints",
            get(handlers::instance::list_checkpoints),
        )
        .route(
            "/instances/{id}/checkpoints/{seq}",
            get(handlers::instance::get_checkpoint),
        )
        // Orchestrator settings
        .route("/config", get(handlers::config::get_config));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint (no auth required).
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
