//! REST API handler for the effective orchestrator configuration.

use std::time::Instant;

use axum::Json;
use axum::extract::State;
use uuid::Uuid;

use phasegate_types::config::OrchestratorConfig;

use crate::http::response::ApiResponse;
use crate::state::AppState;

/// GET /api/v1/config -- Retry budgets, loop ceiling, and declared gates.
pub async fn get_config(State(state): State<AppState>) -> Json<ApiResponse<OrchestratorConfig>> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let config = state.config.orchestrator.clone();

    let elapsed = start.elapsed().as_millis() as u64;
    Json(ApiResponse::success(config, request_id, elapsed).with_link("self", "/api/v1/config"))
}
