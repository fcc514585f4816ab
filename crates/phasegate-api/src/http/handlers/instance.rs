//! Workflow instance handlers for the REST API.
//!
//! Start, resume, and cancel drive the instance until it suspends or
//! finishes, then answer with its status report. The drive runs on an engine
//! task, so a client that disconnects early does not interrupt a phase. Checkpoint
//! endpoints expose retained history for time travel.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use phasegate_types::gate::{Decision, ResumeSignal};
use phasegate_types::workflow::{
    Checkpoint, InstanceId, InstanceStatus, InstanceSummary, StatusReport,
};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Request body for starting an instance.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    /// Caller-chosen ID; a UUID v7 is generated when omitted.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Initial input object.
    #[serde(default)]
    pub input: Value,
}

/// Request body for answering a gate.
#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub decision: Decision,
    #[serde(default)]
    pub gate_name: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default = "default_cancel_reason")]
    pub reason: String,
}

fn default_cancel_reason() -> String {
    "cancelled via API".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

/// Query parameters for listing checkpoints.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Maximum number of checkpoints to return (default 20).
    #[serde(default = "default_history_limit")]
    pub limit: u32,
}

fn default_history_limit() -> u32 {
    20
}

const MAX_HISTORY_LIMIT: u32 = 1000;

fn instance_link(id: &InstanceId) -> String {
    format!("/api/v1/instances/{id}")
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// POST /api/v1/instances -- Start an instance and drive it to its first stop.
pub async fn start_instance(
    State(state): State<AppState>,
    Json(body): Json<StartRequest>,
) -> Result<Json<ApiResponse<StatusReport>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    if !(body.input.is_object() || body.input.is_null()) {
        return Err(AppError::Validation("input must be a JSON object".to_string()));
    }
    let instance_id = match body.instance_id {
        Some(id) if id.trim().is_empty() => {
            return Err(AppError::Validation("instance_id must not be empty".to_string()));
        }
        Some(id) => InstanceId::new(id),
        None => InstanceId::new(Uuid::now_v7().to_string()),
    };

    state.engine.start(instance_id.clone(), body.input).await?;
    let report = state.engine.status(&instance_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(report, request_id, elapsed)
            .with_link("self", &instance_link(&instance_id)),
    ))
}

/// POST /api/v1/instances/{id}/resume -- Answer the pending gate.
pub async fn resume_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResumeRequest>,
) -> Result<Json<ApiResponse<StatusReport>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let instance_id = InstanceId::new(id);
    let mut signal = ResumeSignal::new(instance_id.clone(), body.decision).with_payload(body.payload);
    if let Some(gate) = body.gate_name {
        signal = signal.for_gate(gate);
    }

    state.engine.resume(signal).await?;
    let report = state.engine.status(&instance_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(report, request_id, elapsed)
            .with_link("self", &instance_link(&instance_id)),
    ))
}

/// POST /api/v1/instances/{id}/cancel -- Reject whatever gate the instance waits on.
pub async fn cancel_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<ApiResponse<StatusReport>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let instance_id = InstanceId::new(id);
    state.engine.cancel(&instance_id, &body.reason).await?;
    let report = state.engine.status(&instance_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(report, request_id, elapsed)
            .with_link("self", &instance_link(&instance_id)),
    ))
}

/// POST /api/v1/instances/{id}/recover -- Re-drive an interrupted instance.
pub async fn recover_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<StatusReport>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let instance_id = InstanceId::new(id);
    state.engine.recover(&instance_id).await?;
    let report = state.engine.status(&instance_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(report, request_id, elapsed)
            .with_link("self", &instance_link(&instance_id)),
    ))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// GET /api/v1/instances -- List instances, optionally filtered by status.
pub async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<InstanceSummary>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let status = query
        .status
        .as_deref()
        .map(str::parse::<InstanceStatus>)
        .transpose()
        .map_err(AppError::Validation)?;

    let instances = state.engine.list(status).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(instances, request_id, elapsed).with_link("self", "/api/v1/instances"),
    ))
}

/// GET /api/v1/instances/{id} -- Status report of one instance.
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<StatusReport>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let instance_id = InstanceId::new(id);
    let report = state.engine.status(&instance_id).await?;

    let link = instance_link(&instance_id);
    let elapsed = start.elapsed().as_millis() as u64;
    let mut resp = ApiResponse::success(report, request_id, elapsed)
        .with_link("self", &link)
        .with_link("checkpoints", &format!("{link}/checkpoints"));
    if resp.data.as_ref().is_some_and(|r| r.interrupt.is_some()) {
        resp = resp.with_link("resume", &format!("{link}/resume"));
    }
    Ok(Json(resp))
}

/// GET /api/v1/instances/{id}/checkpoints -- Retained checkpoints, newest first.
pub async fn list_checkpoints(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Vec<Checkpoint>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let instance_id = InstanceId::new(id);
    let limit = query.limit.clamp(1, MAX_HISTORY_LIMIT);
    let checkpoints = state.engine.checkpoints(&instance_id, limit).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(checkpoints, request_id, elapsed).with_link(
            "self",
            &format!("{}/checkpoints", instance_link(&instance_id)),
        ),
    ))
}

/// GET /api/v1/instances/{id}/checkpoints/{seq} -- One historical checkpoint.
pub async fn get_checkpoint(
    State(state): State<AppState>,
    Path((id, sequence_no)): Path<(String, u64)>,
) -> Result<Json<ApiResponse<Checkpoint>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let instance_id = InstanceId::new(id);
    let checkpoint = state.engine.checkpoint_at(&instance_id, sequence_no).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(checkpoint, request_id, elapsed).with_link(
            "self",
            &format!("{}/checkpoints/{sequence_no}", instance_link(&instance_id)),
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasegate_core::workflow::EngineError;
    use phasegate_types::config::GlobalConfig;
    use phasegate_types::error::ProtocolError;
    use phasegate_types::workflow::Phase;
    use serde_json::json;
    use tempfile::TempDir;

    async fn test_state() -> (AppState, TempDir) {
        let tmp = TempDir::new().unwrap();
        let state = AppState::open(tmp.path().to_path_buf(), GlobalConfig::default(), tmp.path())
            .await
            .unwrap();
        (state, tmp)
    }

    fn start_body(id: &str) -> Json<StartRequest> {
        Json(StartRequest {
            instance_id: Some(id.to_string()),
            input: json!({"topic": "quarterly sales"}),
        })
    }

    #[tokio::test]
    async fn start_stops_at_review_gate_then_resume_completes() {
        let (state, _tmp) = test_state().await;

        let started = start_instance(State(state.clone()), start_body("api-1"))
            .await
            .unwrap();
        let report = started.0.data.as_ref().unwrap();
        assert_eq!(report.status, InstanceStatus::AwaitingInput);
        let gate = report.interrupt.as_ref().unwrap().gate_name.clone();
        assert_eq!(gate, "generation_review");
        assert_eq!(started.0.links["self"], "/api/v1/instances/api-1");

        let resumed = resume_instance(
            State(state.clone()),
            Path("api-1".to_string()),
            Json(ResumeRequest {
                decision: Decision::Approve,
                gate_name: Some(gate),
                payload: Value::Null,
            }),
        )
        .await
        .unwrap();
        let report = resumed.0.data.unwrap();
        assert_eq!(report.status, InstanceStatus::Complete);
        assert!(report.artifacts.is_some());

        let listed = list_instances(
            State(state.clone()),
            Query(ListQuery {
                status: Some("complete".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(listed.0.data.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn checkpoints_are_browsable() {
        let (state, _tmp) = test_state().await;
        let started = start_instance(State(state.clone()), start_body("api-2"))
            .await
            .unwrap();
        assert_eq!(started.0.data.unwrap().status, InstanceStatus::AwaitingInput);

        let history = list_checkpoints(
            State(state.clone()),
            Path("api-2".to_string()),
            Query(HistoryQuery { limit: 5 }),
        )
        .await
        .unwrap();
        let checkpoints = history.0.data.unwrap();
        assert!(!checkpoints.is_empty() && checkpoints.len() <= 5);
        assert!(checkpoints.windows(2).all(|w| w[0].sequence_no > w[1].sequence_no));

        let first = get_checkpoint(State(state.clone()), Path(("api-2".to_string(), 1)))
            .await
            .unwrap();
        assert_eq!(first.0.data.unwrap().state.phase, Phase::Requirements);
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected() {
        let (state, _tmp) = test_state().await;
        let started = start_instance(State(state.clone()), start_body("dup"))
            .await
            .unwrap();
        assert_eq!(started.0.data.unwrap().status, InstanceStatus::AwaitingInput);

        let err = start_instance(State(state.clone()), start_body("dup"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Engine(EngineError::Protocol(ProtocolError::DuplicateInstance(_)))
        ));
    }

    #[tokio::test]
    async fn malformed_requests_are_validation_errors() {
        let (state, _tmp) = test_state().await;

        let err = start_instance(
            State(state.clone()),
            Json(StartRequest {
                instance_id: None,
                input: json!([1, 2, 3]),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = list_instances(
            State(state.clone()),
            Query(ListQuery {
                status: Some("sleeping".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn cancel_fails_the_instance() {
        let (state, _tmp) = test_state().await;
        let started = start_instance(State(state.clone()), start_body("api-3"))
            .await
            .unwrap();
        assert_eq!(started.0.data.unwrap().status, InstanceStatus::AwaitingInput);

        let cancelled = cancel_instance(
            State(state.clone()),
            Path("api-3".to_string()),
            Json(CancelRequest {
                reason: "no longer needed".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(cancelled.0.data.unwrap().status, InstanceStatus::Failed);

        let err = get_instance(State(state.clone()), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Engine(EngineError::Protocol(ProtocolError::NoSuchInstance(_)))
        ));
    }
}
