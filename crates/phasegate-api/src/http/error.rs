//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use phasegate_core::workflow::checkpoint::CheckpointError;
use phasegate_core::workflow::{EngineError, OrchestratorError};
use phasegate_types::error::ProtocolError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Errors raised by the workflow engine.
    Engine(EngineError),
    /// Malformed request input.
    Validation(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Engine(EngineError::Protocol(e)) => match e {
                ProtocolError::NoSuchInstance(_) => (StatusCode::NOT_FOUND, "INSTANCE_NOT_FOUND"),
                ProtocolError::DuplicateInstance(_) => (StatusCode::CONFLICT, "DUPLICATE_INSTANCE"),
                ProtocolError::NotSuspended(_) => (StatusCode::CONFLICT, "NOT_SUSPENDED"),
                ProtocolError::AlreadyResumed(_) => (StatusCode::CONFLICT, "ALREADY_RESUMED"),
                ProtocolError::SignalMismatch { .. } => (StatusCode::BAD_REQUEST, "SIGNAL_MISMATCH"),
            },
            AppError::Engine(EngineError::Checkpoint(e)) => match e {
                CheckpointError::InstanceNotFound(_) => (StatusCode::NOT_FOUND, "INSTANCE_NOT_FOUND"),
                CheckpointError::NotRetained { .. } => {
                    (StatusCode::NOT_FOUND, "CHECKPOINT_NOT_RETAINED")
                }
                CheckpointError::AlreadyExists(_) => (StatusCode::CONFLICT, "DUPLICATE_INSTANCE"),
                CheckpointError::Stale { .. } => (StatusCode::CONFLICT, "STALE_CHECKPOINT"),
                CheckpointError::Repository(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "CHECKPOINT_ERROR")
                }
            },
            AppError::Engine(EngineError::Orchestrator(e)) => match e {
                OrchestratorError::Terminal(_) => (StatusCode::CONFLICT, "INSTANCE_TERMINAL"),
                OrchestratorError::Suspended(_) => (StatusCode::CONFLICT, "INSTANCE_SUSPENDED"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "ORCHESTRATOR_ERROR"),
            },
            AppError::Engine(EngineError::Task(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ENGINE_TASK_FAILED")
            }
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Engine(e) => e.to_string(),
            AppError::Validation(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = self.message();

        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        } else {
            tracing::debug!(code, error = %message, "request rejected");
        }

        let mut body = ApiResponse::error(code, &message, uuid::Uuid::now_v7().to_string());
        if let AppError::Engine(EngineError::Protocol(ProtocolError::SignalMismatch {
            expected,
            actual,
        })) = &self
        {
            body = body.with_details(json!({ "expected": expected, "actual": actual }));
        }

        (status, Json(body)).into_response()
    }
}
