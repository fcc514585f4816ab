//! Durable checkpoint manager for workflow instances.
//!
//! Wraps `CheckpointRepository` to provide a higher-level API for recording
//! sequenced snapshots. Every step of the engine's drive loop is committed
//! here before the next step runs, so a crashed instance resumes from the
//! last committed state.

use std::sync::Arc;

use chrono::Utc;
use phasegate_types::error::RepositoryError;
use phasegate_types::workflow::{
    Checkpoint, InstanceId, InstanceStatus, InstanceSummary, WorkflowState,
};

use crate::repository::checkpoint::CheckpointRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages sequenced checkpoints for workflow instances.
///
/// Generic over `R: CheckpointRepository` so it works with any storage
/// backend (SQLite, in-memory, etc.).
pub struct CheckpointManager<R: CheckpointRepository> {
    repo: Arc<R>,
}

impl<R: CheckpointRepository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Persist the first checkpoint (sequence 1) of a new instance.
    pub async fn create(&self, state: &WorkflowState) -> Result<u64, CheckpointError> {
        let checkpoint = Checkpoint::new(1, state.clone(), Utc::now());
        self.repo.create(&checkpoint).await.map_err(|e| match e {
            RepositoryError::Conflict(_) => {
                CheckpointError::AlreadyExists(state.instance_id.clone())
            }
            other => CheckpointError::Repository(other.to_string()),
        })?;

        tracing::debug!(instance_id = %state.instance_id, sequence_no = 1, "created checkpoint");
        Ok(1)
    }

    /// Commit `state` as the successor of checkpoint `expected`.
    ///
    /// Returns the new sequence number. Fails with `Stale` if another writer
    /// committed after `expected` was read.
    pub async fn commit(
        &self,
        state: &WorkflowState,
        expected: u64,
    ) -> Result<u64, CheckpointError> {
        let sequence_no = expected + 1;
        let checkpoint = Checkpoint::new(sequence_no, state.clone(), Utc::now());
        self.repo
            .save(&checkpoint, expected)
            .await
            .map_err(|e| match e {
                RepositoryError::Conflict(_) => CheckpointError::Stale {
                    instance_id: state.instance_id.clone(),
                    expected,
                },
                RepositoryError::NotFound => {
                    CheckpointError::InstanceNotFound(state.instance_id.clone())
                }
                other => CheckpointError::Repository(other.to_string()),
            })?;

        tracing::debug!(
            instance_id = %state.instance_id,
            sequence_no,
            phase = %state.phase,
            "committed checkpoint"
        );
        Ok(sequence_no)
    }

    /// Latest checkpoint of an instance.
    pub async fn latest(&self, instance_id: &InstanceId) -> Result<Option<Checkpoint>, CheckpointError> {
        self.repo
            .load_latest(instance_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// A retained historical checkpoint.
    pub async fn at(
        &self,
        instance_id: &InstanceId,
        sequence_no: u64,
    ) -> Result<Checkpoint, CheckpointError> {
        self.repo
            .load_at(instance_id, sequence_no)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or_else(|| CheckpointError::NotRetained {
                instance_id: instance_id.clone(),
                sequence_no,
            })
    }

    /// Retained checkpoints, newest first.
    pub async fn history(
        &self,
        instance_id: &InstanceId,
        limit: u32,
    ) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.repo
            .list_history(instance_id, limit)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn list(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<InstanceSummary>, CheckpointError> {
        self.repo
            .list_instances(status)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("instance already has a checkpoint: {0}")]
    AlreadyExists(InstanceId),

    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// Another writer committed after the expected sequence number.
    #[error("stale checkpoint for {instance_id}: sequence {expected} is no longer latest")]
    Stale {
        instance_id: InstanceId,
        expected: u64,
    },

    #[error("checkpoint {sequence_no} of {instance_id} is not retained")]
    NotRetained {
        instance_id: InstanceId,
        sequence_no: u64,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
