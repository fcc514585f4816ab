//! Checkpoint repository trait definition.
//!
//! Defines the durable store for workflow instance snapshots: the latest
//! checkpoint per instance plus a bounded, append-only history of earlier
//! snapshots. The infrastructure layer (phasegate-infra) implements this
//! trait with SQLite persistence.

use phasegate_types::error::RepositoryError;
use phasegate_types::workflow::{Checkpoint, InstanceId, InstanceStatus, InstanceSummary};

/// Repository trait for checkpoint persistence.
///
/// Writers are serialised per instance through an optimistic sequence check:
/// `save` only succeeds when the stored latest sequence number equals
/// `expected_sequence`, so two racing writers can never both win.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointRepository: Send + Sync {
    /// Persist the first checkpoint of a new instance.
    ///
    /// Returns `RepositoryError::Conflict` if the instance already exists.
    fn create(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace the latest checkpoint and append it to history.
    ///
    /// Returns `RepositoryError::Conflict` if the stored sequence number is
    /// not `expected_sequence`, and `RepositoryError::NotFound` if the
    /// instance has never been created.
    fn save(
        &self,
        checkpoint: &Checkpoint,
        expected_sequence: u64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Latest checkpoint for an instance.
    fn load_latest(
        &self,
        instance_id: &InstanceId,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// A specific retained checkpoint by sequence number.
    fn load_at(
        &self,
        instance_id: &InstanceId,
        sequence_no: u64,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// Retained checkpoints for an instance, newest first.
    fn list_history(
        &self,
        instance_id: &InstanceId,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;

    /// Summaries of every instance's latest checkpoint, optionally filtered
    /// by status, most recently updated first.
    fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<InstanceSummary>, RepositoryError>> + Send;
}

/// Build the listing row for a checkpoint.
pub fn summarize(checkpoint: &Checkpoint) -> InstanceSummary {
    InstanceSummary {
        instance_id: checkpoint.state.instance_id.clone(),
        phase: checkpoint.state.phase,
        status: checkpoint.state.status(),
        sequence_no: checkpoint.sequence_no,
        created_at: checkpoint.state.created_at,
        updated_at: checkpoint.state.updated_at,
    }
}
