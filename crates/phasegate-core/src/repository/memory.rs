//! In-process checkpoint repository backed by a `DashMap`.
//!
//! Each instance maps to its retained checkpoints, oldest first. All checks
//! and writes for one instance happen under that instance's shard lock, so
//! the optimistic sequence check is atomic.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use phasegate_types::error::RepositoryError;
use phasegate_types::workflow::{Checkpoint, InstanceId, InstanceStatus, InstanceSummary};

use super::checkpoint::{CheckpointRepository, summarize};

/// Non-durable `CheckpointRepository` for tests and dry runs.
#[derive(Debug)]
pub struct InMemoryCheckpointRepository {
    instances: DashMap<InstanceId, Vec<Checkpoint>>,
    history_limit: usize,
}

impl InMemoryCheckpointRepository {
    pub fn new(history_limit: u32) -> Self {
        Self {
            instances: DashMap::new(),
            history_limit: history_limit.max(1) as usize,
        }
    }

    fn prune(&self, history: &mut Vec<Checkpoint>) {
        if history.len() > self.history_limit {
            let excess = history.len() - self.history_limit;
            history.drain(..excess);
        }
    }
}

impl Default for InMemoryCheckpointRepository {
    fn default() -> Self {
        Self::new(20)
    }
}

impl CheckpointRepository for InMemoryCheckpointRepository {
    async fn create(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        match self.instances.entry(checkpoint.instance_id().clone()) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "instance '{}' already exists",
                checkpoint.instance_id()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(vec![checkpoint.clone()]);
                Ok(())
            }
        }
    }

    async fn save(
        &self,
        checkpoint: &Checkpoint,
        expected_sequence: u64,
    ) -> Result<(), RepositoryError> {
        let mut history = self
            .instances
            .get_mut(checkpoint.instance_id())
            .ok_or(RepositoryError::NotFound)?;

        let current = history.last().map(|c| c.sequence_no).unwrap_or(0);
        if current != expected_sequence {
            return Err(RepositoryError::Conflict(format!(
                "expected sequence {expected_sequence}, found {current}"
            )));
        }

        history.push(checkpoint.clone());
        self.prune(&mut history);
        Ok(())
    }

    async fn load_latest(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self
            .instances
            .get(instance_id)
            .and_then(|history| history.last().cloned()))
    }

    async fn load_at(
        &self,
        instance_id: &InstanceId,
        sequence_no: u64,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self.instances.get(instance_id).and_then(|history| {
            history
                .iter()
                .find(|c| c.sequence_no == sequence_no)
                .cloned()
        }))
    }

    async fn list_history(
        &self,
        instance_id: &InstanceId,
        limit: u32,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        Ok(self
            .instances
            .get(instance_id)
            .map(|history| {
                history
                    .iter()
                    .rev()
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<InstanceSummary>, RepositoryError> {
        let mut summaries: Vec<InstanceSummary> = self
            .instances
            .iter()
            .filter_map(|entry| entry.value().last().map(summarize))
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .collect();
        summaries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(summaries)
    }
}
