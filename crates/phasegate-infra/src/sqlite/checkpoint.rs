//! SQLite checkpoint repository implementation.
//!
//! Implements `CheckpointRepository` from `phasegate-core` using sqlx with
//! split read/write pools. The latest checkpoint of each instance lives in
//! `workflow_instances`; every checkpoint is also appended to
//! `workflow_checkpoints`, which is pruned to the newest `history_limit` rows
//! per instance. States are stored as JSON blobs.

use chrono::{DateTime, SecondsFormat, Utc};
use phasegate_core::repository::checkpoint::CheckpointRepository;
use phasegate_types::error::RepositoryError;
use phasegate_types::workflow::{
    Checkpoint, InstanceId, InstanceStatus, InstanceSummary, Phase, WorkflowState,
};
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointRepository`.
pub struct SqliteCheckpointRepository {
    pool: DatabasePool,
    history_limit: u32,
}

impl SqliteCheckpointRepository {
    /// Create a new repository backed by the given database pool, retaining
    /// at most `history_limit` checkpoints per instance.
    pub fn new(pool: DatabasePool, history_limit: u32) -> Self {
        Self {
            pool,
            history_limit: history_limit.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct CheckpointRow {
    sequence_no: i64,
    state: String,
    timestamp: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow, timestamp_column: &str) -> Result<Self, sqlx::Error> {
        Ok(Self {
            sequence_no: row.try_get("sequence_no")?,
            state: row.try_get("state")?,
            timestamp: row.try_get(timestamp_column)?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let state: WorkflowState = serde_json::from_str(&self.state)
            .map_err(|e| RepositoryError::Query(format!("invalid state JSON: {e}")))?;
        Ok(Checkpoint::new(
            self.sequence_no as u64,
            state,
            parse_datetime(&self.timestamp)?,
        ))
    }
}

struct SummaryRow {
    instance_id: String,
    sequence_no: i64,
    phase: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl SummaryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            sequence_no: row.try_get("sequence_no")?,
            phase: row.try_get("phase")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_summary(self) -> Result<InstanceSummary, RepositoryError> {
        let phase: Phase = self.phase.parse().map_err(RepositoryError::Query)?;
        let status: InstanceStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(InstanceSummary {
            instance_id: InstanceId::new(self.instance_id),
            phase,
            status,
            sequence_no: self.sequence_no as u64,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC form so that text ordering in SQL matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn state_json(checkpoint: &Checkpoint) -> Result<String, RepositoryError> {
    serde_json::to_string(&checkpoint.state)
        .map_err(|e| RepositoryError::Query(format!("serialize state: {e}")))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// CheckpointRepository impl
// ---------------------------------------------------------------------------

impl CheckpointRepository for SqliteCheckpointRepository {
    async fn create(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let state = state_json(checkpoint)?;
        let instance_id = checkpoint.instance_id().as_str();
        let timestamp = format_datetime(&checkpoint.timestamp);

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        sqlx::query(
            r#"INSERT INTO workflow_instances
               (instance_id, sequence_no, phase, status, state, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance_id)
        .bind(checkpoint.sequence_no as i64)
        .bind(checkpoint.state.phase.as_str())
        .bind(checkpoint.state.status().as_str())
        .bind(&state)
        .bind(format_datetime(&checkpoint.state.created_at))
        .bind(&timestamp)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.message().contains("UNIQUE") {
                    return RepositoryError::Conflict(format!(
                        "instance '{instance_id}' already exists"
                    ));
                }
            }
            query_error(e)
        })?;

        sqlx::query(
            "INSERT INTO workflow_checkpoints (instance_id, sequence_no, phase, state, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(instance_id)
        .bind(checkpoint.sequence_no as i64)
        .bind(checkpoint.state.phase.as_str())
        .bind(&state)
        .bind(&timestamp)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn save(
        &self,
        checkpoint: &Checkpoint,
        expected_sequence: u64,
    ) -> Result<(), RepositoryError> {
        let state = state_json(checkpoint)?;
        let instance_id = checkpoint.instance_id().as_str();
        let timestamp = format_datetime(&checkpoint.timestamp);

        // Dropping `tx` on an early return rolls it back.
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let updated = sqlx::query(
            r#"UPDATE workflow_instances
               SET sequence_no = ?, phase = ?, status = ?, state = ?, updated_at = ?
               WHERE instance_id = ? AND sequence_no = ?"#,
        )
        .bind(checkpoint.sequence_no as i64)
        .bind(checkpoint.state.phase.as_str())
        .bind(checkpoint.state.status().as_str())
        .bind(&state)
        .bind(&timestamp)
        .bind(instance_id)
        .bind(expected_sequence as i64)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if updated.rows_affected() == 0 {
            let current: Option<(i64,)> =
                sqlx::query_as("SELECT sequence_no FROM workflow_instances WHERE instance_id = ?")
                    .bind(instance_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(query_error)?;
            return Err(match current {
                Some((found,)) => RepositoryError::Conflict(format!(
                    "expected sequence {expected_sequence}, found {found}"
                )),
                None => RepositoryError::NotFound,
            });
        }

        sqlx::query(
            "INSERT INTO workflow_checkpoints (instance_id, sequence_no, phase, state, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(instance_id)
        .bind(checkpoint.sequence_no as i64)
        .bind(checkpoint.state.phase.as_str())
        .bind(&state)
        .bind(&timestamp)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.message().contains("UNIQUE") {
                    return RepositoryError::Conflict(format!(
                        "checkpoint {} of '{instance_id}' already exists",
                        checkpoint.sequence_no
                    ));
                }
            }
            query_error(e)
        })?;

        let pruned = sqlx::query(
            r#"DELETE FROM workflow_checkpoints
               WHERE instance_id = ? AND sequence_no NOT IN (
                   SELECT sequence_no FROM workflow_checkpoints
                   WHERE instance_id = ?
                   ORDER BY sequence_no DESC
                   LIMIT ?
               )"#,
        )
        .bind(instance_id)
        .bind(instance_id)
        .bind(self.history_limit as i64)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;

        if pruned.rows_affected() > 0 {
            tracing::debug!(
                instance_id,
                pruned = pruned.rows_affected(),
                "pruned checkpoint history"
            );
        }
        Ok(())
    }

    async fn load_latest(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(
            "SELECT sequence_no, state, updated_at FROM workflow_instances WHERE instance_id = ?",
        )
        .bind(instance_id.as_str())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row, "updated_at").map_err(query_error)?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn load_at(
        &self,
        instance_id: &InstanceId,
        sequence_no: u64,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(
            "SELECT sequence_no, state, created_at FROM workflow_checkpoints
             WHERE instance_id = ? AND sequence_no = ?",
        )
        .bind(instance_id.as_str())
        .bind(sequence_no as i64)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row, "created_at").map_err(query_error)?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn list_history(
        &self,
        instance_id: &InstanceId,
        limit: u32,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT sequence_no, state, created_at FROM workflow_checkpoints
             WHERE instance_id = ? ORDER BY sequence_no DESC LIMIT ?",
        )
        .bind(instance_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = CheckpointRow::from_row(row, "created_at").map_err(query_error)?;
            checkpoints.push(r.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<InstanceSummary>, RepositoryError> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT instance_id, sequence_no, phase, status, created_at, updated_at
                     FROM workflow_instances WHERE status = ?
                     ORDER BY updated_at DESC, instance_id ASC",
                )
                .bind(s.as_str())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT instance_id, sequence_no, phase, status, created_at, updated_at
                     FROM workflow_instances ORDER BY updated_at DESC, instance_id ASC",
                )
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_error)?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = SummaryRow::from_row(row).map_err(query_error)?;
            summaries.push(r.into_summary()?);
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasegate_types::event::EventKind;
    use serde_json::json;

    async fn test_repo(history_limit: u32) -> SqliteCheckpointRepository {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        let pool = DatabasePool::new(&url).await.unwrap();
        SqliteCheckpointRepository::new(pool, history_limit)
    }

    fn checkpoint(id: &str, sequence_no: u64) -> Checkpoint {
        let now = Utc::now();
        let mut state = WorkflowState::new(InstanceId::from(id), json!({"chart": "nginx"}), now);
        state.loop_counter = sequence_no as u32;
        state.record(EventKind::PhaseStarted, Some(format!("step {sequence_no}")), now);
        Checkpoint::new(sequence_no, state, now)
    }

    #[tokio::test]
    async fn test_create_and_load_latest() {
        let repo = test_repo(20).await;
        let cp = checkpoint("I1", 1);
        repo.create(&cp).await.unwrap();

        let loaded = repo.load_latest(&InstanceId::from("I1")).await.unwrap().unwrap();
        assert_eq!(loaded.sequence_no, 1);
        assert_eq!(loaded.state, cp.state);
        assert!(loaded.state.flags_consistent());
    }

    #[tokio::test]
    async fn test_load_latest_missing_is_none() {
        let repo = test_repo(20).await;
        assert!(repo.load_latest(&InstanceId::from("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_create_is_conflict() {
        let repo = test_repo(20).await;
        repo.create(&checkpoint("I1", 1)).await.unwrap();
        let err = repo.create(&checkpoint("I1", 1)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_save_advances_sequence() {
        let repo = test_repo(20).await;
        repo.create(&checkpoint("I1", 1)).await.unwrap();
        repo.save(&checkpoint("I1", 2), 1).await.unwrap();
        repo.save(&checkpoint("I1", 3), 2).await.unwrap();

        let latest = repo.load_latest(&InstanceId::from("I1")).await.unwrap().unwrap();
        assert_eq!(latest.sequence_no, 3);
        assert_eq!(latest.state.loop_counter, 3);
    }

    #[tokio::test]
    async fn test_stale_save_is_conflict_and_changes_nothing() {
        let repo = test_repo(20).await;
        repo.create(&checkpoint("I1", 1)).await.unwrap();
        repo.save(&checkpoint("I1", 2), 1).await.unwrap();

        let err = repo.save(&checkpoint("I1", 2), 1).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let history = repo.list_history(&InstanceId::from("I1"), 10).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_save_unknown_instance_is_not_found() {
        let repo = test_repo(20).await;
        let err = repo.save(&checkpoint("ghost", 2), 1).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_history_is_pruned_newest_first() {
        let repo = test_repo(3).await;
        repo.create(&checkpoint("I1", 1)).await.unwrap();
        for seq in 2..=6 {
            repo.save(&checkpoint("I1", seq), seq - 1).await.unwrap();
        }

        let id = InstanceId::from("I1");
        let history = repo.list_history(&id, 100).await.unwrap();
        let seqs: Vec<u64> = history.iter().map(|c| c.sequence_no).collect();
        assert_eq!(seqs, vec![6, 5, 4]);

        assert!(repo.load_at(&id, 1).await.unwrap().is_none());
        let at = repo.load_at(&id, 5).await.unwrap().unwrap();
        assert_eq!(at.state.loop_counter, 5);
    }

    #[tokio::test]
    async fn test_list_instances_filters_by_status() {
        let repo = test_repo(20).await;
        repo.create(&checkpoint("running-1", 1)).await.unwrap();

        let mut done = checkpoint("done-1", 1);
        repo.create(&done).await.unwrap();
        done.sequence_no = 2;
        done.state.phase = Phase::Complete;
        repo.save(&done, 1).await.unwrap();

        let all = repo.list_instances(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let running = repo.list_instances(Some(InstanceStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].instance_id, InstanceId::from("running-1"));

        let complete = repo.list_instances(Some(InstanceStatus::Complete)).await.unwrap();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].phase, Phase::Complete);
        assert_eq!(complete[0].sequence_no, 2);
    }

    #[test]
    fn test_format_datetime_is_fixed_width() {
        let base = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc);
        let instants = [
            base,
            base + chrono::Duration::microseconds(1),
            base + chrono::Duration::milliseconds(120),
            base + chrono::Duration::microseconds(500_000),
            base + chrono::Duration::seconds(1),
        ];
        let formatted: Vec<String> = instants.iter().map(format_datetime).collect();
        assert!(formatted.iter().all(|f| f.len() == formatted[0].len()));
        assert_eq!(formatted[0], "2026-03-01T12:00:00.000000Z");

        let mut sorted = formatted.clone();
        sorted.sort();
        assert_eq!(sorted, formatted);

        for (dt, text) in instants.iter().zip(&formatted) {
            assert_eq!(parse_datetime(text).unwrap(), *dt);
        }
    }

    #[tokio::test]
    async fn test_list_instances_orders_within_one_second() {
        let repo = test_repo(20).await;
        let base = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc);

        let mut earlier = checkpoint("earlier", 1);
        earlier.timestamp = base + chrono::Duration::microseconds(123_456);
        let mut later = checkpoint("later", 1);
        later.timestamp = base + chrono::Duration::milliseconds(500);
        let mut whole = checkpoint("whole", 1);
        whole.timestamp = base;

        repo.create(&later).await.unwrap();
        repo.create(&whole).await.unwrap();
        repo.create(&earlier).await.unwrap();

        let all = repo.list_instances(None).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|s| s.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["later", "earlier", "whole"]);
    }
}
