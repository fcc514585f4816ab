//! Application state wiring the engine to its infrastructure.
//!
//! AppState holds the concrete engine used by both CLI and REST API. The
//! engine is generic over its checkpoint repository; AppState pins it to the
//! SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use phasegate_core::workflow::WorkflowEngine;
use phasegate_infra::config::{load_global_config, resolve_data_dir};
use phasegate_infra::handler::build_registry;
use phasegate_infra::sqlite::checkpoint::SqliteCheckpointRepository;
use phasegate_infra::sqlite::pool::{DatabasePool, database_url};
use phasegate_types::config::GlobalConfig;

/// Engine pinned to SQLite checkpoint storage.
pub type ConcreteEngine = WorkflowEngine<SqliteCheckpointRepository>;

/// Shared application state.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub config: Arc<GlobalConfig>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize the application state: load config, open the database,
    /// build phase handlers, and wire the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();

        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_global_config(&data_dir).await;

        // Phase commands run relative to where `pgate` was invoked.
        let working_dir = std::env::current_dir().context("Failed to read current directory")?;

        Self::open(data_dir, config, &working_dir).await
    }

    /// Open the checkpoint database under `data_dir` and wire the engine.
    pub async fn open(
        data_dir: PathBuf,
        config: GlobalConfig,
        working_dir: &Path,
    ) -> anyhow::Result<Self> {
        let db_url = format!("{}?mode=rwc", database_url(&data_dir));
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("Failed to open checkpoint database at {db_url}"))?;
        let repo = SqliteCheckpointRepository::new(db_pool, config.orchestrator.history_limit);

        let handlers = build_registry(&config, working_dir);
        let engine = WorkflowEngine::new(Arc::new(repo), handlers, config.orchestrator.clone());

        Ok(Self {
            engine: Arc::new(engine),
            config: Arc::new(config),
            data_dir,
        })
    }
}
