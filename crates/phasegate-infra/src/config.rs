//! Global configuration loader for phasegate.
//!
//! Reads `config.toml` from the data directory (`~/.phasegate/` by default)
//! and deserializes it into [`GlobalConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use phasegate_types::config::GlobalConfig;
use phasegate_types::workflow::Phase;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "PHASEGATE_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `PHASEGATE_DATA_DIR` environment variable
/// 2. `~/.phasegate`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".phasegate");
    }

    PathBuf::from(".phasegate")
}

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`GlobalConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Handler entries that do not name a working phase are logged and dropped.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => sanitize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}

fn sanitize(mut config: GlobalConfig) -> GlobalConfig {
    config.handlers.retain(|name, _| {
        let known = name.parse::<Phase>().is_ok_and(|p| p.is_working());
        if !known {
            tracing::warn!(handler = name.as_str(), "ignoring handler for unknown phase");
        }
        known
    });

    for gate in &config.orchestrator.gates {
        if !gate.after.is_working() {
            tracing::warn!(
                gate = gate.name.as_str(),
                after = %gate.after,
                "gate is attached to a terminal phase and will never open"
            );
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasegate_types::config::HandlerConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_global_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.orchestrator.max_retries, 2);
        assert!(config.handlers.is_empty());
    }

    #[tokio::test]
    async fn load_global_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[orchestrator]
max_retries = 4
history_limit = 50

[handlers.generation]
kind = "command"
program = "chartgen"
timeout_secs = 60
"#,
        )
        .await
        .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.orchestrator.max_retries, 4);
        assert_eq!(config.orchestrator.history_limit, 50);
        assert!(matches!(
            config.handler_for(Phase::Generation),
            Some(HandlerConfig::Command { timeout_secs: 60, .. })
        ));
    }

    #[tokio::test]
    async fn load_global_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.orchestrator.loop_ceiling, 30);
        assert!(config.handlers.is_empty());
    }

    #[tokio::test]
    async fn unknown_handler_phases_are_dropped() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[handlers.planning]
kind = "passthrough"

[handlers.deploy]
kind = "passthrough"

[handlers.complete]
kind = "passthrough"
"#,
        )
        .await
        .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.handlers.len(), 1);
        assert!(config.handler_for(Phase::Planning).is_some());
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var(DATA_DIR_ENV, "/tmp/test-phasegate");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-phasegate"));
        unsafe {
            std::env::remove_var(DATA_DIR_ENV);
        }
    }
}
