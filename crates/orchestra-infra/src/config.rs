//! Engine configuration loading from `config.toml`.
//!
//! Reads `{data_dir}/config.toml` and parses it into `EngineConfig`.
//! A missing or malformed file falls back to defaults rather than failing.

use std::path::Path;

use orchestra_core::engine::normalize_config;
use orchestra_types::config::EngineConfig;

/// Load the engine configuration from `{data_dir}/config.toml`.
///
/// - File missing: returns `EngineConfig::default()` (debug log).
/// - File unreadable or invalid TOML: returns defaults (warn log).
/// - Zero-sized limits are raised to 1 so the engine can make progress.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => normalize_config(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_types::config::DeletePolicy;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
default_step_timeout_ms = 1000
max_active_executions = 8
delete_policy = "allow_with_warning"

[health]
degraded_failure_rate = 0.1
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.default_step_timeout_ms, 1_000);
        assert_eq!(config.max_active_executions, Some(8));
        assert_eq!(config.delete_policy, DeletePolicy::AllowWithWarning);
        assert_eq!(config.health.degraded_failure_rate, 0.1);
        assert_eq!(config.health.min_samples, 5);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn zero_limits_are_raised() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            "max_concurrent_steps = 0\nsubscriber_buffer = 0\nmax_active_executions = 0\n",
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_steps, 1);
        assert_eq!(config.subscriber_buffer, 1);
        assert_eq!(config.max_active_executions, Some(1));
    }
}
