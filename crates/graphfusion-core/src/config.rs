//! Engine configuration loader.
//!
//! Reads `engine.toml` from a configuration directory and deserializes it
//! into [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::Path;
use std::time::Duration;

use graphfusion_types::config::EngineConfig;
use graphfusion_types::workflow::ConcreteStep;

/// Load engine configuration from `{config_dir}/engine.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but cannot be read or parsed, logs a warning and
///   returns the default.
/// - Otherwise returns the parsed config.
pub async fn load_engine_config(config_dir: &Path) -> EngineConfig {
    let config_path = config_dir.join("engine.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("No engine.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Resolve the per-attempt timeout of a step.
///
/// The step's own `timeout` wins; otherwise the configured default applies.
pub fn resolve_step_timeout(config: &EngineConfig, step: &ConcreteStep) -> Duration {
    step.timeout().unwrap_or_else(|| config.step_timeout())
}

/// Resolve the retry budget of a step.
pub fn resolve_retries(config: &EngineConfig, step: &ConcreteStep) -> u32 {
    step.retries.unwrap_or(config.default_retries)
}

#[cfg(test)]
mod tests {
    use super::*;
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
            tmp.path().join("engine.toml"),
            r#"
default_step_timeout_secs = 5
default_retries = 2
max_parallel_steps = 8
event_capacity = 64
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.step_timeout(), Duration::from_secs(5));
        assert_eq!(config.default_retries, 2);
        assert_eq!(config.max_parallel_steps, Some(8));
        assert_eq!(config.event_capacity, 64);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("engine.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn step_overrides_win_over_defaults() {
        let config = EngineConfig {
            default_retries: 4,
            ..EngineConfig::default()
        };
        let plain = ConcreteStep::new("s", "a", "c");
        assert_eq!(resolve_step_timeout(&config, &plain), Duration::from_secs(300));
        assert_eq!(resolve_retries(&config, &plain), 4);

        let tuned = plain.with_timeout_secs(0.25).with_retries(1);
        assert_eq!(resolve_step_timeout(&config, &tuned), Duration::from_millis(250));
        assert_eq!(resolve_retries(&config, &tuned), 1);
    }
}
