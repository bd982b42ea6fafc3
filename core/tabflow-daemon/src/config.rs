//! Daemon runtime config (`~/.tabflow/daemon/tabflow.toml`).

use serde::Deserialize;
use std::path::PathBuf;

use tabflow_core::EngineConfig;

pub const CONFIG_ENV: &str = "TABFLOW_CONFIG";
const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".tabflow/daemon/tabflow.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub engine: EngineConfig,
}

pub fn default_config_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

/// Loads the config, or defaults when the file does not exist.
pub fn load_runtime_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read config {}: {}",
            config_path.display(),
            err
        )
    })?;
    toml::from_str::<DaemonConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse config {}: {}",
            config_path.display(),
            err
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_runtime_config_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("missing.toml");
        let config = load_runtime_config(Some(path)).expect("load config");
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn load_runtime_config_parses_partial_engine_table() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("tabflow.toml");
        fs_err::write(
            &path,
            r#"
[engine]
guard_window_secs = 30
undo_window_secs = 8
"#,
        )
        .expect("write config");

        let config = load_runtime_config(Some(path)).expect("load config");
        assert_eq!(config.engine.guard_window_secs, 30);
        assert_eq!(config.engine.undo_window_secs, 8);
        assert_eq!(config.engine.guard_retry_secs, 60);
        assert_eq!(config.engine.stash_sweep_interval_minutes, 60);
    }

    #[test]
    fn load_runtime_config_rejects_malformed_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("tabflow.toml");
        fs_err::write(&path, "[engine\nguard_window_secs = ").expect("write config");

        let err = load_runtime_config(Some(path)).expect_err("malformed");
        assert!(err.contains("Failed to parse config"));
    }
}
