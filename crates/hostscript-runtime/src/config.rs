use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ScriptError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Entries idle at least this long are evicted by the sweeper.
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_idle_ttl_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,
    #[serde(default = "default_max_expr_depth")]
    pub max_expr_depth: usize,
}

fn default_max_call_levels() -> usize {
    64
}
fn default_max_expr_depth() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_call_levels: default_max_call_levels(),
            max_expr_depth: default_max_expr_depth(),
        }
    }
}

/// Tags attached to every line a guest script logs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggerConfig {
    pub project: Option<String>,
    pub module: Option<String>,
    pub group: Option<String>,
    pub key: Option<String>,
}

impl RuntimeConfig {
    pub fn from_file(path: &Path) -> Result<Self, ScriptError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ScriptError::Config(format!("Failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ScriptError> {
        toml::from_str(content).map_err(|e| ScriptError::Config(format!("Failed to parse config: {e}")))
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        // A zero period would make the sweeper spin.
        Duration::from_secs(self.cache.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config.idle_ttl(), Duration::from_secs(300));
        assert_eq!(config.sweep_interval(), Duration::from_secs(600));
        assert_eq!(config.engine.max_call_levels, 64);
        assert_eq!(config.engine.max_expr_depth, 64);
        assert!(config.logger.project.is_none());
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
[cache]
idle_ttl_secs = 30
sweep_interval_secs = 5

[engine]
max_call_levels = 16
max_expr_depth = 32

[logger]
project = "plant-a"
module = "decoder"
"#;
        let config = RuntimeConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.cache.idle_ttl_secs, 30);
        assert_eq!(config.cache.sweep_interval_secs, 5);
        assert_eq!(config.engine.max_call_levels, 16);
        assert_eq!(config.engine.max_expr_depth, 32);
        assert_eq!(config.logger.project.as_deref(), Some("plant-a"));
        assert_eq!(config.logger.module.as_deref(), Some("decoder"));
        assert!(config.logger.key.is_none());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = RuntimeConfig::from_toml_str("[cache]\nidle_ttl_secs = 1\n").unwrap();
        assert_eq!(config.cache.idle_ttl_secs, 1);
        assert_eq!(config.cache.sweep_interval_secs, 600);
    }

    #[test]
    fn zero_sweep_interval_is_clamped() {
        let config = RuntimeConfig::from_toml_str("[cache]\nsweep_interval_secs = 0\n").unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn malformed_config_is_a_config_error() {
        let err = RuntimeConfig::from_toml_str("[cache\nidle_ttl_secs = ").unwrap_err();
        assert!(matches!(err, ScriptError::Config(_)));
    }

    #[test]
    fn reads_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nmax_call_levels = 8").unwrap();
        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.engine.max_call_levels, 8);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RuntimeConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ScriptError::Config(_)));
    }
}
