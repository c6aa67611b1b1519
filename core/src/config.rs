//! Configuration discovery and loading for the orchestrator.
//!
//! Engine defaults come from a TOML file discovered at
//! `.maestro/config.toml` (working directory) or the path named by the
//! `MAESTRO_CONFIG` environment variable, with per-field environment
//! overrides applied on top. Absent any file, built-in defaults apply.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::EngineDefaults;
use crate::errors::{ConfigError, ConfigResult};

/// Engine scheduling defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Concurrency bound applied to plans that don't set their own.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Timeout applied to calls that declare none, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_timeout_ms: None,
        }
    }
}

/// Retry defaults applied to calls whose policy leaves fields unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RetryDefaults {
    /// Backoff floor, in milliseconds, for retry policies with no backoff
    /// of their own.
    #[serde(default)]
    pub backoff_ms: u64,
}

/// Logging defaults consumed by the CLI's subscriber setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryDefaults,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.engine.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn engine_defaults(&self) -> EngineDefaults {
        EngineDefaults {
            default_timeout_ms: self.engine.default_timeout_ms,
            max_concurrency: self.engine.max_concurrency,
            retry_backoff_ms: self.retry.backoff_ms,
        }
    }
}

/// Where to look for a configuration file.
#[derive(Debug, Clone)]
pub enum ConfigDiscovery {
    /// `.maestro/config.toml` in the working directory, then the
    /// `MAESTRO_CONFIG` environment variable.
    Default,
    Explicit(PathBuf),
}

/// Loads configuration from the filesystem with environment overrides.
pub struct ConfigLoader {
    discovery: ConfigDiscovery,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            discovery: ConfigDiscovery::Default,
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            discovery: ConfigDiscovery::Explicit(path.into()),
        }
    }

    /// Discover, read, and validate configuration.
    pub fn load(&self) -> ConfigResult<OrchestratorConfig> {
        let mut config = match self.discover()? {
            Some(path) => {
                debug!(path = %path.display(), "loading config file");
                Self::read_file(&path)?
            }
            None => {
                debug!("no config file found, using defaults");
                OrchestratorConfig::default()
            }
        };
        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn discover(&self) -> ConfigResult<Option<PathBuf>> {
        match &self.discovery {
            ConfigDiscovery::Explicit(path) => {
                if !path.exists() {
                    return Err(ConfigError::Invalid(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                Ok(Some(path.clone()))
            }
            ConfigDiscovery::Default => {
                let local = PathBuf::from(".maestro/config.toml");
                if local.exists() {
                    return Ok(Some(local));
                }
                match env::var("MAESTRO_CONFIG") {
                    Ok(path) => {
                        let path = PathBuf::from(path);
                        if path.exists() {
                            Ok(Some(path))
                        } else {
                            warn!(path = %path.display(), "MAESTRO_CONFIG points at a missing file");
                            Ok(None)
                        }
                    }
                    Err(_) => Ok(None),
                }
            }
        }
    }

    fn read_file(path: &Path) -> ConfigResult<OrchestratorConfig> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_env_overrides(config: &mut OrchestratorConfig) {
    if let Some(n) = read_env::<usize>("MAESTRO_MAX_CONCURRENCY") {
        config.engine.max_concurrency = n;
    }
    if let Some(ms) = read_env::<u64>("MAESTRO_DEFAULT_TIMEOUT_MS") {
        config.engine.default_timeout_ms = Some(ms);
    }
    if let Ok(level) = env::var("MAESTRO_LOG_LEVEL") {
        if !level.is_empty() {
            config.logging.level = level;
        }
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(var = name, value = %value, "ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Mutex, MutexGuard};

    /// Environment variables are process-global; every test that loads
    /// config (and so runs `apply_env_overrides`) serializes on this lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_guard() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn clear_overrides() {
        env::remove_var("MAESTRO_CONFIG");
        env::remove_var("MAESTRO_MAX_CONCURRENCY");
        env::remove_var("MAESTRO_DEFAULT_TIMEOUT_MS");
        env::remove_var("MAESTRO_LOG_LEVEL");
    }

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.engine.max_concurrency, 4);
        assert!(config.engine.default_timeout_ms.is_none());
        assert_eq!(config.retry.backoff_ms, 0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = OrchestratorConfig {
            engine: EngineConfig {
                max_concurrency: 0,
                default_timeout_ms: None,
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn explicit_path_loads_toml() {
        let _guard = env_guard();
        clear_overrides();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[engine]\nmax_concurrency = 8\ndefault_timeout_ms = 1500\n\n[retry]\nbackoff_ms = 25\n\n[logging]\nlevel = \"debug\""
        )
        .unwrap();

        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        assert_eq!(config.engine.max_concurrency, 8);
        assert_eq!(config.engine.default_timeout_ms, Some(1500));
        assert_eq!(config.retry.backoff_ms, 25);
        assert_eq!(config.logging.level, "debug");

        let defaults = config.engine_defaults();
        assert_eq!(defaults.max_concurrency, 8);
        assert_eq!(defaults.default_timeout_ms, Some(1500));
        assert_eq!(defaults.retry_backoff_ms, 25);
    }

    #[test]
    fn missing_explicit_path_errors() {
        let loader = ConfigLoader::with_path("/nonexistent/maestro.toml");
        assert!(matches!(loader.load(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let _guard = env_guard();
        clear_overrides();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nmax_concurrency = 2").unwrap();

        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        assert_eq!(config.engine.max_concurrency, 2);
        assert_eq!(config.retry.backoff_ms, 0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn env_overrides_beat_file_values() {
        let _guard = env_guard();
        clear_overrides();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nmax_concurrency = 8\ndefault_timeout_ms = 1500").unwrap();

        env::set_var("MAESTRO_MAX_CONCURRENCY", "2");
        env::set_var("MAESTRO_DEFAULT_TIMEOUT_MS", "300");
        env::set_var("MAESTRO_LOG_LEVEL", "trace");
        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        clear_overrides();

        assert_eq!(config.engine.max_concurrency, 2);
        assert_eq!(config.engine.default_timeout_ms, Some(300));
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn unparseable_env_override_is_ignored() {
        let _guard = env_guard();
        clear_overrides();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nmax_concurrency = 8").unwrap();

        env::set_var("MAESTRO_MAX_CONCURRENCY", "lots");
        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        clear_overrides();

        assert_eq!(config.engine.max_concurrency, 8);
    }

    #[test]
    fn maestro_config_var_is_discovered() {
        let _guard = env_guard();
        clear_overrides();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nmax_concurrency = 3").unwrap();

        env::set_var("MAESTRO_CONFIG", file.path());
        let config = ConfigLoader::new().load().unwrap();
        clear_overrides();

        assert_eq!(config.engine.max_concurrency, 3);
    }
}
