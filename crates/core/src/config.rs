//! Reloader configuration, read from JSON or YAML and overridden by environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::translate::VersionPolicy;
use crate::watch::WatchFilter;

pub const ENV_DEBOUNCE_MS: &str = "HOTSWAP_DEBOUNCE_MS";
pub const ENV_FILE_SUFFIX: &str = "HOTSWAP_FILE_SUFFIX";
pub const ENV_VERSION_POLICY: &str = "HOTSWAP_VERSION_POLICY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid JSON config {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid YAML config {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Invalid value for {var}: {reason}")]
    Env { var: &'static str, reason: String },
}

/// Settings for watching, debouncing and resolving reloaded modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloaderConfig {
    /// Directories watched recursively once the reloader starts.
    pub watch_roots: Vec<PathBuf>,
    pub file_suffix: String,
    pub ignored_dirs: Vec<String>,
    pub debounce_ms: u64,
    pub version_policy: VersionPolicy,
    /// Reload records kept in memory; older ones are dropped first.
    pub history_limit: usize,
}

impl Default for ReloaderConfig {
    fn default() -> Self {
        Self {
            watch_roots: Vec::new(),
            file_suffix: ".hsm".to_string(),
            ignored_dirs: vec!["obj".to_string()],
            debounce_ms: 3000,
            version_policy: VersionPolicy::Lax,
            history_limit: 256,
        }
    }
}

impl ReloaderConfig {
    /// Load from a `.yaml`/`.yml` or JSON file. Environment overrides are not applied.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
            Some("yaml" | "yml")
        );
        if is_yaml {
            serde_yaml::from_str(&text)
                .map_err(|source| ConfigError::Yaml { path: path.display().to_string(), source })
        } else {
            serde_json::from_str(&text)
                .map_err(|source| ConfigError::Json { path: path.display().to_string(), source })
        }
    }

    /// Defaults, or the given file, with environment overrides applied.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_DEBOUNCE_MS) {
            self.debounce_ms = raw
                .trim()
                .parse()
                .map_err(|e| ConfigError::Env { var: ENV_DEBOUNCE_MS, reason: format!("{e}") })?;
        }
        if let Some(raw) = lookup(ENV_FILE_SUFFIX) {
            if raw.is_empty() {
                return Err(ConfigError::Env { var: ENV_FILE_SUFFIX, reason: "empty suffix".into() });
            }
            self.file_suffix = raw;
        }
        if let Some(raw) = lookup(ENV_VERSION_POLICY) {
            self.version_policy =
                raw.parse().map_err(|reason| ConfigError::Env { var: ENV_VERSION_POLICY, reason })?;
        }
        Ok(self)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn filter(&self) -> WatchFilter {
        WatchFilter::new(self.file_suffix.clone(), self.ignored_dirs.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ReloaderConfig::default();
        assert_eq!(config.debounce(), Duration::from_secs(3));
        assert_eq!(config.file_suffix, ".hsm");
        assert_eq!(config.ignored_dirs, vec!["obj".to_string()]);
        assert_eq!(config.version_policy, VersionPolicy::Lax);
    }

    #[test]
    fn yaml_and_json_files_are_supported() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("hotswap.yaml");
        std::fs::write(&yaml, "debounce_ms: 250\nversion_policy: strict\n").unwrap();
        let config = ReloaderConfig::from_file(&yaml).unwrap();
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.version_policy, VersionPolicy::Strict);
        assert_eq!(config.file_suffix, ".hsm");

        let json = dir.path().join("hotswap.json");
        std::fs::write(&json, r#"{"file_suffix": ".mod", "watch_roots": ["mods"]}"#).unwrap();
        let config = ReloaderConfig::from_file(&json).unwrap();
        assert_eq!(config.file_suffix, ".mod");
        assert_eq!(config.watch_roots, vec![PathBuf::from("mods")]);
    }

    #[test]
    fn environment_overrides_file_values() {
        let config = ReloaderConfig::default()
            .with_overrides(env(&[(ENV_DEBOUNCE_MS, "75"), (ENV_VERSION_POLICY, "STRICT")]))
            .unwrap();
        assert_eq!(config.debounce_ms, 75);
        assert_eq!(config.version_policy, VersionPolicy::Strict);
    }

    #[test]
    fn bad_override_is_an_error() {
        let err = ReloaderConfig::default()
            .with_overrides(env(&[(ENV_DEBOUNCE_MS, "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_DEBOUNCE_MS));
    }
}
