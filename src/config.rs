//! Inspector configuration.
//!
//! Layered as defaults, then an optional JSON file, then `LOUPE_*` environment
//! variables. Command-line flags are applied last by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use lens::engine::EngineConfig;
use lens::scorer::NoVerdictPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Rows per results page.
pub const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InspectorConfig {
    /// Rows per page of the results table.
    pub page_size: usize,
    /// How rows without a prediction count toward accuracy.
    pub no_verdict: NoVerdictPolicy,
    /// Number of rows on the current page to draw as ASCII previews.
    pub preview: usize,
    /// Where to write PNG renders of the current page, if anywhere.
    pub export_dir: Option<PathBuf>,
    /// Per-call engine timeout in milliseconds; `None` waits forever.
    pub call_timeout_ms: Option<u64>,
    pub target_partitions: usize,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            no_verdict: NoVerdictPolicy::default(),
            preview: 0,
            export_dir: None,
            call_timeout_ms: None,
            target_partitions: 1,
        }
    }
}

impl InspectorConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {}", path.display());
        config.validate()
    }

    /// Defaults, overlaid with `path` if given, then with the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        base.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `LOUPE_PAGE_SIZE`, `LOUPE_NO_VERDICT`, `LOUPE_CALL_TIMEOUT_MS`
    /// (0 disables the timeout) and `LOUPE_TARGET_PARTITIONS`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(n) = parse_var::<usize>(&lookup, "LOUPE_PAGE_SIZE")? {
            self.page_size = n;
        }
        if let Some(policy) = parse_var::<NoVerdictPolicy>(&lookup, "LOUPE_NO_VERDICT")? {
            self.no_verdict = policy;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "LOUPE_CALL_TIMEOUT_MS")? {
            self.call_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "LOUPE_TARGET_PARTITIONS")? {
            self.target_partitions = n;
        }
        self.validate()
    }

    pub fn validate(self) -> Result<Self> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "page_size".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.target_partitions == 0 {
            return Err(ConfigError::Invalid {
                key: "target_partitions".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(self)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_target_partitions(self.target_partitions)
            .with_call_timeout(self.call_timeout_ms.map(Duration::from_millis))
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            reason: format!("{raw:?}: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = InspectorConfig::default();
        assert_eq!(config.page_size, 20);
        assert_eq!(config.no_verdict, NoVerdictPolicy::CountAsIncorrect);
        assert!(config.engine_config().call_timeout.is_none());
    }

    #[test]
    fn test_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"page_size": 50, "no_verdict": "exclude", "call_timeout_ms": 500}}"#)
            .unwrap();
        let config = InspectorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.no_verdict, NoVerdictPolicy::Exclude);
        assert_eq!(config.preview, 0);
        assert_eq!(
            config.engine_config().call_timeout,
            Some(Duration::from_millis(500))
        );

        let config = config
            .with_env_overrides(env(&[
                ("LOUPE_PAGE_SIZE", "5"),
                ("LOUPE_CALL_TIMEOUT_MS", "0"),
                ("LOUPE_NO_VERDICT", "incorrect"),
            ]))
            .unwrap();
        assert_eq!(config.page_size, 5);
        assert_eq!(config.call_timeout_ms, None);
        assert_eq!(config.no_verdict, NoVerdictPolicy::CountAsIncorrect);
    }

    #[test]
    fn test_invalid_values() {
        let err = InspectorConfig::default()
            .with_env_overrides(env(&[("LOUPE_PAGE_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "LOUPE_PAGE_SIZE"));

        let err = InspectorConfig::default()
            .with_env_overrides(env(&[("LOUPE_PAGE_SIZE", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "page_size"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"pagesize": 5}}"#).unwrap();
        assert!(matches!(
            InspectorConfig::from_file(file.path()),
            Err(ConfigError::Json { .. })
        ));
        assert!(matches!(
            InspectorConfig::from_file(Path::new("/definitely/not/here.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
