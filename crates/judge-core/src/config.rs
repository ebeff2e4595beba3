use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

fn default_base_dir() -> PathBuf {
    PathBuf::from("submissions")
}

fn default_host_dir() -> PathBuf {
    PathBuf::from("/submissions")
}

const fn default_queue_size() -> usize {
    16
}

const fn default_max_container_count() -> usize {
    8
}

/// Dispatcher configuration, as described in spec.md §4.2.
///
/// `base_dir` and `host_dir` are deliberately kept distinct: the dispatcher
/// process may itself run inside a container while the sandbox containers it
/// spawns are siblings, so the two are the same mount point seen from two
/// filesystems.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_host_dir")]
    pub host_dir: PathBuf,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_max_container_count")]
    pub max_container_count: usize,
    pub image: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            host_dir: default_host_dir(),
            queue_size: default_queue_size(),
            max_container_count: default_max_container_count(),
            image: "sandbox".to_string(),
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is logged and ignored; the caller gets defaults. This
    /// mirrors the original dispatcher's behaviour of treating a missing
    /// config file as non-fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "dispatcher config not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = DispatcherConfig::load("/nonexistent/dispatcher.json").unwrap();
        assert_eq!(config.queue_size, 16);
        assert_eq!(config.max_container_count, 8);
        assert_eq!(config.base_dir, PathBuf::from("submissions"));
        assert_eq!(config.image, "sandbox");
    }

    #[test]
    fn parses_provided_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatcher.json");
        std::fs::write(
            &path,
            r#"{"queue_size": 4, "max_container_count": 2, "image": "sandbox:latest"}"#,
        )
        .unwrap();

        let config = DispatcherConfig::load(&path).unwrap();
        assert_eq!(config.queue_size, 4);
        assert_eq!(config.max_container_count, 2);
        assert_eq!(config.image, "sandbox:latest");
        assert_eq!(config.host_dir, PathBuf::from("/submissions"));
    }
}
