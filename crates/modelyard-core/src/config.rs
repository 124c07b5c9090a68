//! Configuration types for the modelyard toolkit.
//!
//! The surrounding CLI loads the YAML config file and the environment and
//! hands everything to the core as explicit values; nothing in here reads
//! process-global state on its own except the documented helpers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable supplying a models root directory. Joined with
/// `namespace/name` during resolution.
pub const MODELS_DIR_ENV: &str = "MODELYARD_MODELS_DIR";

/// On-disk configuration file (YAML).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    /// Default root directory for model weights.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,

    /// Per-identifier overrides, keyed by `namespace/name` (a bare name
    /// implies the `default` namespace).
    #[serde(default)]
    pub models: BTreeMap<String, ModelOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOverride {
    /// Explicit path to a weight file or a model directory.
    pub path: PathBuf,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::ConfigError(format!("failed to parse {}: {e}", path.display())))
    }

    /// Load the file if it exists; a missing file is not an error.
    pub fn load_if_present(path: &Path) -> Result<Option<Self>> {
        if path.exists() {
            Ok(Some(Self::load(path)?))
        } else {
            Ok(None)
        }
    }
}

/// Default location of the config file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("modelyard")
        .join("config.yaml")
}

/// Hard-coded fallback models root, used when neither the environment nor
/// the config file supplies one.
pub fn fallback_models_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modelyard")
        .join("models")
}

/// Cache directory for parsed-metadata and registry-lookup stores.
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("modelyard")
}

/// Expand a leading `~` to the user's home directory. Configured paths may
/// use the `~/...` convention.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_yaml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "models_dir: /srv/models").unwrap();
        writeln!(f, "models:").unwrap();
        writeln!(f, "  local/custom:").unwrap();
        writeln!(f, "    path: /opt/weights/custom.gguf").unwrap();
        drop(f);

        let config = FileConfig::load(&path).unwrap();
        assert_eq!(config.models_dir, Some(PathBuf::from("/srv/models")));
        assert_eq!(
            config.models["local/custom"].path,
            PathBuf::from("/opt/weights/custom.gguf")
        );
    }

    #[test]
    fn malformed_yaml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "models_dir: [unterminated").unwrap();
        let err = FileConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = FileConfig::load_if_present(&dir.path().join("nope.yaml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn tilde_expansion_leaves_absolute_paths_alone() {
        assert_eq!(
            expand_tilde(Path::new("/srv/models")),
            PathBuf::from("/srv/models")
        );
    }
}
