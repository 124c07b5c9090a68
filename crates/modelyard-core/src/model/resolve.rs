//! Model resolution: identifier to weight file on disk.
//!
//! Walks a prioritized set of locations (explicit override, environment
//! root, configured root, hard-coded fallback) and stops at the first tier
//! holding a recognized weight file. GGUF winners are enriched with parsed
//! metadata; a parse failure degrades the enrichment, never the resolution.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::{expand_tilde, FileConfig};
use crate::error::{Error, Result};
use crate::gguf::{self, ModelMetadata};
use crate::model::id::ModelId;

/// Origin tier of a resolved or discovered model, ordered highest
/// precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RootTier {
    /// Per-identifier path override from the config file.
    Override,
    /// Root supplied through the environment.
    Environment,
    /// Default root from the config file.
    Config,
    /// Hard-coded fallback root.
    Fallback,
}

impl fmt::Display for RootTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RootTier::Override => "override",
            RootTier::Environment => "environment",
            RootTier::Config => "config",
            RootTier::Fallback => "fallback",
        };
        write!(f, "{label}")
    }
}

/// One models root directory with its precedence tier.
#[derive(Debug, Clone)]
pub struct ModelRoot {
    pub path: PathBuf,
    pub tier: RootTier,
}

/// Recognized weight-file formats. GGUF is the primary format and the only
/// one with structured metadata; safetensors is accepted as a fallback with
/// size and presence recorded only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    Gguf,
    Safetensors,
}

impl WeightFormat {
    fn from_file_name(name: &str) -> Option<Self> {
        if name.ends_with(".gguf") {
            Some(WeightFormat::Gguf)
        } else if name.ends_with(".safetensors") {
            Some(WeightFormat::Safetensors)
        } else {
            None
        }
    }
}

impl fmt::Display for WeightFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightFormat::Gguf => write!(f, "gguf"),
            WeightFormat::Safetensors => write!(f, "safetensors"),
        }
    }
}

/// Ordered resolution inputs: roots highest-precedence first plus the
/// per-identifier override map. Built once per invocation from explicit
/// sources; the engine keeps no hidden global state.
#[derive(Debug, Clone)]
pub struct ResolutionConfig {
    pub roots: Vec<ModelRoot>,
    pub overrides: BTreeMap<ModelId, PathBuf>,
}

impl ResolutionConfig {
    /// Assemble the tier list from a parsed config file, the environment
    /// root (read by the caller), and the fallback root.
    pub fn from_sources(
        file: Option<&FileConfig>,
        env_root: Option<PathBuf>,
        fallback_root: PathBuf,
    ) -> Result<Self> {
        let mut roots = Vec::new();
        if let Some(dir) = env_root {
            roots.push(ModelRoot {
                path: expand_tilde(&dir),
                tier: RootTier::Environment,
            });
        }
        if let Some(dir) = file.and_then(|f| f.models_dir.as_deref()) {
            roots.push(ModelRoot {
                path: expand_tilde(dir),
                tier: RootTier::Config,
            });
        }
        roots.push(ModelRoot {
            path: fallback_root,
            tier: RootTier::Fallback,
        });

        let mut overrides = BTreeMap::new();
        if let Some(file) = file {
            for (key, entry) in &file.models {
                let id: ModelId = key
                    .parse()
                    .map_err(|e| Error::ConfigError(format!("bad override key: {e}")))?;
                overrides.insert(id, expand_tilde(&entry.path));
            }
        }

        Ok(Self { roots, overrides })
    }

    /// Highest-precedence root, used as the materialization target for
    /// downloads.
    pub fn download_root(&self) -> &Path {
        &self.roots[0].path
    }

    /// Directory a fetched model is materialized under.
    pub fn model_dir(&self, id: &ModelId) -> PathBuf {
        self.download_root().join(id.rel_path())
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub id: ModelId,
    pub dir: PathBuf,
    pub file: PathBuf,
    pub format: WeightFormat,
    pub tier: RootTier,
    pub file_size: u64,
    pub metadata: Option<ModelMetadata>,
}

/// Resolve an identifier to a concrete weight file.
///
/// Tier order: override, then each configured root joined with
/// `namespace/name`. The first tier holding a recognized weight file wins;
/// exhausting them all yields [`Error::ModelNotFound`] carrying every
/// location searched, in order.
pub fn resolve(id: &ModelId, config: &ResolutionConfig) -> Result<ResolvedModel> {
    let mut searched: Vec<PathBuf> = Vec::new();

    if let Some(override_path) = config.overrides.get(id) {
        if override_path.is_file() {
            let dir = override_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let format = override_path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(WeightFormat::from_file_name)
                .unwrap_or(WeightFormat::Gguf);
            return finish(id, dir, override_path.clone(), format, RootTier::Override);
        }
        if let Some((file, format)) = select_weight_file(override_path, usize::MAX) {
            return finish(id, override_path.clone(), file, format, RootTier::Override);
        }
        // A stale override line must not mask the lower tiers.
        searched.push(override_path.clone());
    }

    for root in &config.roots {
        let dir = root.path.join(id.rel_path());
        if let Some((file, format)) = select_weight_file(&dir, usize::MAX) {
            return finish(id, dir, file, format, root.tier);
        }
        searched.push(dir);
    }

    Err(Error::ModelNotFound {
        id: id.to_string(),
        searched,
    })
}

fn finish(
    id: &ModelId,
    dir: PathBuf,
    file: PathBuf,
    format: WeightFormat,
    tier: RootTier,
) -> Result<ResolvedModel> {
    let file_size = std::fs::metadata(&file)?.len();
    let metadata = match format {
        WeightFormat::Gguf => match gguf::parse_file(&file) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(file = %file.display(), error = %e, "failed to parse weight metadata");
                None
            }
        },
        WeightFormat::Safetensors => None,
    };
    debug!(id = %id, file = %file.display(), %tier, "resolved model");
    Ok(ResolvedModel {
        id: id.clone(),
        dir,
        file,
        format,
        tier,
        file_size,
        metadata,
    })
}

/// Deterministically pick the weight file for a model directory: GGUF files
/// first, then safetensors, each in ascending lexical filename order. At
/// most `cap` candidate files are considered. Returns `None` for a missing,
/// unreadable, or weight-free directory.
pub(crate) fn select_weight_file(dir: &Path, cap: usize) -> Option<(PathBuf, WeightFormat)> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| WeightFormat::from_file_name(name).is_some())
        .collect();
    names.sort();
    names.truncate(cap);

    let chosen = names
        .iter()
        .find(|name| name.ends_with(".gguf"))
        .or_else(|| names.first())?;
    let format = WeightFormat::from_file_name(chosen)?;
    Some((dir.join(chosen), format))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smallest well-formed GGUF file: magic, v3, zero tensors, zero
    /// metadata entries.
    pub(crate) fn write_minimal_gguf(path: &Path) {
        let mut buf = Vec::new();
        buf.extend(crate::gguf::GGUF_MAGIC);
        buf.extend(3u32.to_le_bytes());
        buf.extend(0u64.to_le_bytes());
        buf.extend(0u64.to_le_bytes());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, buf).unwrap();
    }

    fn env_config(env_root: &Path, fallback: &Path) -> ResolutionConfig {
        ResolutionConfig::from_sources(
            None,
            Some(env_root.to_path_buf()),
            fallback.to_path_buf(),
        )
        .unwrap()
    }

    #[test]
    fn resolves_through_environment_root() {
        let tmp = tempfile::tempdir().unwrap();
        let env_root = tmp.path().join("models");
        write_minimal_gguf(&env_root.join("acme/model-x/model.gguf"));

        let config = env_config(&env_root, &tmp.path().join("fallback"));
        let id: ModelId = "acme/model-x".parse().unwrap();
        let resolved = resolve(&id, &config).unwrap();
        assert_eq!(resolved.dir, env_root.join("acme/model-x"));
        assert_eq!(resolved.tier, RootTier::Environment);
        assert_eq!(resolved.format, WeightFormat::Gguf);
        assert!(resolved.metadata.is_some());
    }

    #[test]
    fn bare_name_resolves_under_default_namespace() {
        let tmp = tempfile::tempdir().unwrap();
        let env_root = tmp.path().join("models");
        write_minimal_gguf(&env_root.join("default/bare-model/weights.gguf"));

        let config = env_config(&env_root, &tmp.path().join("fallback"));
        let id: ModelId = "bare-model".parse().unwrap();
        let resolved = resolve(&id, &config).unwrap();
        assert_eq!(resolved.dir, env_root.join("default/bare-model"));
    }

    #[test]
    fn override_beats_environment_root() {
        let tmp = tempfile::tempdir().unwrap();
        let env_root = tmp.path().join("models");
        write_minimal_gguf(&env_root.join("acme/model-x/model.gguf"));
        let override_file = tmp.path().join("elsewhere/special.gguf");
        write_minimal_gguf(&override_file);

        let mut config = env_config(&env_root, &tmp.path().join("fallback"));
        let id: ModelId = "acme/model-x".parse().unwrap();
        config.overrides.insert(id.clone(), override_file.clone());

        let resolved = resolve(&id, &config).unwrap();
        assert_eq!(resolved.file, override_file);
        assert_eq!(resolved.tier, RootTier::Override);
    }

    #[test]
    fn stale_override_falls_through_and_is_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let env_root = tmp.path().join("models");
        write_minimal_gguf(&env_root.join("acme/model-x/model.gguf"));
        let missing = tmp.path().join("gone.gguf");

        let mut config = env_config(&env_root, &tmp.path().join("fallback"));
        let id: ModelId = "acme/model-x".parse().unwrap();
        config.overrides.insert(id.clone(), missing);

        let resolved = resolve(&id, &config).unwrap();
        assert_eq!(resolved.tier, RootTier::Environment);
    }

    #[test]
    fn weight_selection_is_lexical_and_prefers_gguf() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("m");
        write_minimal_gguf(&dir.join("b-variant.gguf"));
        write_minimal_gguf(&dir.join("a-variant.gguf"));
        std::fs::write(dir.join("0-first.safetensors"), b"st").unwrap();

        let (file, format) = select_weight_file(&dir, usize::MAX).unwrap();
        assert_eq!(file.file_name().unwrap(), "a-variant.gguf");
        assert_eq!(format, WeightFormat::Gguf);
    }

    #[test]
    fn safetensors_accepted_without_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let env_root = tmp.path().join("models");
        let dir = env_root.join("lmstudio/phi-3");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("model.safetensors"), b"not parsed").unwrap();

        let config = env_config(&env_root, &tmp.path().join("fallback"));
        let id: ModelId = "lmstudio/phi-3".parse().unwrap();
        let resolved = resolve(&id, &config).unwrap();
        assert_eq!(resolved.format, WeightFormat::Safetensors);
        assert!(resolved.metadata.is_none());
        assert_eq!(resolved.file_size, 10);
    }

    #[test]
    fn not_found_lists_every_searched_location_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let env_root = tmp.path().join("env");
        let fallback = tmp.path().join("fallback");

        let config = env_config(&env_root, &fallback);
        let id: ModelId = "acme/missing".parse().unwrap();
        match resolve(&id, &config) {
            Err(Error::ModelNotFound { searched, .. }) => {
                assert_eq!(
                    searched,
                    vec![
                        env_root.join("acme/missing"),
                        fallback.join("acme/missing"),
                    ]
                );
            }
            other => panic!("expected ModelNotFound, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_gguf_degrades_to_no_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let env_root = tmp.path().join("models");
        let dir = env_root.join("acme/broken");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("model.gguf"), b"GGUF then garbage").unwrap();

        let config = env_config(&env_root, &tmp.path().join("fallback"));
        let id: ModelId = "acme/broken".parse().unwrap();
        let resolved = resolve(&id, &config).unwrap();
        assert_eq!(resolved.format, WeightFormat::Gguf);
        assert!(resolved.metadata.is_none());
    }
}
