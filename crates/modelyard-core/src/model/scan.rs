//! Discovery scanner: catalog the models under a set of roots.
//!
//! Walks each root exactly two levels deep (`namespace/model-name`),
//! inspects leaf directories for weight files, and yields one catalog entry
//! per discovered identifier. Per-item failures degrade that item and are
//! recorded as warnings; they never abort the scan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::gguf::{self, ModelSummary};
use crate::model::cache::{CachedEntry, MetadataStore};
use crate::model::id::ModelId;
use crate::model::resolve::{select_weight_file, ModelRoot, RootTier, WeightFormat};

/// Weight files considered per leaf directory. Bounds the work done in
/// pathologically large directories.
pub const SCAN_DIR_FILE_CAP: usize = 10;

/// One discovered model.
#[derive(Debug, Clone)]
pub struct DiscoveredModel {
    pub id: ModelId,
    pub path: PathBuf,
    pub format: WeightFormat,
    pub tier: RootTier,
    pub file_size: u64,
    pub metadata: Option<ModelSummary>,
}

/// A model found under a lower-precedence root while the same identifier
/// already resolved elsewhere. Kept for override diagnostics only.
#[derive(Debug, Clone)]
pub struct ShadowedModel {
    pub id: ModelId,
    pub path: PathBuf,
    pub tier: RootTier,
    pub winner: PathBuf,
}

/// A per-item problem encountered during the scan.
#[derive(Debug, Clone)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub message: String,
}

/// Scan outcome: the catalog plus diagnostics.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub models: BTreeMap<ModelId, DiscoveredModel>,
    pub shadowed: Vec<ShadowedModel>,
    pub warnings: Vec<ScanWarning>,
}

/// Walk the given roots in order. The slice order is the precedence order:
/// when two roots hold the same identifier, the earlier root wins and the
/// later entry is retained only in [`ScanReport::shadowed`]. Never depends
/// on filesystem iteration order.
pub fn scan(roots: &[ModelRoot], cache: Option<&dyn MetadataStore>) -> ScanReport {
    let mut report = ScanReport::default();

    for root in roots {
        if !root.path.is_dir() {
            debug!(root = %root.path.display(), "skipping absent root");
            continue;
        }
        for (ns_name, ns_dir) in sorted_subdirs(&root.path, &mut report.warnings) {
            for (model_name, model_dir) in sorted_subdirs(&ns_dir, &mut report.warnings) {
                let Some((file, format)) = select_weight_file(&model_dir, SCAN_DIR_FILE_CAP)
                else {
                    continue;
                };
                let id = ModelId::new(&ns_name, &model_name);
                if let Some(existing) = report.models.get(&id) {
                    report.shadowed.push(ShadowedModel {
                        id,
                        path: file,
                        tier: root.tier,
                        winner: existing.path.clone(),
                    });
                    continue;
                }
                let (file_size, metadata) =
                    summarize(&id, &file, format, cache, &mut report.warnings);
                report.models.insert(
                    id.clone(),
                    DiscoveredModel {
                        id,
                        path: file,
                        format,
                        tier: root.tier,
                        file_size,
                        metadata,
                    },
                );
            }
        }
    }

    report
}

/// Subdirectories of `dir`, sorted by name. Read failures become warnings.
fn sorted_subdirs(dir: &Path, warnings: &mut Vec<ScanWarning>) -> Vec<(String, PathBuf)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warnings.push(ScanWarning {
                path: dir.to_path_buf(),
                message: format!("unreadable directory: {e}"),
            });
            return Vec::new();
        }
    };
    let mut dirs: Vec<(String, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            Some((name, e.path()))
        })
        .collect();
    dirs.sort_by(|a, b| a.0.cmp(&b.0));
    dirs
}

/// Metadata for one weight file, through the cache when it is fresh.
///
/// A cache entry is honored only while the file's length and mtime still
/// match; anything else is parsed fresh and written back, so a changed file
/// can never be masked by the store.
fn summarize(
    id: &ModelId,
    file: &Path,
    format: WeightFormat,
    cache: Option<&dyn MetadataStore>,
    warnings: &mut Vec<ScanWarning>,
) -> (u64, Option<ModelSummary>) {
    let stat = match std::fs::metadata(file) {
        Ok(stat) => stat,
        Err(e) => {
            warnings.push(ScanWarning {
                path: file.to_path_buf(),
                message: format!("cannot stat weight file: {e}"),
            });
            return (0, None);
        }
    };
    let file_len = stat.len();
    if format != WeightFormat::Gguf {
        return (file_len, None);
    }
    let mtime_secs = stat
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    if let Some(store) = cache {
        if let Some(entry) = store.get(id) {
            if entry.file_len == file_len && entry.mtime_secs == mtime_secs {
                debug!(id = %id, "using cached metadata");
                return (file_len, Some(entry.summary));
            }
        }
    }

    match gguf::parse_file(file) {
        Ok(meta) => {
            let summary = ModelSummary::from(&meta);
            if let Some(store) = cache {
                store.put(
                    id,
                    &CachedEntry {
                        file_len,
                        mtime_secs,
                        summary: summary.clone(),
                    },
                );
            }
            (file_len, Some(summary))
        }
        Err(e) => {
            warnings.push(ScanWarning {
                path: file.to_path_buf(),
                message: e.to_string(),
            });
            (file_len, None)
        }
    }
}
