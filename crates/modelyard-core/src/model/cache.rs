//! On-disk metadata cache.
//!
//! A memoization aid for the discovery scanner: parsed summaries keyed by
//! identifier, guarded by the source file's length and mtime. The cache can
//! only ever skip work; a mismatched stat always forces a fresh parse, and
//! the fresh result is always written back. Failures on either side are a
//! cache miss, never an operation failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::gguf::ModelSummary;
use crate::model::id::ModelId;

/// One cached parse, valid only while the weight file's stat matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub file_len: u64,
    pub mtime_secs: u64,
    pub summary: ModelSummary,
}

/// Identifier-keyed metadata store. Modeled as an explicit collaborator so
/// tests can substitute [`MemoryMetadataStore`].
pub trait MetadataStore {
    fn get(&self, id: &ModelId) -> Option<CachedEntry>;
    fn put(&self, id: &ModelId, entry: &CachedEntry);
}

/// Disk-backed store: one JSON file per identifier under a cache directory.
pub struct DiskMetadataStore {
    dir: PathBuf,
}

impl DiskMetadataStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn entry_path(&self, id: &ModelId) -> PathBuf {
        self.dir
            .join(format!("{}__{}.json", id.namespace(), id.name()))
    }
}

impl MetadataStore for DiskMetadataStore {
    fn get(&self, id: &ModelId) -> Option<CachedEntry> {
        let path = self.entry_path(id);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "discarding unreadable cache entry");
                None
            }
        }
    }

    fn put(&self, id: &ModelId, entry: &CachedEntry) {
        let path = self.entry_path(id);
        match serde_json::to_string(entry) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&path, raw) {
                    warn!(path = %path.display(), error = %e, "failed to write cache entry");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize cache entry"),
        }
    }
}

/// In-memory store for tests and embedders that want memoization without
/// touching disk.
#[derive(Default)]
pub struct MemoryMetadataStore {
    entries: Mutex<HashMap<ModelId, CachedEntry>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn get(&self, id: &ModelId) -> Option<CachedEntry> {
        self.entries.lock().unwrap().get(id).cloned()
    }

    fn put(&self, id: &ModelId, entry: &CachedEntry) {
        self.entries
            .lock()
            .unwrap()
            .insert(id.clone(), entry.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> CachedEntry {
        CachedEntry {
            file_len: 1024,
            mtime_secs: 1_700_000_000,
            summary: ModelSummary {
                architecture: "llama".to_string(),
                display_name: "Test".to_string(),
                parameter_count: Some(7_000_000_000),
                quantization: "Q4_K".to_string(),
                context_length: Some(4096),
                file_size: 1024,
            },
        }
    }

    #[test]
    fn disk_store_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskMetadataStore::new(tmp.path().join("cache")).unwrap();
        let id: ModelId = "acme/model-x".parse().unwrap();

        assert!(store.get(&id).is_none());
        let entry = sample_entry();
        store.put(&id, &entry);
        assert_eq!(store.get(&id), Some(entry));
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskMetadataStore::new(tmp.path().to_path_buf()).unwrap();
        let id: ModelId = "acme/model-x".parse().unwrap();
        std::fs::write(tmp.path().join("acme__model-x.json"), "{not json").unwrap();
        assert!(store.get(&id).is_none());
    }
}
