//! Modelyard Core - local model weight discovery and metadata toolkit
//!
//! This crate turns a human-given model identifier into a concrete,
//! validated weight file on disk. It provides:
//!
//! - A GGUF metadata reader that recovers architecture, quantization, and
//!   context length from a weight file without loading the weights
//! - A resolution engine walking a prioritized set of locations
//!   (config override, environment root, configured root, fallback)
//! - A discovery scanner cataloging the models under a set of roots
//! - A quantization policy ranking remote variants against local resources
//! - A registry client and fetcher with atomic on-disk materialization
//!
//! # Example
//!
//! ```ignore
//! use modelyard_core::{resolve, ModelId, ResolutionConfig};
//!
//! let config = ResolutionConfig::from_sources(None, env_root, fallback)?;
//! let id: ModelId = "mistralai/mistral-7b".parse()?;
//! let resolved = resolve(&id, &config)?;
//! println!("{}", resolved.file.display());
//! ```

pub mod config;
pub mod error;
pub mod gguf;
pub mod model;

pub use config::{FileConfig, ModelOverride, MODELS_DIR_ENV};
pub use error::{Error, Result};
pub use gguf::{GgufHeader, GgufValue, ModelMetadata, ModelSummary, TensorInfo};

pub use model::{
    rank, resolve, scan, CachedEntry, DiscoveredModel, DiskMetadataStore, DownloadProgress,
    Fetcher, MemoryMetadataStore, MetadataStore, ModelId, ModelRoot, QuantClass, RegistryClient,
    RegistryModel, RemoteVariant, ResolutionConfig, ResolvedModel, RootTier, ScanReport,
    ScanWarning, ShadowedModel, SystemFacts, WeightFormat,
};
