//! Registry lookup and weight-file retrieval.
//!
//! The registry side talks to the Hugging Face API: a direct model lookup
//! with a GGUF-filtered search fallback, and a repo tree listing filtered
//! to `.gguf` files. Lookups go through a 7-day on-disk cache.
//!
//! The transfer side streams into a `.tmp` file next to the final name,
//! verifies the received size against the advertised one, and only then
//! renames into place. A failed, cancelled, or short transfer removes the
//! temporary file and leaves nothing at the final path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::id::ModelId;
use crate::model::policy::QuantClass;

pub const HF_BASE_URL: &str = "https://huggingface.co";

const LOOKUP_CACHE_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;
const DOWNLOAD_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("modelyard/", env!("CARGO_PKG_VERSION"));

/// A model repository on the remote registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryModel {
    pub id: String,
}

/// One downloadable GGUF file of a registry repository.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteVariant {
    pub filename: String,
    pub path: String,
    pub size: u64,
    pub quantization: Option<QuantClass>,
    pub url: String,
}

/// Progress of a single in-flight transfer.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub percent: f32,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(default)]
    size: u64,
}

#[derive(Serialize, Deserialize)]
struct LookupCacheRecord {
    timestamp: u64,
    data: RegistryModel,
}

/// Remote registry queries, with an on-disk lookup cache.
pub struct RegistryClient {
    http: reqwest::Client,
    cache_dir: Option<PathBuf>,
}

impl RegistryClient {
    /// `cache_dir`, when given, holds the 7-day lookup cache.
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &cache_dir {
            std::fs::create_dir_all(dir)?;
        }
        let http = reqwest::Client::builder()
            .timeout(REGISTRY_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::RegistryError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, cache_dir })
    }

    /// Find the registry repository for an identifier: direct lookup first,
    /// then a GGUF-filtered search.
    pub async fn lookup(&self, id: &ModelId) -> Result<RegistryModel> {
        let cache_key = format!("{}__{}", id.namespace(), id.name());
        if let Some(dir) = &self.cache_dir {
            if let Some(hit) = read_cached_lookup(dir, &cache_key, now_secs()) {
                debug!(id = %id, repo = %hit.id, "registry lookup served from cache");
                return Ok(hit);
            }
        }

        let direct = format!("{HF_BASE_URL}/api/models/{id}");
        let resp = self
            .http
            .get(&direct)
            .send()
            .await
            .map_err(|e| Error::RegistryError(format!("registry request failed: {e}")))?;
        if resp.status().is_success() {
            let model: RegistryModel = resp
                .json()
                .await
                .map_err(|e| Error::RegistryError(format!("bad registry response: {e}")))?;
            self.remember(&cache_key, &model);
            return Ok(model);
        }

        debug!(id = %id, status = %resp.status(), "direct lookup missed; searching");
        let query = format!("{} {} gguf", id.namespace(), id.name());
        let resp = self
            .http
            .get(format!("{HF_BASE_URL}/api/models"))
            .query(&[("search", query.as_str()), ("filter", "gguf"), ("limit", "10")])
            .send()
            .await
            .map_err(|e| Error::RegistryError(format!("registry search failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::RegistryError(format!(
                "registry search returned HTTP {}",
                resp.status()
            )));
        }
        let results: Vec<RegistryModel> = resp
            .json()
            .await
            .map_err(|e| Error::RegistryError(format!("bad search response: {e}")))?;
        match results.into_iter().next() {
            Some(model) => {
                self.remember(&cache_key, &model);
                Ok(model)
            }
            None => Err(Error::RegistryError(format!(
                "model '{id}' not found on the registry"
            ))),
        }
    }

    /// List the `.gguf` files of a repository as downloadable variants.
    pub async fn list_gguf_files(&self, repo_id: &str) -> Result<Vec<RemoteVariant>> {
        let url = format!("{HF_BASE_URL}/api/models/{repo_id}/tree/main");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::RegistryError(format!("file listing failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::RegistryError(format!(
                "file listing for '{repo_id}' returned HTTP {}",
                resp.status()
            )));
        }
        let entries: Vec<TreeEntry> = resp
            .json()
            .await
            .map_err(|e| Error::RegistryError(format!("bad file listing: {e}")))?;

        Ok(entries
            .into_iter()
            .filter(|e| e.path.ends_with(".gguf"))
            .map(|e| {
                let filename = e
                    .path
                    .rsplit('/')
                    .next()
                    .unwrap_or(e.path.as_str())
                    .to_string();
                RemoteVariant {
                    url: format!("{HF_BASE_URL}/{repo_id}/resolve/main/{}", e.path),
                    quantization: QuantClass::from_filename(&filename),
                    filename,
                    path: e.path,
                    size: e.size,
                }
            })
            .collect())
    }

    fn remember(&self, key: &str, model: &RegistryModel) {
        if let Some(dir) = &self.cache_dir {
            write_cached_lookup(dir, key, model, now_secs());
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn lookup_cache_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.json"))
}

fn read_cached_lookup(dir: &Path, key: &str, now: u64) -> Option<RegistryModel> {
    let path = lookup_cache_path(dir, key);
    let raw = std::fs::read_to_string(&path).ok()?;
    let record: LookupCacheRecord = serde_json::from_str(&raw).ok()?;
    if now.saturating_sub(record.timestamp) > LOOKUP_CACHE_EXPIRY_SECS {
        let _ = std::fs::remove_file(&path);
        return None;
    }
    Some(record.data)
}

fn write_cached_lookup(dir: &Path, key: &str, model: &RegistryModel, now: u64) {
    let record = LookupCacheRecord {
        timestamp: now,
        data: model.clone(),
    };
    match serde_json::to_string(&record) {
        Ok(raw) => {
            if let Err(e) = std::fs::write(lookup_cache_path(dir, key), raw) {
                warn!(error = %e, "failed to write registry cache entry");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize registry cache entry"),
    }
}

#[derive(Debug)]
enum AttemptError {
    /// Worth retrying: connection trouble, server errors, short bodies.
    Transient(String),
    /// Not worth retrying: the resource is absent or the client is at fault.
    Permanent(String),
    Cancelled,
}

/// Streams transfers with atomic on-disk materialization. Concurrent
/// downloads to the same destination path are refused; unrelated paths
/// proceed independently.
pub struct Fetcher {
    http: reqwest::Client,
    in_flight: Mutex<HashSet<PathBuf>>,
}

impl Fetcher {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::DownloadFailed(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Download a variant into `dest_dir`, reporting progress through the
    /// optional channel and honoring the cancel signal. Transient failures
    /// are retried with doubling backoff; on any final failure the
    /// temporary file is removed and nothing appears at the final name.
    pub async fn download(
        &self,
        variant: &RemoteVariant,
        dest_dir: &Path,
        progress: Option<mpsc::Sender<DownloadProgress>>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let final_path = dest_dir.join(&variant.filename);
        if final_path.exists() {
            debug!(path = %final_path.display(), "already downloaded");
            return Ok(final_path);
        }
        let _guard = self.claim(final_path.clone())?;
        let tmp_path = dest_dir.join(format!("{}.tmp", variant.filename));

        let mut delay = RETRY_BASE_DELAY;
        let mut attempt_no = 0u32;
        loop {
            attempt_no += 1;
            let outcome = self
                .attempt(variant, &tmp_path, &final_path, progress.as_ref(), &mut cancel)
                .await;
            match outcome {
                Ok(()) => {
                    info!(path = %final_path.display(), bytes = variant.size, "download complete");
                    return Ok(final_path);
                }
                Err(AttemptError::Cancelled) => {
                    return Err(Error::DownloadFailed("download cancelled".to_string()));
                }
                Err(AttemptError::Permanent(msg)) => {
                    return Err(Error::DownloadFailed(msg));
                }
                Err(AttemptError::Transient(msg)) => {
                    if attempt_no > DOWNLOAD_RETRIES {
                        return Err(Error::DownloadFailed(msg));
                    }
                    warn!(attempt = attempt_no, error = %msg, "transient download failure; retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    async fn attempt(
        &self,
        variant: &RemoteVariant,
        tmp_path: &Path,
        final_path: &Path,
        progress: Option<&mpsc::Sender<DownloadProgress>>,
        cancel: &mut watch::Receiver<bool>,
    ) -> std::result::Result<(), AttemptError> {
        let resp = self
            .http
            .get(&variant.url)
            .send()
            .await
            .map_err(|e| AttemptError::Transient(format!("request failed: {e}")))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AttemptError::Permanent(format!(
                "'{}' does not exist on the registry",
                variant.url
            )));
        }
        if status.is_client_error() {
            return Err(AttemptError::Permanent(format!(
                "HTTP {status} for {}",
                variant.url
            )));
        }
        if !status.is_success() {
            return Err(AttemptError::Transient(format!(
                "HTTP {status} for {}",
                variant.url
            )));
        }
        materialize(
            Box::pin(resp.bytes_stream()),
            tmp_path,
            final_path,
            variant.size,
            progress,
            cancel,
        )
        .await
    }

    fn claim(&self, path: PathBuf) -> Result<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().unwrap();
        if !set.insert(path.clone()) {
            return Err(Error::DownloadFailed(format!(
                "another download is already writing to {}",
                path.display()
            )));
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            path,
        })
    }
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.path);
    }
}

/// Resolves once the cancel signal turns true; pends forever otherwise.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: cancellation can no longer arrive.
            std::future::pending::<()>().await;
        }
    }
}

/// Stream a body into `tmp_path` and atomically rename it to `final_path`
/// once the received size matches `expected_size`. Any other outcome
/// removes the temporary file and leaves the final path untouched.
async fn materialize<S, B, E>(
    mut stream: S,
    tmp_path: &Path,
    final_path: &Path,
    expected_size: u64,
    progress: Option<&mpsc::Sender<DownloadProgress>>,
    cancel: &mut watch::Receiver<bool>,
) -> std::result::Result<(), AttemptError>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut file = tokio::fs::File::create(tmp_path)
        .await
        .map_err(|e| AttemptError::Permanent(format!("cannot create temporary file: {e}")))?;
    let mut downloaded: u64 = 0;

    loop {
        tokio::select! {
            _ = cancelled(cancel) => {
                drop(file);
                remove_tmp(tmp_path).await;
                return Err(AttemptError::Cancelled);
            }
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    let bytes = bytes.as_ref();
                    if let Err(e) = file.write_all(bytes).await {
                        drop(file);
                        remove_tmp(tmp_path).await;
                        return Err(AttemptError::Permanent(format!("write failed: {e}")));
                    }
                    downloaded += bytes.len() as u64;
                    if let Some(tx) = progress {
                        let percent = if expected_size > 0 {
                            (downloaded as f32 / expected_size as f32) * 100.0
                        } else {
                            0.0
                        };
                        let _ = tx.try_send(DownloadProgress {
                            downloaded_bytes: downloaded,
                            total_bytes: expected_size,
                            percent,
                        });
                    }
                }
                Some(Err(e)) => {
                    drop(file);
                    remove_tmp(tmp_path).await;
                    return Err(AttemptError::Transient(format!("stream error: {e}")));
                }
                None => break,
            }
        }
    }

    if let Err(e) = file.flush().await {
        drop(file);
        remove_tmp(tmp_path).await;
        return Err(AttemptError::Permanent(format!("flush failed: {e}")));
    }
    drop(file);

    if downloaded != expected_size {
        remove_tmp(tmp_path).await;
        return Err(AttemptError::Transient(format!(
            "received {downloaded} bytes but the registry advertised {expected_size}"
        )));
    }

    tokio::fs::rename(tmp_path, final_path)
        .await
        .map_err(|e| AttemptError::Permanent(format!("rename into place failed: {e}")))
}

async fn remove_tmp(tmp_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(tmp_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %tmp_path.display(), error = %e, "failed to remove temporary file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Chunk = std::result::Result<Vec<u8>, std::io::Error>;

    fn chunks(parts: &[&[u8]]) -> Vec<Chunk> {
        parts.iter().map(|p| Ok(p.to_vec())).collect()
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test body.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn full_transfer_is_renamed_into_place() {
        let tmp = tempfile::tempdir().unwrap();
        let tmp_path = tmp.path().join("model.gguf.tmp");
        let final_path = tmp.path().join("model.gguf");
        let stream = futures::stream::iter(chunks(&[b"hello ", b"world"]));

        let mut cancel = no_cancel();
        materialize(stream, &tmp_path, &final_path, 11, None, &mut cancel)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&final_path).unwrap(), b"hello world");
        assert!(!tmp_path.exists());
    }

    #[tokio::test]
    async fn truncated_transfer_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let tmp_path = tmp.path().join("model.gguf.tmp");
        let final_path = tmp.path().join("model.gguf");
        let stream = futures::stream::iter(chunks(&[b"only half"]));

        let mut cancel = no_cancel();
        let outcome = materialize(stream, &tmp_path, &final_path, 1024, None, &mut cancel).await;
        assert!(matches!(outcome, Err(AttemptError::Transient(_))));
        assert!(!final_path.exists());
        assert!(!tmp_path.exists());
    }

    #[tokio::test]
    async fn cancellation_removes_the_temporary_file() {
        let tmp = tempfile::tempdir().unwrap();
        let tmp_path = tmp.path().join("model.gguf.tmp");
        let final_path = tmp.path().join("model.gguf");
        // A stream that never ends on its own.
        let stream = futures::stream::iter(chunks(&[b"x"])).chain(futures::stream::pending());

        let (cancel_tx, mut cancel) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        let outcome = materialize(stream, &tmp_path, &final_path, 1024, None, &mut cancel).await;
        assert!(matches!(outcome, Err(AttemptError::Cancelled)));
        assert!(!final_path.exists());
        assert!(!tmp_path.exists());
    }

    #[tokio::test]
    async fn progress_reports_received_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let tmp_path = tmp.path().join("m.tmp");
        let final_path = tmp.path().join("m");
        let stream = futures::stream::iter(chunks(&[b"1234", b"5678"]));

        let (progress_tx, mut progress_rx) = mpsc::channel(16);
        let mut cancel = no_cancel();
        materialize(stream, &tmp_path, &final_path, 8, Some(&progress_tx), &mut cancel)
            .await
            .unwrap();

        let mut last = None;
        while let Ok(update) = progress_rx.try_recv() {
            last = Some(update);
        }
        let last = last.unwrap();
        assert_eq!(last.downloaded_bytes, 8);
        assert_eq!(last.total_bytes, 8);
        assert!((last.percent - 100.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn same_destination_is_mutually_exclusive() {
        let fetcher = Fetcher::new().unwrap();
        let path = PathBuf::from("/tmp/myard-test/model.gguf");
        let first = fetcher.claim(path.clone()).unwrap();
        assert!(fetcher.claim(path.clone()).is_err());
        drop(first);
        assert!(fetcher.claim(path).is_ok());
    }

    #[test]
    fn lookup_cache_round_trips_and_expires() {
        let tmp = tempfile::tempdir().unwrap();
        let model = RegistryModel {
            id: "TheBloke/Mistral-7B-GGUF".to_string(),
        };
        write_cached_lookup(tmp.path(), "default__mistral-7b", &model, 1_000_000);

        let hit = read_cached_lookup(tmp.path(), "default__mistral-7b", 1_000_100).unwrap();
        assert_eq!(hit.id, model.id);

        // Past the expiry window the entry is dropped and removed.
        let miss = read_cached_lookup(
            tmp.path(),
            "default__mistral-7b",
            1_000_000 + LOOKUP_CACHE_EXPIRY_SECS + 1,
        );
        assert!(miss.is_none());
        assert!(!tmp.path().join("default__mistral-7b.json").exists());
    }
}
