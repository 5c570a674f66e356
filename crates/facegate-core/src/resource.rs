//! Process-wide embedding model slot with fetch-on-first-use.
//!
//! The model is expensive to build, so [`InferenceResource::get_or_init`]
//! guarantees at most one fetch+load in flight; every other caller either
//! sees the ready model or blocks on the same initialization lock.

use crate::recognizer::EmbeddingModel;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Bodies smaller than this cannot be an ONNX model.
const MIN_ARTIFACT_BYTES: usize = 1024;
const FETCH_TIMEOUT_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("failed to fetch model from {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("model artifact is suspiciously small ({0} bytes)")]
    Truncated(usize),
    #[error("model checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("model load failed: {0}")]
    Load(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle of the inference resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Absent,
    Loading,
    Ready,
    /// The last attempt failed; the next caller retries from scratch.
    Failed,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Absent => "absent",
            ResourceState::Loading => "loading",
            ResourceState::Ready => "ready",
            ResourceState::Failed => "failed",
        }
    }
}

/// Where the model file lives locally and where to get it from.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub url: String,
    pub path: PathBuf,
}

/// Downloads a model artifact to a local path.
pub trait ModelFetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), ResourceError>;
}

/// Builds an inference session from a model file on disk.
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn EmbeddingModel>, ResourceError>;
}

/// HTTP(S) fetcher with optional SHA-256 pinning.
///
/// The blocking client is built per fetch, on the calling thread; it must
/// never be created or dropped inside an async runtime.
pub struct HttpFetcher {
    expected_sha256: Option<String>,
}

impl HttpFetcher {
    pub fn new(expected_sha256: Option<String>) -> Self {
        Self { expected_sha256 }
    }
}

impl ModelFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), ResourceError> {
        let fetch_err = |message: String| ResourceError::Fetch {
            url: url.to_string(),
            message,
        };

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .map_err(|e| fetch_err(format!("http client: {e}")))?;
        let response = client.get(url).send().map_err(|e| fetch_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_err(format!("HTTP {}", response.status())));
        }
        let bytes = response.bytes().map_err(|e| fetch_err(e.to_string()))?;
        check_artifact(&bytes, self.expected_sha256.as_deref())?;

        write_atomically(dest, &bytes)?;
        tracing::info!(url, path = %dest.display(), bytes = bytes.len(), "model artifact downloaded");
        Ok(())
    }
}

/// Reject bodies that cannot be a model and, when pinned, bodies whose
/// SHA-256 differs. The pin is compared case-insensitively, ignoring
/// surrounding whitespace.
fn check_artifact(bytes: &[u8], expected_sha256: Option<&str>) -> Result<(), ResourceError> {
    if bytes.len() < MIN_ARTIFACT_BYTES {
        return Err(ResourceError::Truncated(bytes.len()));
    }

    if let Some(expected) = expected_sha256 {
        let expected = expected.trim().to_ascii_lowercase();
        let actual = format!("{:x}", Sha256::digest(bytes));
        if actual != expected {
            return Err(ResourceError::Integrity { expected, actual });
        }
    }
    Ok(())
}

/// Write to a temp file beside `dest`, then persist it over `dest`, so a
/// partial download never appears there. The temp file is removed on drop
/// if anything fails first.
fn write_atomically(dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    {
        let file = tmp.as_file_mut();
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    tmp.persist(dest).map_err(|err| err.error)?;
    Ok(())
}

enum Slot {
    Absent,
    Loading,
    Ready(Arc<dyn EmbeddingModel>),
    Failed,
}

/// Lazily-initialized, shared embedding model.
///
/// Construct one per process and share it behind an `Arc`; callers only ever
/// see the model through [`get_or_init`](Self::get_or_init).
pub struct InferenceResource {
    artifact: ModelArtifact,
    fetcher: Box<dyn ModelFetcher>,
    loader: Box<dyn ModelLoader>,
    slot: RwLock<Slot>,
    init: Mutex<()>,
}

impl InferenceResource {
    pub fn new(
        artifact: ModelArtifact,
        fetcher: Box<dyn ModelFetcher>,
        loader: Box<dyn ModelLoader>,
    ) -> Self {
        Self {
            artifact,
            fetcher,
            loader,
            slot: RwLock::new(Slot::Absent),
            init: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ResourceState {
        match &*self.slot.read().unwrap_or_else(PoisonError::into_inner) {
            Slot::Absent => ResourceState::Absent,
            Slot::Loading => ResourceState::Loading,
            Slot::Ready(_) => ResourceState::Ready,
            Slot::Failed => ResourceState::Failed,
        }
    }

    /// Return the ready model, fetching and loading it on first use.
    ///
    /// Double-checked: the ready slot is read without the init lock; only
    /// callers that miss take the lock, and they re-check before loading.
    /// A failed attempt leaves the slot retryable.
    pub fn get_or_init(&self) -> Result<Arc<dyn EmbeddingModel>, ResourceError> {
        if let Some(model) = self.ready() {
            return Ok(model);
        }

        // The guarded value is (), so a poisoned lock carries no broken state.
        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(model) = self.ready() {
            return Ok(model);
        }

        self.set_slot(Slot::Loading);
        match self.fetch_and_load() {
            Ok(model) => {
                self.set_slot(Slot::Ready(Arc::clone(&model)));
                tracing::info!(path = %self.artifact.path.display(), "inference resource ready");
                Ok(model)
            }
            Err(err) => {
                self.set_slot(Slot::Failed);
                tracing::error!(error = %err, "inference resource initialization failed");
                Err(err)
            }
        }
    }

    fn ready(&self) -> Option<Arc<dyn EmbeddingModel>> {
        match &*self.slot.read().unwrap_or_else(PoisonError::into_inner) {
            Slot::Ready(model) => Some(Arc::clone(model)),
            _ => None,
        }
    }

    fn set_slot(&self, slot: Slot) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = slot;
    }

    fn fetch_and_load(&self) -> Result<Arc<dyn EmbeddingModel>, ResourceError> {
        let ModelArtifact { url, path } = &self.artifact;
        if !path.exists() {
            tracing::info!(url = %url, path = %path.display(), "model artifact missing; downloading");
            self.fetcher.fetch(url, path)?;
        }
        self.loader.load(path)
    }
}
