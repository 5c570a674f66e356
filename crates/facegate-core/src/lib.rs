//! facegate-core: face localization and embedding engine.
//!
//! Uses the res10 SSD network for face localization and ArcFace for
//! identity embeddings, both running via ONNX Runtime for CPU inference.

pub mod config;
pub mod detector;
pub mod recognizer;
pub mod resource;
pub mod types;

pub use config::PipelineConfig;
pub use detector::{DetectorError, FaceDetector, FaceLocator, FaceRegion, SsdDetector};
pub use recognizer::{ArcFaceLoader, EmbeddingExtractor, EmbeddingModel, RecognizerError};
pub use resource::{
    HttpFetcher, InferenceResource, ModelArtifact, ModelFetcher, ModelLoader, ResourceError,
    ResourceState,
};
pub use types::{BoundingBox, CosineMatcher, MatchResult, Matcher, UnitVector};

/// Default model directory: `$XDG_DATA_HOME/facegate/models`, falling back
/// to `~/.local/share/facegate/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    data_dir().join("models")
}

/// Base data directory shared by the daemon's database and model files.
pub fn data_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}
