use facegate_core::config::{
    DEFAULT_CONFIDENCE_FLOOR, DEFAULT_MAX_SAMPLES, DEFAULT_SIMILARITY_THRESHOLD,
};
use facegate_core::recognizer::{ARCFACE_MODEL_FILE, ARCFACE_MODEL_URL};
use facegate_core::{ModelArtifact, PipelineConfig};
use std::path::PathBuf;

const DETECTOR_MODEL_FILE: &str = "res10_300x300_ssd_iter_140000.onnx";

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Detections below this confidence are ignored.
    pub confidence_floor: f32,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Maximum enrollment samples per identity.
    pub max_samples: usize,
    /// Where to download the embedding model from when it is missing.
    pub embedder_url: String,
    /// Optional SHA-256 pin for the downloaded embedding model.
    pub embedder_sha256: Option<String>,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEGATE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facegate_core::default_model_dir());

        let db_path = std::env::var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facegate_core::data_dir().join("users.db"));

        Self {
            model_dir,
            db_path,
            confidence_floor: unit_f32(
                "FACEGATE_CONFIDENCE_FLOOR",
                env("FACEGATE_CONFIDENCE_FLOOR").as_deref(),
                DEFAULT_CONFIDENCE_FLOOR,
            ),
            similarity_threshold: unit_f32(
                "FACEGATE_SIMILARITY_THRESHOLD",
                env("FACEGATE_SIMILARITY_THRESHOLD").as_deref(),
                DEFAULT_SIMILARITY_THRESHOLD,
            ),
            max_samples: positive_usize(
                "FACEGATE_MAX_SAMPLES",
                env("FACEGATE_MAX_SAMPLES").as_deref(),
                DEFAULT_MAX_SAMPLES,
            ),
            embedder_url: std::env::var("FACEGATE_EMBEDDER_URL")
                .unwrap_or_else(|_| ARCFACE_MODEL_URL.to_string()),
            embedder_sha256: std::env::var("FACEGATE_EMBEDDER_SHA256")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            system_bus: std::env::var("FACEGATE_SYSTEM_BUS")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            confidence_floor: self.confidence_floor,
            similarity_threshold: self.similarity_threshold,
            max_samples: self.max_samples,
        }
    }

    /// Path to the SSD face detector model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(DETECTOR_MODEL_FILE)
    }

    /// Local path and download URL of the ArcFace embedding model.
    pub fn embedder_artifact(&self) -> ModelArtifact {
        ModelArtifact {
            url: self.embedder_url.clone(),
            path: self.model_dir.join(ARCFACE_MODEL_FILE),
        }
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// A score in `[0, 1]`; anything else falls back to `default`.
fn unit_f32(key: &str, raw: Option<&str>, default: f32) -> f32 {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<f32>() {
        Ok(value) if value.is_finite() && (0.0..=1.0).contains(&value) => value,
        _ => {
            tracing::warn!(key, value = raw, default, "ignoring invalid setting, expected 0..=1");
            default
        }
    }
}

/// A count of at least one; anything else falls back to `default`.
fn positive_usize(key: &str, raw: Option<&str>, default: usize) -> usize {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => value,
        _ => {
            tracing::warn!(key, value = raw, default, "ignoring invalid setting, expected >= 1");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "FACEGATE_TEST";

    #[test]
    fn unset_values_use_defaults() {
        assert_eq!(unit_f32(KEY, None, 0.75), 0.75);
        assert_eq!(positive_usize(KEY, None, 5), 5);
    }

    #[test]
    fn valid_scores_are_accepted() {
        assert_eq!(unit_f32(KEY, Some("0.6"), 0.75), 0.6);
        assert_eq!(unit_f32(KEY, Some(" 1 "), 0.75), 1.0);
        assert_eq!(unit_f32(KEY, Some("0"), 0.75), 0.0);
    }

    #[test]
    fn invalid_scores_fall_back() {
        for raw in ["NaN", "inf", "-0.1", "1.5", "high", ""] {
            assert_eq!(unit_f32(KEY, Some(raw), 0.9), 0.9, "{raw:?}");
        }
    }

    #[test]
    fn zero_max_samples_falls_back() {
        assert_eq!(positive_usize(KEY, Some("0"), 5), 5);
        assert_eq!(positive_usize(KEY, Some("-3"), 5), 5);
        assert_eq!(positive_usize(KEY, Some("3"), 5), 3);
    }
}
