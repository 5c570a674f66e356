//! Decision constants for the enrollment and verification pipeline.

/// Detections below this confidence are treated as no detection at all.
pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.9;
/// Minimum best-of cosine similarity for a positive face match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.75;
/// Maximum number of enrollment vectors held per identity.
pub const DEFAULT_MAX_SAMPLES: usize = 5;

/// Tunable pipeline constants, injected into the localizer and the
/// authenticator rather than hard-coded at the call sites.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub confidence_floor: f32,
    pub similarity_threshold: f32,
    pub max_samples: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}
