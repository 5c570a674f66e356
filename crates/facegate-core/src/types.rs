use serde::{Deserialize, Serialize};

/// Bounding box for a detected face in pixel coordinates of the source image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// L2-normalized embedding vector (512-dimensional for ArcFace).
///
/// The only way to build one from raw model output is [`UnitVector::normalize`],
/// so every instance produced in-process has unit length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitVector {
    values: Vec<f32>,
}

impl UnitVector {
    /// Divide `raw` by its own L2 norm.
    ///
    /// Returns `None` when the norm is zero or not finite.
    pub fn normalize(raw: Vec<f32>) -> Option<Self> {
        let norm = l2_norm(&raw);
        if !norm.is_finite() || norm <= 0.0 {
            return None;
        }
        Some(Self {
            values: raw.into_iter().map(|v| v / norm).collect(),
        })
    }

    /// Wrap values that were normalized when they were first produced
    /// (e.g. read back from persistent storage).
    pub fn from_normalized(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    /// Cosine similarity in [-1, 1]. Both operands are unit length, so this is
    /// the plain dot product.
    ///
    /// Vectors of different dimensionality (produced by different models)
    /// compare as 0.0.
    pub fn similarity(&self, other: &UnitVector) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Serialize as packed little-endian f32 values.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Parse packed little-endian f32 values. Returns `None` if the length is
    /// not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Result of matching a probe against one identity's enrollment vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Best cosine similarity observed [-1, 1]; 0.0 for an empty gallery.
    pub similarity: f32,
    /// Index of the best-scoring gallery entry (if any).
    pub best_index: Option<usize>,
}

/// Strategy for comparing a probe embedding against a gallery of enrolled vectors.
pub trait Matcher {
    fn compare(&self, probe: &UnitVector, gallery: &[UnitVector], threshold: f32) -> MatchResult;
}

/// Best-of cosine matcher with constant-time gallery traversal.
///
/// Always iterates ALL gallery entries so timing does not leak the position
/// of the matching sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &UnitVector, gallery: &[UnitVector], threshold: f32) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        // No early exit: every entry is scored.
        for (i, stored) in gallery.iter().enumerate() {
            let sim = probe.similarity(stored);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(_) => MatchResult {
                matched: best_sim >= threshold,
                similarity: best_sim,
                best_index: best_idx,
            },
            None => MatchResult {
                matched: false,
                similarity: 0.0,
                best_index: None,
            },
        }
    }
}
