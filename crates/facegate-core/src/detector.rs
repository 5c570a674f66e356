//! Face localization: res10 SSD detector via ONNX Runtime, plus the
//! [`FaceLocator`] that reduces raw detections to a single face crop.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{RgbImage, SubImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

// --- Named constants (res10_300x300_ssd_iter_140000) ---
const SSD_INPUT_SIZE: u32 = 300;
/// Per-channel mean in B, G, R order; the network was trained on BGR input.
const SSD_MEAN_BGR: [f32; 3] = [104.0, 177.0, 123.0];
/// Each output row: [image_id, label, confidence, x1, y1, x2, y2].
const SSD_ROW_WIDTH: usize = 7;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; place the res10 SSD ONNX export in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that turns an image into a set of scored face boxes.
pub trait FaceDetector: Send + Sync {
    /// Return every detection in source-image pixel coordinates, in no
    /// particular order.
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// OpenCV res10 SSD face detector exported to ONNX.
pub struct SsdDetector {
    session: Mutex<Session>,
}

impl SsdDetector {
    /// Load the SSD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded SSD face detector"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Resize to 300x300 and build a mean-subtracted BGR NCHW tensor.
    fn preprocess(image: &RgbImage) -> Array4<f32> {
        let size = SSD_INPUT_SIZE as usize;
        let resized = imageops::resize(image, SSD_INPUT_SIZE, SSD_INPUT_SIZE, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in resized.enumerate_pixels() {
            let [r, g, b] = pixel.0;
            let (x, y) = (x as usize, y as usize);
            tensor[[0, 0, y, x]] = b as f32 - SSD_MEAN_BGR[0];
            tensor[[0, 1, y, x]] = g as f32 - SSD_MEAN_BGR[1];
            tensor[[0, 2, y, x]] = r as f32 - SSD_MEAN_BGR[2];
        }

        tensor
    }
}

impl FaceDetector for SsdDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let input = Self::preprocess(image);

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detections: {e}")))?;

        let detections = decode_detections(raw, image.width(), image.height());
        tracing::debug!(count = detections.len(), "SSD detections decoded");
        Ok(detections)
    }
}

/// Decode the flattened `[1, 1, N, 7]` SSD output into pixel-space boxes.
///
/// Rows with a non-finite or non-positive confidence are dropped; a trailing
/// partial row is ignored.
fn decode_detections(raw: &[f32], width: u32, height: u32) -> Vec<BoundingBox> {
    let (w, h) = (width as f32, height as f32);

    raw.chunks_exact(SSD_ROW_WIDTH)
        .filter(|row| row[2].is_finite() && row[2] > 0.0)
        .map(|row| {
            let x1 = row[3] * w;
            let y1 = row[4] * h;
            let x2 = row[5] * w;
            let y2 = row[6] * h;
            BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: row[2],
            }
        })
        .collect()
}

/// A face crop borrowed from the probe or sample image.
///
/// Valid only for as long as the source image; never persisted.
pub struct FaceRegion<'a> {
    pub view: SubImage<&'a RgbImage>,
    /// The detection the crop came from, clamped to the image bounds.
    pub bbox: BoundingBox,
}

impl FaceRegion<'_> {
    pub fn confidence(&self) -> f32 {
        self.bbox.confidence
    }
}

/// Picks the single most confident face above a fixed confidence floor.
pub struct FaceLocator {
    detector: Box<dyn FaceDetector>,
    confidence_floor: f32,
}

impl FaceLocator {
    pub fn new(detector: Box<dyn FaceDetector>, confidence_floor: f32) -> Self {
        Self {
            detector,
            confidence_floor,
        }
    }

    /// Locate the best face in `image`.
    ///
    /// Returns `Ok(None)` when nothing clears the confidence floor or when the
    /// best box collapses to zero area after clamping to the image.
    pub fn locate<'a>(&self, image: &'a RgbImage) -> Result<Option<FaceRegion<'a>>, DetectorError> {
        let detections = self.detector.detect(image)?;

        let Some(best) = select_best(&detections, self.confidence_floor) else {
            tracing::debug!(
                detections = detections.len(),
                floor = self.confidence_floor,
                "no detection above confidence floor"
            );
            return Ok(None);
        };

        let Some((x, y, w, h)) = clamp_to_image(best, image.width(), image.height()) else {
            tracing::debug!(?best, "best detection is degenerate after clamping");
            return Ok(None);
        };

        Ok(Some(FaceRegion {
            view: imageops::crop_imm(image, x, y, w, h),
            bbox: BoundingBox {
                x: x as f32,
                y: y as f32,
                width: w as f32,
                height: h as f32,
                confidence: best.confidence,
            },
        }))
    }
}

/// Highest-confidence detection with `confidence >= floor`.
fn select_best(detections: &[BoundingBox], floor: f32) -> Option<&BoundingBox> {
    detections
        .iter()
        .filter(|d| d.confidence >= floor)
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// Truncate a box to integer pixels inside `width x height`.
///
/// Returns `(x, y, w, h)`, or `None` for an empty crop.
fn clamp_to_image(bbox: &BoundingBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let clamp = |v: f32, max: u32| -> u32 {
        if v.is_nan() {
            0
        } else {
            (v.max(0.0) as u32).min(max)
        }
    };

    let x1 = clamp(bbox.x, width);
    let y1 = clamp(bbox.y, height);
    let x2 = clamp(bbox.x + bbox.width, width);
    let y2 = clamp(bbox.y + bbox.height, height);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1, y1, x2 - x1, y2 - y1))
}
