//! ArcFace embedding extraction via ONNX Runtime.
//!
//! Turns a face crop into a 512-dimensional unit vector. The session itself
//! lives in the shared [`InferenceResource`] and is built on first use.

use crate::detector::FaceRegion;
use crate::resource::{InferenceResource, ModelLoader, ResourceError};
use crate::types::UnitVector;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

// --- Named constants (different from the SSD detector!) ---
const ARCFACE_INPUT_SIZE: u32 = 112;
/// Pixels are scaled to [0, 1]; no mean subtraction.
const ARCFACE_PIXEL_SCALE: f32 = 255.0;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

/// Pinned ArcFace export fetched when the model file is absent.
pub const ARCFACE_MODEL_URL: &str = "https://huggingface.co/FoivosPar/Arc2Face/resolve/da2f1e9aa3954dad093213acfc9ae75a68da6ffd/arcface.onnx";
pub const ARCFACE_MODEL_FILE: &str = "arcface.onnx";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model produced a zero-norm embedding")]
    DegenerateEmbedding,
    #[error("inference resource unavailable: {0}")]
    Resource(#[from] ResourceError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A loaded embedding network. Implementations must be safe to call from
/// several request threads at once.
pub trait EmbeddingModel: Send + Sync {
    /// Run one forward pass over an NHWC `[1, 112, 112, 3]` tensor and
    /// return the raw (unnormalized) output vector.
    fn infer(&self, input: Array4<f32>) -> Result<Vec<f32>, RecognizerError>;
}

/// ArcFace ONNX session. `Session::run` needs exclusive access, so calls
/// serialize through a mutex.
pub struct ArcFaceModel {
    session: Mutex<Session>,
}

impl ArcFaceModel {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl EmbeddingModel for ArcFaceModel {
    fn infer(&self, input: Array4<f32>) -> Result<Vec<f32>, RecognizerError> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(raw.to_vec())
    }
}

/// [`ModelLoader`] that builds an [`ArcFaceModel`] session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArcFaceLoader;

impl ModelLoader for ArcFaceLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn EmbeddingModel>, ResourceError> {
        let model = ArcFaceModel::load(path).map_err(|e| ResourceError::Load(e.to_string()))?;
        Ok(Arc::new(model))
    }
}

/// Face crop → unit vector, backed by the shared inference resource.
#[derive(Clone)]
pub struct EmbeddingExtractor {
    resource: Arc<InferenceResource>,
}

impl EmbeddingExtractor {
    pub fn new(resource: Arc<InferenceResource>) -> Self {
        Self { resource }
    }

    pub fn resource(&self) -> &InferenceResource {
        &self.resource
    }

    /// Extract the unit-norm embedding for a located face.
    pub fn embed(&self, face: &FaceRegion<'_>) -> Result<UnitVector, RecognizerError> {
        let input = preprocess(&face.view.to_image());
        let model = self.resource.get_or_init()?;
        let raw = model.infer(input)?;
        UnitVector::normalize(raw).ok_or(RecognizerError::DegenerateEmbedding)
    }
}

/// Resize a face crop to 112x112 and lay it out as an NHWC RGB tensor with
/// every channel scaled to [0, 1].
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let resized = imageops::resize(face, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, size, size, 3));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for (c, &value) in pixel.0.iter().enumerate() {
            tensor[[0, y, x, c]] = value as f32 / ARCFACE_PIXEL_SCALE;
        }
    }

    tensor
}
