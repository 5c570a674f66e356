//! Enrollment workflow, face verification and password check.
//!
//! Every entry point is synchronous and may block on model inference or
//! SQLite; async callers run them on `spawn_blocking`.

use crate::identity::{Credential, IdentityKey};
use crate::store::{IdentityStore, StoreError};
use facegate_core::{
    CosineMatcher, DetectorError, EmbeddingExtractor, FaceLocator, Matcher, PipelineConfig,
    RecognizerError, ResourceError, ResourceState,
};
use image::RgbImage;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("image decode failed: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("inference resource unavailable: {0}")]
    ResourceInit(ResourceError),
    #[error("embedding extraction failed: {0}")]
    Extraction(RecognizerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<RecognizerError> for AuthError {
    fn from(err: RecognizerError) -> Self {
        match err {
            RecognizerError::Resource(e) => AuthError::ResourceInit(e),
            other => AuthError::Extraction(other),
        }
    }
}

impl AuthError {
    /// Short caller-facing reason. Never includes paths or model details.
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthError::InvalidInput(_) => "Missing data",
            AuthError::ImageDecode(_) => "Invalid image",
            AuthError::ResourceInit(_) => "Face recognition temporarily unavailable",
            AuthError::Detector(_) | AuthError::Extraction(_) | AuthError::Store(_) => {
                "Internal server error"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AlreadyEnrolled,
    NoFaceDetected,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::AlreadyEnrolled => "already fully enrolled",
            RejectReason::NoFaceDetected => "no face detected",
        })
    }
}

/// Result of one enrollment sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    /// Sample stored; the identity now holds this many vectors.
    Saved(usize),
    /// Sample stored and the identity reached the sample cap.
    Completed,
    Rejected(RejectReason),
}

/// Result of a face verification attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaceVerdict {
    Matched { similarity: f32 },
    NotMatched { similarity: f32 },
    NoFaceDetected,
    UserNotRegistered,
}

/// Result of a password check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordVerdict {
    Accepted,
    Rejected,
    UserNotFound,
}

/// One mutex per identity currently enrolling, so check-count/append runs
/// atomically per identity while different identities proceed in parallel.
#[derive(Default)]
struct IdentityLocks {
    inner: Mutex<HashMap<IdentityKey, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    fn acquire(&self, identity: &IdentityKey) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // Entries only the map still references are idle.
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(map.entry(identity.clone()).or_default())
    }
}

/// The enrollment and verification pipeline over a shared identity store.
pub struct Authenticator {
    locator: FaceLocator,
    extractor: EmbeddingExtractor,
    store: Arc<dyn IdentityStore>,
    matcher: CosineMatcher,
    config: PipelineConfig,
    enroll_locks: IdentityLocks,
}

impl Authenticator {
    pub fn new(
        locator: FaceLocator,
        extractor: EmbeddingExtractor,
        store: Arc<dyn IdentityStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            locator,
            extractor,
            store,
            matcher: CosineMatcher,
            config,
            enroll_locks: IdentityLocks::default(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn embedder_state(&self) -> ResourceState {
        self.extractor.resource().state()
    }

    /// Store one face sample for `email`, registering the identity (with
    /// `password`) on its first sample.
    ///
    /// The cap is checked before the image is decoded. A sample with no
    /// detectable face is rejected, but the identity row created for it stays.
    pub fn enroll(
        &self,
        email: &str,
        password: &str,
        sample: &[u8],
    ) -> Result<EnrollOutcome, AuthError> {
        let identity =
            IdentityKey::parse(email).ok_or(AuthError::InvalidInput("identity is required"))?;
        let credential =
            Credential::new(password).ok_or(AuthError::InvalidInput("password is required"))?;
        if sample.is_empty() {
            return Err(AuthError::InvalidInput("sample image is required"));
        }

        let lock = self.enroll_locks.acquire(&identity);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let max = self.config.max_samples;
        let count = self.store.count_vectors(&identity)?;
        if count >= max {
            tracing::info!(identity = %identity, count, "enroll: already fully enrolled");
            return Ok(EnrollOutcome::Rejected(RejectReason::AlreadyEnrolled));
        }

        let image = decode_image(sample)?;
        self.store.create_identity_if_absent(&identity, &credential)?;

        let Some(face) = self.locator.locate(&image)? else {
            tracing::info!(identity = %identity, "enroll: no face detected");
            return Ok(EnrollOutcome::Rejected(RejectReason::NoFaceDetected));
        };
        tracing::debug!(confidence = face.confidence(), "enroll: face located");

        let vector = self.extractor.embed(&face)?;
        self.store.append_vector(&identity, &vector)?;

        let count = self.store.count_vectors(&identity)?;
        tracing::info!(identity = %identity, count, max, "enroll: sample saved");
        if count >= max {
            Ok(EnrollOutcome::Completed)
        } else {
            Ok(EnrollOutcome::Saved(count))
        }
    }

    /// Compare a probe image against every vector enrolled for `email`.
    ///
    /// An unknown identity is reported before the probe is even decoded.
    pub fn verify_face(&self, email: &str, probe: &[u8]) -> Result<FaceVerdict, AuthError> {
        let identity =
            IdentityKey::parse(email).ok_or(AuthError::InvalidInput("identity is required"))?;

        let gallery = self.store.list_vectors(&identity)?;
        if gallery.is_empty() {
            tracing::info!(identity = %identity, "verify: user not registered");
            return Ok(FaceVerdict::UserNotRegistered);
        }

        if probe.is_empty() {
            return Err(AuthError::InvalidInput("probe image is required"));
        }
        let image = decode_image(probe)?;

        let Some(face) = self.locator.locate(&image)? else {
            tracing::info!(identity = %identity, "verify: no face detected");
            return Ok(FaceVerdict::NoFaceDetected);
        };

        let probe_vector = self.extractor.embed(&face)?;
        let result = self
            .matcher
            .compare(&probe_vector, &gallery, self.config.similarity_threshold);

        tracing::debug!(
            identity = %identity,
            similarity = result.similarity,
            samples = gallery.len(),
            best = ?result.best_index,
            "verify: best similarity"
        );
        tracing::info!(identity = %identity, matched = result.matched, "verify: complete");

        if result.matched {
            Ok(FaceVerdict::Matched {
                similarity: result.similarity,
            })
        } else {
            Ok(FaceVerdict::NotMatched {
                similarity: result.similarity,
            })
        }
    }

    /// Compare `password` with the stored credential for `email`.
    pub fn verify_password(&self, email: &str, password: &str) -> Result<PasswordVerdict, AuthError> {
        let identity =
            IdentityKey::parse(email).ok_or(AuthError::InvalidInput("identity is required"))?;
        if password.is_empty() {
            return Err(AuthError::InvalidInput("password is required"));
        }

        let verdict = match self.store.get_credential(&identity)? {
            None => PasswordVerdict::UserNotFound,
            Some(stored) if stored.matches(password) => PasswordVerdict::Accepted,
            Some(_) => PasswordVerdict::Rejected,
        };
        tracing::info!(identity = %identity, ?verdict, "password check");
        Ok(verdict)
    }
}

fn decode_image(bytes: &[u8]) -> Result<RgbImage, AuthError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteIdentityStore;
    use facegate_core::{
        BoundingBox, EmbeddingModel, FaceDetector, InferenceResource, ModelArtifact, ModelFetcher,
        ModelLoader, UnitVector,
    };
    use image::{ImageFormat, Rgb};
    use ndarray::Array4;
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Reports the whole image as a face unless its top-left pixel is black.
    struct ColorDetector {
        calls: Arc<AtomicUsize>,
    }

    impl FaceDetector for ColorDetector {
        fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if image.get_pixel(0, 0).0 == [0, 0, 0] {
                return Ok(vec![]);
            }
            Ok(vec![BoundingBox {
                x: 0.0,
                y: 0.0,
                width: image.width() as f32,
                height: image.height() as f32,
                confidence: 0.99,
            }])
        }
    }

    /// Embeds a face as the RGB value of its first pixel.
    struct ColorModel;

    impl EmbeddingModel for ColorModel {
        fn infer(&self, input: Array4<f32>) -> Result<Vec<f32>, RecognizerError> {
            Ok(vec![input[[0, 0, 0, 0]], input[[0, 0, 0, 1]], input[[0, 0, 0, 2]]])
        }
    }

    struct ColorLoader;

    impl ModelLoader for ColorLoader {
        fn load(&self, _path: &Path) -> Result<Arc<dyn EmbeddingModel>, ResourceError> {
            Ok(Arc::new(ColorModel))
        }
    }

    struct SlowFetcher {
        calls: Arc<AtomicUsize>,
    }

    impl ModelFetcher for SlowFetcher {
        fn fetch(&self, _url: &str, dest: &Path) -> Result<(), ResourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            std::fs::write(dest, b"onnx")?;
            Ok(())
        }
    }

    struct Harness {
        _dir: TempDir,
        auth: Arc<Authenticator>,
        store: Arc<SqliteIdentityStore>,
        detections: Arc<AtomicUsize>,
        fetches: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let detections = Arc::new(AtomicUsize::new(0));
        let fetches = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(SqliteIdentityStore::open_in_memory().unwrap());
        let config = PipelineConfig::default();

        let resource = Arc::new(InferenceResource::new(
            ModelArtifact {
                url: "https://models.invalid/arcface.onnx".into(),
                path: dir.path().join("arcface.onnx"),
            },
            Box::new(SlowFetcher {
                calls: Arc::clone(&fetches),
            }),
            Box::new(ColorLoader),
        ));
        let locator = FaceLocator::new(
            Box::new(ColorDetector {
                calls: Arc::clone(&detections),
            }),
            config.confidence_floor,
        );

        let auth = Arc::new(Authenticator::new(
            locator,
            EmbeddingExtractor::new(resource),
            Arc::clone(&store) as Arc<dyn IdentityStore>,
            config,
        ));

        Harness {
            _dir: dir,
            auth,
            store,
            detections,
            fetches,
        }
    }

    fn png(color: [u8; 3]) -> Vec<u8> {
        let image = RgbImage::from_pixel(24, 24, Rgb(color));
        let mut buf = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    const FACES: [[u8; 3]; 6] = [
        [255, 0, 0],
        [0, 255, 0],
        [0, 0, 255],
        [255, 255, 0],
        [0, 255, 255],
        [255, 0, 255],
    ];
    const NO_FACE: [u8; 3] = [0, 0, 0];

    fn key(s: &str) -> IdentityKey {
        IdentityKey::parse(s).unwrap()
    }

    #[test]
    fn five_samples_complete_and_sixth_is_rejected_without_detection() {
        let h = harness();

        for (i, color) in FACES[..4].iter().enumerate() {
            let outcome = h.auth.enroll("a@x.com", "pw", &png(*color)).unwrap();
            assert_eq!(outcome, EnrollOutcome::Saved(i + 1));
        }
        assert_eq!(
            h.auth.enroll("a@x.com", "pw", &png(FACES[4])).unwrap(),
            EnrollOutcome::Completed
        );

        let detections_before = h.detections.load(Ordering::SeqCst);
        let sixth = h.auth.enroll("a@x.com", "pw", &png(FACES[5])).unwrap();
        assert_eq!(sixth, EnrollOutcome::Rejected(RejectReason::AlreadyEnrolled));
        assert_eq!(sixth_reason(sixth), "already fully enrolled");
        assert_eq!(h.detections.load(Ordering::SeqCst), detections_before);
        assert_eq!(h.store.count_vectors(&key("a@x.com")).unwrap(), 5);
    }

    fn sixth_reason(outcome: EnrollOutcome) -> String {
        match outcome {
            EnrollOutcome::Rejected(reason) => reason.to_string(),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn full_enrollment_rejects_even_undecodable_sample() {
        let h = harness();
        for color in &FACES[..5] {
            h.auth.enroll("a@x.com", "pw", &png(*color)).unwrap();
        }
        assert_eq!(
            h.auth.enroll("a@x.com", "pw", b"not an image").unwrap(),
            EnrollOutcome::Rejected(RejectReason::AlreadyEnrolled)
        );
    }

    #[test]
    fn no_face_rejects_without_incrementing_but_keeps_identity() {
        let h = harness();
        let outcome = h.auth.enroll("a@x.com", "pw", &png(NO_FACE)).unwrap();
        assert_eq!(outcome, EnrollOutcome::Rejected(RejectReason::NoFaceDetected));

        let id = key("a@x.com");
        assert_eq!(h.store.count_vectors(&id).unwrap(), 0);
        assert!(h.store.identity_exists(&id).unwrap());
    }

    #[test]
    fn re_enrollment_does_not_change_credential() {
        let h = harness();
        h.auth.enroll("a@x.com", "original", &png(FACES[0])).unwrap();
        h.auth.enroll("A@X.com", "changed", &png(FACES[1])).unwrap();

        assert_eq!(
            h.auth.verify_password("a@x.com", "original").unwrap(),
            PasswordVerdict::Accepted
        );
        assert_eq!(
            h.auth.verify_password("a@x.com", "changed").unwrap(),
            PasswordVerdict::Rejected
        );
        assert_eq!(h.store.count_vectors(&key("a@x.com")).unwrap(), 2);
    }

    #[test]
    fn enrolled_vectors_are_unit_length() {
        let h = harness();
        h.auth.enroll("a@x.com", "pw", &png([200, 100, 50])).unwrap();
        let stored = h.store.list_vectors(&key("a@x.com")).unwrap();
        assert_eq!(stored.len(), 1);
        assert!((stored[0].norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn concurrent_enrollment_never_exceeds_cap() {
        let h = harness();
        let threads = 12;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let auth = Arc::clone(&h.auth);
                let barrier = Arc::clone(&barrier);
                let sample = png(FACES[i % FACES.len()]);
                thread::spawn(move || {
                    barrier.wait();
                    auth.enroll("a@x.com", "pw", &sample).unwrap()
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let completed = outcomes
            .iter()
            .filter(|o| **o == EnrollOutcome::Completed)
            .count();
        let saved = outcomes
            .iter()
            .filter(|o| matches!(o, EnrollOutcome::Saved(_)))
            .count();
        let rejected = outcomes
            .iter()
            .filter(|o| **o == EnrollOutcome::Rejected(RejectReason::AlreadyEnrolled))
            .count();

        assert_eq!(completed, 1);
        assert_eq!(saved, 4);
        assert_eq!(rejected, threads - 5);
        assert_eq!(h.store.count_vectors(&key("a@x.com")).unwrap(), 5);
    }

    #[test]
    fn concurrent_first_use_fetches_model_once() {
        let h = harness();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["a@x.com", "b@x.com"]
            .into_iter()
            .enumerate()
            .map(|(i, email)| {
                let auth = Arc::clone(&h.auth);
                let barrier = Arc::clone(&barrier);
                let sample = png(FACES[i]);
                thread::spawn(move || {
                    barrier.wait();
                    auth.enroll(email, "pw", &sample).unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), EnrollOutcome::Saved(1));
        }
        assert_eq!(h.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(h.auth.embedder_state(), ResourceState::Ready);
    }

    #[test]
    fn best_sample_above_threshold_matches() {
        let h = harness();
        let id = key("a@x.com");
        h.store
            .create_identity_if_absent(&id, &Credential::new("pw").unwrap())
            .unwrap();
        for stored in [[0.6, 0.8, 0.0], [0.8, 0.6, 0.0], [0.6, 0.0, 0.8]] {
            let v = UnitVector::normalize(stored.to_vec()).unwrap();
            h.store.append_vector(&id, &v).unwrap();
        }

        // Probe embeds as [1, 0, 0].
        match h.auth.verify_face("a@x.com", &png([255, 0, 0])).unwrap() {
            FaceVerdict::Matched { similarity } => assert!((similarity - 0.8).abs() < 1e-5),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn best_sample_below_threshold_does_not_match() {
        let h = harness();
        let id = key("a@x.com");
        h.store
            .create_identity_if_absent(&id, &Credential::new("pw").unwrap())
            .unwrap();
        let v = UnitVector::normalize(vec![0.6, 0.8, 0.0]).unwrap();
        h.store.append_vector(&id, &v).unwrap();

        match h.auth.verify_face("a@x.com", &png([255, 0, 0])).unwrap() {
            FaceVerdict::NotMatched { similarity } => assert!((similarity - 0.6).abs() < 1e-5),
            other => panic!("expected no match, got {other:?}"),
        }
    }

    #[test]
    fn enrolled_face_verifies_against_itself() {
        let h = harness();
        h.auth.enroll("a@x.com", "pw", &png(FACES[2])).unwrap();
        assert!(matches!(
            h.auth.verify_face("a@x.com", &png(FACES[2])).unwrap(),
            FaceVerdict::Matched { .. }
        ));
        assert!(matches!(
            h.auth.verify_face("a@x.com", &png(FACES[0])).unwrap(),
            FaceVerdict::NotMatched { .. }
        ));
    }

    #[test]
    fn unknown_identity_is_not_registered_regardless_of_probe() {
        let h = harness();
        for probe in [png(FACES[0]), png(NO_FACE), b"garbage".to_vec(), Vec::new()] {
            assert_eq!(
                h.auth.verify_face("unknown@x.com", &probe).unwrap(),
                FaceVerdict::UserNotRegistered
            );
        }
        assert_eq!(h.detections.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn identity_without_vectors_is_not_registered() {
        let h = harness();
        h.auth.enroll("a@x.com", "pw", &png(NO_FACE)).unwrap();
        assert_eq!(
            h.auth.verify_face("a@x.com", &png(FACES[0])).unwrap(),
            FaceVerdict::UserNotRegistered
        );
    }

    #[test]
    fn verify_without_face_reports_no_face() {
        let h = harness();
        h.auth.enroll("a@x.com", "pw", &png(FACES[0])).unwrap();
        assert_eq!(
            h.auth.verify_face("a@x.com", &png(NO_FACE)).unwrap(),
            FaceVerdict::NoFaceDetected
        );
    }

    #[test]
    fn corrupt_or_empty_probe_is_an_error_not_a_mismatch() {
        let h = harness();
        h.auth.enroll("a@x.com", "pw", &png(FACES[0])).unwrap();

        assert!(matches!(
            h.auth.verify_face("a@x.com", b"not an image"),
            Err(AuthError::ImageDecode(_))
        ));
        assert!(matches!(
            h.auth.verify_face("a@x.com", &[]),
            Err(AuthError::InvalidInput(_))
        ));
    }

    #[test]
    fn enroll_validates_inputs() {
        let h = harness();
        let sample = png(FACES[0]);
        assert!(matches!(
            h.auth.enroll("  ", "pw", &sample),
            Err(AuthError::InvalidInput(_))
        ));
        assert!(matches!(
            h.auth.enroll("a@x.com", "", &sample),
            Err(AuthError::InvalidInput(_))
        ));
        assert!(matches!(
            h.auth.enroll("a@x.com", "pw", &[]),
            Err(AuthError::InvalidInput(_))
        ));
        assert!(!h.store.identity_exists(&key("a@x.com")).unwrap());
    }

    #[test]
    fn corrupt_sample_does_not_register_identity() {
        let h = harness();
        assert!(matches!(
            h.auth.enroll("a@x.com", "pw", b"not an image"),
            Err(AuthError::ImageDecode(_))
        ));
        assert!(!h.store.identity_exists(&key("a@x.com")).unwrap());
    }

    #[test]
    fn password_verdicts() {
        let h = harness();
        assert_eq!(
            h.auth.verify_password("a@x.com", "pw").unwrap(),
            PasswordVerdict::UserNotFound
        );
        h.auth.enroll("a@x.com", "pw", &png(FACES[0])).unwrap();
        assert_eq!(
            h.auth.verify_password("A@x.com", "pw").unwrap(),
            PasswordVerdict::Accepted
        );
        assert_eq!(
            h.auth.verify_password("a@x.com", "PW").unwrap(),
            PasswordVerdict::Rejected
        );
        assert!(matches!(
            h.auth.verify_password("a@x.com", ""),
            Err(AuthError::InvalidInput(_))
        ));
    }

    #[test]
    fn resource_errors_map_to_resource_init() {
        let err = AuthError::from(RecognizerError::Resource(ResourceError::Load("boom".into())));
        assert!(matches!(err, AuthError::ResourceInit(_)));
        assert_eq!(err.user_message(), "Face recognition temporarily unavailable");

        let err = AuthError::from(RecognizerError::DegenerateEmbedding);
        assert!(matches!(err, AuthError::Extraction(_)));
        assert_eq!(err.user_message(), "Internal server error");
    }

    #[test]
    fn identity_locks_are_pruned_when_idle() {
        let locks = IdentityLocks::default();
        let a = locks.acquire(&key("a@x.com"));
        drop(a);
        let _b = locks.acquire(&key("b@x.com"));
        let map = locks.inner.lock().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&key("b@x.com")));
    }
}
