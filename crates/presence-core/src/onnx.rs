//! ONNX-backed [`DescriptorModel`]: SCRFD detection then ArcFace embedding.

use crate::descriptor::{AnalysisError, DescriptorModel, ModelError, ModelLoader};
use crate::detector::FaceDetector;
use crate::recognizer::FaceRecognizer;
use crate::still::StillImage;
use crate::types::{BoundingBox, Descriptor};
use async_trait::async_trait;
use ort::session::Session;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const DETECTOR_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_FILE: &str = "w600k_r50.onnx";

/// Minimum detector confidence for a face to count.
const MIN_FACE_CONFIDENCE: f32 = 0.6;

pub(crate) fn open_session(path: &Path) -> ort::Result<Session> {
    Ok(Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?)
}

/// Loads both ONNX models from a directory on the blocking pool.
pub struct OnnxLoader {
    model_dir: PathBuf,
}

impl OnnxLoader {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }
}

#[async_trait]
impl ModelLoader for OnnxLoader {
    async fn load(&self) -> Result<Arc<dyn DescriptorModel>, ModelError> {
        let det_path = self.model_dir.join(DETECTOR_FILE);
        let rec_path = self.model_dir.join(RECOGNIZER_FILE);

        let model = tokio::task::spawn_blocking(move || {
            let detector = FaceDetector::load(&det_path)?;
            let recognizer = FaceRecognizer::load(&rec_path)?;
            Ok::<_, ModelError>(OnnxDescriptorModel {
                detector: Arc::new(Mutex::new(detector)),
                recognizer: Arc::new(Mutex::new(recognizer)),
            })
        })
        .await
        .map_err(|e| ModelError::LoadFailed(format!("loader task: {e}")))??;

        Ok(Arc::new(model))
    }
}

pub struct OnnxDescriptorModel {
    detector: Arc<Mutex<FaceDetector>>,
    recognizer: Arc<Mutex<FaceRecognizer>>,
}

#[async_trait]
impl DescriptorModel for OnnxDescriptorModel {
    async fn compute(&self, image: &StillImage) -> Result<Descriptor, AnalysisError> {
        let detector = self.detector.clone();
        let recognizer = self.recognizer.clone();
        let image = image.clone();

        tokio::task::spawn_blocking(move || {
            let faces = detector
                .lock()
                .map_err(|_| AnalysisError::AnalysisFailed("detector poisoned".into()))?
                .detect(image.pixels(), image.width(), image.height())?;
            let face = select_single_face(&faces, MIN_FACE_CONFIDENCE)?;
            tracing::debug!(confidence = face.confidence, "face selected");

            recognizer
                .lock()
                .map_err(|_| AnalysisError::AnalysisFailed("recognizer poisoned".into()))?
                .extract(image.pixels(), image.width(), image.height(), face)
        })
        .await
        .map_err(|e| AnalysisError::AnalysisFailed(format!("inference task: {e}")))?
    }
}

/// Exactly one face at or above `min_confidence`; none or several is `NoFaceDetected`.
pub fn select_single_face(
    faces: &[BoundingBox],
    min_confidence: f32,
) -> Result<&BoundingBox, AnalysisError> {
    let mut confident = faces.iter().filter(|f| f.confidence >= min_confidence);
    match (confident.next(), confident.next()) {
        (Some(face), None) => Ok(face),
        (None, _) => Err(AnalysisError::NoFaceDetected),
        (Some(_), Some(_)) => {
            tracing::debug!("multiple faces in frame; refusing ambiguous sample");
            Err(AnalysisError::NoFaceDetected)
        }
    }
}
