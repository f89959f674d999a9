//! ArcFace descriptor extraction via ONNX Runtime.
//!
//! Crops a square region around the detected box, resizes it to 112×112
//! and returns the L2-normalized 512-dim embedding.

use crate::descriptor::{AnalysisError, ModelError};
use crate::types::{BoundingBox, Descriptor};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_DESCRIPTOR_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";
/// Extra context around the detector box, as a fraction of its longer side.
const CROP_MARGIN: f32 = 0.15;

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::NotFound(model_path.display().to_string()));
        }
        let session = crate::onnx::open_session(model_path)
            .map_err(|e| ModelError::LoadFailed(format!("ArcFace: {e}")))?;
        tracing::info!(path = %model_path.display(), "loaded ArcFace model");
        Ok(Self { session })
    }

    pub fn extract(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Descriptor, AnalysisError> {
        let img = GrayImage::from_raw(width, height, pixels.to_vec())
            .ok_or_else(|| AnalysisError::AnalysisFailed("pixel buffer size mismatch".into()))?;
        let crop = crop_face(&img, face).ok_or(AnalysisError::NoFaceDetected)?;
        let input = to_tensor(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())
                .map_err(|e| AnalysisError::AnalysisFailed(e.to_string()))?])
            .map_err(|e| AnalysisError::AnalysisFailed(format!("ArcFace inference: {e}")))?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AnalysisError::AnalysisFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_DESCRIPTOR_DIM {
            return Err(AnalysisError::AnalysisFailed(format!(
                "expected {ARCFACE_DESCRIPTOR_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Descriptor {
            values: l2_normalize(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// Square crop around `face`, clamped to the image and resized for ArcFace.
///
/// Returns `None` when the box lies entirely outside the image.
fn crop_face(img: &GrayImage, face: &BoundingBox) -> Option<GrayImage> {
    let side = face.width.max(face.height) * (1.0 + 2.0 * CROP_MARGIN);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let x0 = (cx - side / 2.0).max(0.0) as u32;
    let y0 = (cy - side / 2.0).max(0.0) as u32;
    let x1 = ((cx + side / 2.0).max(0.0) as u32).min(img.width());
    let y1 = ((cy + side / 2.0).max(0.0) as u32).min(img.height());
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let region = imageops::crop_imm(img, x0, y0, x1 - x0, y1 - y0).to_image();
    Some(imageops::resize(
        &region,
        ARCFACE_INPUT_SIZE,
        ARCFACE_INPUT_SIZE,
        FilterType::Triangle,
    ))
}

fn to_tensor(crop: &GrayImage) -> Array4<f32> {
    let n = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
    for (x, y, px) in crop.enumerate_pixels() {
        let v = (px.0[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = v;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
