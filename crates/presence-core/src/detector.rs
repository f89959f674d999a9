//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the grayscale still to 640×640, runs the 3-stride SCRFD
//! head and decodes anchor-free boxes followed by NMS. Landmark outputs
//! are ignored; the recognizer works from the box alone.

use crate::descriptor::{AnalysisError, ModelError};
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

pub struct FaceDetector {
    session: Session,
    /// (score, bbox) output index per stride.
    outputs: [(usize, usize); 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::NotFound(model_path.display().to_string()));
        }
        let session = crate::onnx::open_session(model_path)
            .map_err(|e| ModelError::LoadFailed(format!("SCRFD: {e}")))?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(ModelError::LoadFailed(format!(
                "SCRFD needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let outputs = output_indices(&names);
        tracing::info!(path = %model_path.display(), ?outputs, "loaded SCRFD model");

        Ok(Self { session, outputs })
    }

    /// Detect faces, sorted by descending confidence.
    pub fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, AnalysisError> {
        let (input, letterbox) = preprocess(pixels, width, height)?;
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())
                .map_err(|e| AnalysisError::AnalysisFailed(e.to_string()))?])
            .map_err(|e| AnalysisError::AnalysisFailed(format!("SCRFD inference: {e}")))?;

        let mut boxes = Vec::new();
        for (&stride, &(score_idx, bbox_idx)) in SCRFD_STRIDES.iter().zip(self.outputs.iter()) {
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| AnalysisError::AnalysisFailed(format!("scores/{stride}: {e}")))?;
            let (_, deltas) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| AnalysisError::AnalysisFailed(format!("bboxes/{stride}: {e}")))?;
            boxes.extend(decode(scores, deltas, stride, &letterbox));
        }

        Ok(nms(boxes, SCRFD_NMS_THRESHOLD))
    }
}

/// Map stride → (score, bbox) output positions, by name when the export
/// names them `score_8`/`bbox_8`..., else positionally.
fn output_indices(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let named: Option<Vec<(usize, usize)>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();
    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    }
}

fn preprocess(
    pixels: &[u8],
    width: u32,
    height: u32,
) -> Result<(Array4<f32>, Letterbox), AnalysisError> {
    let img = GrayImage::from_raw(width, height, pixels.to_vec())
        .ok_or_else(|| AnalysisError::AnalysisFailed("pixel buffer size mismatch".into()))?;

    let size = SCRFD_INPUT_SIZE as f32;
    let scale = (size / width as f32).min(size / height as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(&img, new_w, new_h, FilterType::Triangle);

    let off_x = (SCRFD_INPUT_SIZE - new_w) / 2;
    let off_y = (SCRFD_INPUT_SIZE - new_h) / 2;
    let n = SCRFD_INPUT_SIZE as usize;
    // Padding is the mean, which normalizes to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
    for (x, y, px) in resized.enumerate_pixels() {
        let v = (px.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let (tx, ty) = ((x + off_x) as usize, (y + off_y) as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = v;
        }
    }

    Ok((
        tensor,
        Letterbox {
            scale,
            pad_x: off_x as f32,
            pad_y: off_y as f32,
        },
    ))
}

fn decode(scores: &[f32], deltas: &[f32], stride: usize, lb: &Letterbox) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > SCRFD_SCORE_THRESHOLD && i * 4 + 3 < deltas.len())
        .map(|i| {
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * s;
            let ay = (cell / grid) as f32 * s;
            let d = &deltas[i * 4..i * 4 + 4];
            let x1 = (ax - d[0] * s - lb.pad_x) / lb.scale;
            let y1 = (ay - d[1] * s - lb.pad_y) / lb.scale;
            let x2 = (ax + d[2] * s - lb.pad_x) / lb.scale;
            let y2 = (ay + d[3] * s - lb.pad_y) / lb.scale;
            BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: scores[i],
            }
        })
        .collect()
}

/// Greedy non-maximum suppression; output sorted by confidence.
pub(crate) fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut keep: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = w * h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence }
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert!(iou(&a, &bbox(20.0, 20.0, 5.0, 5.0, 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_cluster() {
        let result = nms(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            SCRFD_NMS_THRESHOLD,
        );
        let confidences: Vec<f32> = result.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_output_indices_by_name_and_position() {
        let named: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(output_indices(&named), [(1, 0), (3, 2), (5, 4)]);

        let generic: Vec<String> = (0..9).map(|i| i.to_string()).collect();
        assert_eq!(output_indices(&generic), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_preprocess_letterbox_geometry() {
        let (tensor, lb) = preprocess(&vec![255u8; 320 * 160], 320, 160).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_y, 160.0);
        // padding row normalizes to zero, image row does not
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert!(tensor[[0, 1, 320, 320]] > 0.9);
    }

    #[test]
    fn test_decode_maps_back_to_source() {
        let lb = Letterbox { scale: 2.0, pad_x: 0.0, pad_y: 0.0 };
        let grid = 640 / 32;
        let mut scores = vec![0.0; grid * grid * 2];
        let mut deltas = vec![0.0; scores.len() * 4];
        // anchor at cell (1, 1) → (32, 32) in input space
        let idx = (grid + 1) * 2;
        scores[idx] = 0.9;
        deltas[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);

        let boxes = decode(&scores, &deltas, 32, &lb);
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        assert!((b.x - 8.0).abs() < 1e-4 && (b.width - 16.0).abs() < 1e-4);
    }
}
