use crate::still::StillImage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounding box for a detected face, in source-frame pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face descriptor vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model version that produced this descriptor (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Descriptor {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Wire code attached to an attempt whose analysis did not yield a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaceErrorCode {
    NoFaceDetected,
    AnalysisFailed,
}

impl FaceErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoFaceDetected => "NO_FACE_DETECTED",
            Self::AnalysisFailed => "ANALYSIS_FAILED",
        }
    }

    /// Actionable copy shown when the error is surfaced to the user.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::NoFaceDetected => {
                "No face was detected. Face the camera in good light, keep only one person in frame and try again."
            }
            Self::AnalysisFailed => "The photo could not be analyzed. Retake it or try a different image.",
        }
    }
}

impl std::fmt::Display for FaceErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleOrigin {
    Camera,
    Upload,
}

/// One captured still and the outcome of analysing it.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: Uuid,
    pub image: StillImage,
    pub descriptor: Option<Descriptor>,
    pub captured_at: DateTime<Utc>,
    pub origin: SampleOrigin,
    pub analysis_error: Option<FaceErrorCode>,
}

impl Sample {
    pub fn new(image: StillImage, origin: SampleOrigin) -> Self {
        Self {
            id: Uuid::new_v4(),
            image,
            descriptor: None,
            captured_at: Utc::now(),
            origin,
            analysis_error: None,
        }
    }

    pub fn is_analyzed(&self) -> bool {
        self.descriptor.is_some()
    }
}
