//! presence-core — Face descriptor extraction and capture types.
//!
//! Uses SCRFD for face detection and ArcFace for the descriptor vector,
//! both running via ONNX Runtime. The rest of the pipeline only sees the
//! [`DescriptorService`] call contract.

pub mod descriptor;
pub mod detector;
pub mod onnx;
pub mod recognizer;
pub mod still;
pub mod types;

pub use descriptor::{AnalysisError, DescriptorModel, DescriptorService, ModelError, ModelLoader, Readiness};
pub use onnx::OnnxLoader;
pub use still::{StillImage, StillImageError};
pub use types::{BoundingBox, Descriptor, FaceErrorCode, Sample, SampleOrigin};

/// Default directory for ONNX model files.
pub fn default_model_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("presence/models")
}
