//! Still image representation shared by camera snapshots and uploads.

use image::{GrayImage, ImageFormat};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StillImageError {
    #[error("image is empty")]
    Empty,
    #[error("pixel buffer does not match {width}x{height}")]
    Dimensions { width: u32, height: u32 },
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
}

/// An encoded still plus its decoded grayscale pixels.
///
/// Cloning is cheap; buffers are shared.
#[derive(Clone)]
pub struct StillImage {
    encoded: Arc<[u8]>,
    mime_type: &'static str,
    file_name: Option<String>,
    pixels: Arc<[u8]>,
    width: u32,
    height: u32,
    digest: [u8; 32],
}

impl StillImage {
    /// Encode a grayscale frame as PNG.
    pub fn from_gray(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self, StillImageError> {
        if width == 0 || height == 0 {
            return Err(StillImageError::Empty);
        }
        let img = GrayImage::from_raw(width, height, pixels)
            .ok_or(StillImageError::Dimensions { width, height })?;

        let mut encoded = Vec::new();
        img.write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
            .map_err(|e| StillImageError::Encode(e.to_string()))?;

        Ok(Self::assemble(encoded, "image/png", None, img))
    }

    /// Decode an uploaded file (any format the `image` crate recognizes).
    pub fn decode(bytes: Vec<u8>, file_name: Option<String>) -> Result<Self, StillImageError> {
        if bytes.is_empty() {
            return Err(StillImageError::Empty);
        }
        let format =
            image::guess_format(&bytes).map_err(|e| StillImageError::Decode(e.to_string()))?;
        let img = image::load_from_memory_with_format(&bytes, format)
            .map_err(|e| StillImageError::Decode(e.to_string()))?
            .to_luma8();
        if img.width() == 0 || img.height() == 0 {
            return Err(StillImageError::Empty);
        }
        Ok(Self::assemble(bytes, format.to_mime_type(), file_name, img))
    }

    fn assemble(
        encoded: Vec<u8>,
        mime_type: &'static str,
        file_name: Option<String>,
        img: GrayImage,
    ) -> Self {
        let digest = Sha256::digest(&encoded).into();
        let (width, height) = img.dimensions();
        Self {
            encoded: encoded.into(),
            mime_type,
            file_name,
            pixels: img.into_raw().into(),
            width,
            height,
            digest,
        }
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn mime_type(&self) -> &str {
        self.mime_type
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Decoded 8-bit grayscale pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// True if both images carry bit-identical encoded bytes.
    pub fn same_bytes(&self, other: &StillImage) -> bool {
        self.digest == other.digest && self.encoded == other.encoded
    }
}

impl std::fmt::Debug for StillImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StillImage")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.encoded.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}
