//! PNG snapshot of the current bitmap.

use std::io::Cursor;

use {
    base64::Engine,
    image::{DynamicImage, GrayImage, ImageFormat},
};

use crate::CanvasError;

/// Encode the bitmap as PNG and return it base64-encoded (standard
/// alphabet, padded).
pub fn encode_base64(image: &GrayImage) -> Result<String, CanvasError> {
    let mut bytes = Vec::new();
    DynamicImage::ImageLuma8(image.clone())
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| CanvasError::Snapshot(err.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}
