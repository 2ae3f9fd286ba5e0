//! JPEG thumbnails for uploaded images.

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Failed to encode thumbnail: {0}")]
    Encode(#[source] image::ImageError),
}

/// Target size for an image `width` x `height` scaled to `max_width`.
///
/// Aspect ratio is kept and images already narrower are left alone.
pub fn scaled_size(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width || width == 0 {
        return (width, height);
    }
    let scaled = (u64::from(height) * u64::from(max_width) / u64::from(width)).max(1);
    (max_width, scaled as u32)
}

/// Re-encode `bytes` as a JPEG no wider than `max_width`.
pub fn jpeg_thumbnail(bytes: &[u8], max_width: u32) -> Result<Vec<u8>, ThumbnailError> {
    let img = image::load_from_memory(bytes).map_err(ThumbnailError::Decode)?;
    let (width, height) = scaled_size(img.width(), img.height(), max_width);

    let resized = if (width, height) == (img.width(), img.height()) {
        img.to_rgb8()
    } else {
        image::imageops::resize(&img.to_rgb8(), width, height, FilterType::Triangle)
    };

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(resized)
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(ThumbnailError::Encode)?;
    Ok(out.into_inner())
}
