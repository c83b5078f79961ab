use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;

use crate::core::types::BoundingBox;

/// Asynchronously decode an image using spawn_blocking.
///
/// Image decoding is CPU-intensive, especially for large images.
pub async fn load_image_from_memory_async(bytes: Vec<u8>) -> Result<DynamicImage> {
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes).context("Failed to load image from memory")
    })
    .await
    .context("Failed to spawn blocking task for image loading")?
}

/// Crop a bounding box out of an image. The caller checks bounds.
pub fn crop_region(img: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    img.crop_imm(bbox.x, bbox.y, bbox.w, bbox.h)
}

/// Convert an RGB image into a `[1, 3, H, W]` tensor with values in [0, 1]
pub fn rgb_to_chw_tensor(rgb: &RgbImage) -> Array4<f32> {
    let (width, height) = rgb.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
        tensor[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
        tensor[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
    }

    tensor
}
