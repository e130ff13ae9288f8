//! Utility functions for tensor preparation and mask resampling

use crate::error::VisionError;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array2;

/// Resize an RGB image to `size`×`size` and convert it to a normalised
/// `[3, size, size]` float tensor (channel-major, RGB order).
pub fn rgb_to_chw_tensor(
    image: &RgbImage,
    size: u32,
    pixel_mean: [f32; 3],
    pixel_std: [f32; 3],
) -> Result<Vec<f32>, VisionError> {
    if size == 0 {
        return Err(VisionError::Format("Target size cannot be zero".to_string()));
    }
    if image.width() == 0 || image.height() == 0 {
        return Err(VisionError::Format("Invalid image dimensions".to_string()));
    }
    if pixel_std.iter().any(|s| *s <= 0.0) {
        return Err(VisionError::Config("Pixel std must be positive".to_string()));
    }

    let plane = (size as usize)
        .checked_mul(size as usize)
        .ok_or_else(|| VisionError::Format("Target dimensions too large, would overflow".to_string()))?;

    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);

    let mut tensor = vec![0.0f32; plane * 3];
    for (i, pixel) in resized.pixels().enumerate() {
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            tensor[c * plane + i] = (value - pixel_mean[c]) / pixel_std[c];
        }
    }
    Ok(tensor)
}

/// Source index and weight pairs for one axis of a half-pixel-centred
/// bilinear resize.
fn axis_weights(src: usize, dst: usize) -> Vec<(usize, usize, f32)> {
    let scale = src as f32 / dst as f32;
    (0..dst)
        .map(|d| {
            let pos = ((d as f32 + 0.5) * scale - 0.5).max(0.0);
            let i0 = (pos as usize).min(src - 1);
            let i1 = if i0 + 1 < src { i0 + 1 } else { i0 };
            (i0, i1, pos - i0 as f32)
        })
        .collect()
}

/// Bilinearly resample a row-major `src_h`×`src_w` plane to `out_h`×`out_w`.
pub fn upsample_bilinear(
    src: &[f32],
    src_h: usize,
    src_w: usize,
    out_h: usize,
    out_w: usize,
) -> Result<Array2<f32>, VisionError> {
    if src_h == 0 || src_w == 0 || out_h == 0 || out_w == 0 {
        return Err(VisionError::Format("Cannot resample an empty plane".to_string()));
    }
    if src.len() != src_h * src_w {
        return Err(VisionError::Format(format!(
            "Plane has {} values, expected {}x{}",
            src.len(),
            src_h,
            src_w
        )));
    }

    if src_h == out_h && src_w == out_w {
        return Array2::from_shape_vec((out_h, out_w), src.to_vec())
            .map_err(|e| VisionError::Format(e.to_string()));
    }

    let rows = axis_weights(src_h, out_h);
    let cols = axis_weights(src_w, out_w);

    let mut out = Array2::<f32>::zeros((out_h, out_w));
    for (y, &(y0, y1, wy)) in rows.iter().enumerate() {
        let top = &src[y0 * src_w..(y0 + 1) * src_w];
        let bottom = &src[y1 * src_w..(y1 + 1) * src_w];
        for (x, &(x0, x1, wx)) in cols.iter().enumerate() {
            let t = top[x0] + (top[x1] - top[x0]) * wx;
            let b = bottom[x0] + (bottom[x1] - bottom[x0]) * wx;
            out[[y, x]] = t + (b - t) * wy;
        }
    }
    Ok(out)
}
