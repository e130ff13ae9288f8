//! Mask overlay rendering

use crate::error::VisionError;
use crate::processing::Annotation;
use image::{imageops, DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tracing::{debug, info};

/// Opacity of every painted mask
pub const MASK_ALPHA: f32 = 0.35;

/// Paints annotations over their source image in random colours
pub struct Visualizer {
    rng: StdRng,
}

impl Default for Visualizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Visualizer {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible colours
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_seed(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::new, Self::seeded)
    }

    fn next_color(&mut self) -> Rgba<u8> {
        let alpha = (MASK_ALPHA * 255.0).round() as u8;
        Rgba([self.rng.gen(), self.rng.gen(), self.rng.gen(), alpha])
    }

    /// Transparent overlay with each mask painted in its own colour,
    /// largest first so smaller masks stay visible. `None` when there is
    /// nothing to draw.
    pub fn render_overlay(&mut self, annotations: &[Annotation]) -> Option<RgbaImage> {
        let mut sorted: Vec<&Annotation> = annotations.iter().collect();
        sorted.sort_by(|a, b| b.area.cmp(&a.area));

        let first = sorted.first()?;
        let mut overlay = RgbaImage::new(first.width() as u32, first.height() as u32);

        for annotation in sorted {
            let color = self.next_color();
            for ((y, x), &set) in annotation.segmentation.indexed_iter() {
                if set && (x as u32) < overlay.width() && (y as u32) < overlay.height() {
                    overlay.put_pixel(x as u32, y as u32, color);
                }
            }
        }
        Some(overlay)
    }

    /// Composite the annotations over `image`; `None` when there are none
    pub fn compose(
        &mut self,
        image: &RgbImage,
        annotations: &[Annotation],
    ) -> Result<Option<RgbImage>, VisionError> {
        let (width, height) = image.dimensions();
        if let Some(bad) = annotations
            .iter()
            .find(|a| a.width() != width as usize || a.height() != height as usize)
        {
            return Err(VisionError::Format(format!(
                "Mask is {}x{} but the image is {}x{}",
                bad.width(),
                bad.height(),
                width,
                height
            )));
        }

        let Some(overlay) = self.render_overlay(annotations) else {
            return Ok(None);
        };

        let mut canvas = DynamicImage::ImageRgb8(image.clone()).to_rgba8();
        imageops::overlay(&mut canvas, &overlay, 0, 0);

        let composed = RgbImage::from_fn(width, height, |x, y| {
            let Rgba([r, g, b, _]) = *canvas.get_pixel(x, y);
            Rgb([r, g, b])
        });
        Ok(Some(composed))
    }

    /// Render the annotations over `image` and save a PNG to `path`,
    /// replacing any existing file. Returns `false` without writing
    /// anything when there are no annotations.
    pub fn show_annotations(
        &mut self,
        image: &RgbImage,
        annotations: &[Annotation],
        path: &Path,
    ) -> Result<bool, VisionError> {
        let Some(composed) = self.compose(image, annotations)? else {
            debug!("No annotations to render");
            return Ok(false);
        };

        composed
            .save_with_format(path, ImageFormat::Png)
            .map_err(|e| VisionError::Format(format!("Cannot write overlay to {:?}: {}", path, e)))?;
        info!("Saved overlay of {} masks to {:?}", annotations.len(), path);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tempfile::TempDir;

    fn rect(height: usize, width: usize, x0: usize, x1: usize) -> Annotation {
        let mask = Array2::from_shape_fn((height, width), |(_, c)| c >= x0 && c < x1);
        Annotation::from_mask(mask, 0.9, 0.97, [x0 as f32, 0.0]).unwrap()
    }

    #[test]
    fn test_empty_annotations_write_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("overlay.png");
        let mut visualizer = Visualizer::seeded(0);
        let written = visualizer
            .show_annotations(&RgbImage::new(8, 6), &[], &path)
            .unwrap();
        assert!(!written);
        assert!(!path.exists());
    }

    #[test]
    fn test_overlay_matches_image_dimensions() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("overlay.png");
        let image = RgbImage::from_pixel(64, 48, Rgb([200, 200, 200]));
        let annotations = vec![rect(48, 64, 0, 10), rect(48, 64, 30, 64)];

        let mut visualizer = Visualizer::seeded(7);
        assert!(visualizer.show_annotations(&image, &annotations, &path).unwrap());

        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (64, 48));
    }

    #[test]
    fn test_overlay_alpha_and_order() {
        // The small mask sits inside the large one and must win
        let annotations = vec![rect(4, 8, 2, 4), rect(4, 8, 0, 8)];
        let overlay = Visualizer::seeded(1).render_overlay(&annotations).unwrap();
        let alpha = (MASK_ALPHA * 255.0).round() as u8;
        assert_eq!(alpha, 89);
        assert!(overlay.pixels().all(|p| p[3] == alpha));

        let mut visualizer = Visualizer::seeded(1);
        let large_color = visualizer.next_color();
        let small_color = visualizer.next_color();
        assert_eq!(*overlay.get_pixel(0, 0), large_color);
        assert_eq!(*overlay.get_pixel(2, 0), small_color);
    }

    #[test]
    fn test_unmasked_pixels_unchanged() {
        let image = RgbImage::from_pixel(8, 4, Rgb([10, 20, 30]));
        let annotations = vec![rect(4, 8, 0, 2)];
        let composed = Visualizer::seeded(3).compose(&image, &annotations).unwrap().unwrap();
        assert_eq!(*composed.get_pixel(7, 3), Rgb([10, 20, 30]));
    }

    #[test]
    fn test_seeded_output_is_reproducible() {
        let image = RgbImage::from_pixel(16, 16, Rgb([128, 64, 32]));
        let annotations = vec![rect(16, 16, 0, 5), rect(16, 16, 8, 12)];
        let a = Visualizer::seeded(42).compose(&image, &annotations).unwrap();
        let b = Visualizer::seeded(42).compose(&image, &annotations).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mask_dimension_mismatch() {
        let image = RgbImage::new(8, 8);
        let annotations = vec![rect(4, 8, 0, 2)];
        let result = Visualizer::seeded(0).compose(&image, &annotations);
        assert!(matches!(result, Err(VisionError::Format(_))));
    }

    #[test]
    fn test_unwritable_path() {
        let image = RgbImage::new(8, 4);
        let annotations = vec![rect(4, 8, 0, 2)];
        let result = Visualizer::seeded(0).show_annotations(
            &image,
            &annotations,
            Path::new("/nonexistent/dir/overlay.png"),
        );
        assert!(matches!(result, Err(VisionError::Format(_))));
    }
}
