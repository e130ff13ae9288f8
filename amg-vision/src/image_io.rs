//! Image loading

use crate::error::VisionError;
use image::RgbImage;
use std::path::Path;
use tracing::debug;

/// Read an image file and normalise it to 8-bit RGB.
///
/// Grayscale, palette and alpha images are converted; the alpha channel is
/// dropped. Pixel rows are `height` and columns `width`.
pub fn load_rgb(path: &Path) -> Result<RgbImage, VisionError> {
    if !path.exists() {
        return Err(VisionError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Image {:?} not found", path),
        )));
    }

    let reader = image::io::Reader::open(path)?.with_guessed_format()?;
    if reader.format().is_none() {
        return Err(VisionError::Format(format!("Unrecognised image format: {:?}", path)));
    }

    let decoded = reader.decode()?;
    let rgb = decoded.into_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(VisionError::Format(format!("Image {:?} is empty", path)));
    }

    debug!("Loaded {:?} ({}x{})", path, rgb.width(), rgb.height());
    Ok(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, Rgba, RgbaImage};
    use tempfile::TempDir;

    #[test]
    fn test_load_rgb_png() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dog.png");
        RgbImage::from_pixel(640, 480, Rgb([10, 20, 30])).save(&path).unwrap();

        let image = load_rgb(&path).unwrap();
        assert_eq!(image.dimensions(), (640, 480));
        assert_eq!(image.get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_load_rgb_converts_grayscale_and_alpha() {
        let temp_dir = TempDir::new().unwrap();

        let gray_path = temp_dir.path().join("gray.png");
        GrayImage::from_pixel(4, 3, Luma([200])).save(&gray_path).unwrap();
        let gray = load_rgb(&gray_path).unwrap();
        assert_eq!(gray.get_pixel(1, 1), &Rgb([200, 200, 200]));

        let rgba_path = temp_dir.path().join("alpha.png");
        RgbaImage::from_pixel(4, 3, Rgba([1, 2, 3, 0])).save(&rgba_path).unwrap();
        let rgba = load_rgb(&rgba_path).unwrap();
        assert_eq!(rgba.dimensions(), (4, 3));
        assert_eq!(rgba.get_pixel(0, 0), &Rgb([1, 2, 3]));
    }

    #[test]
    fn test_load_rgb_missing() {
        let result = load_rgb(Path::new("/nonexistent/dog.jpg"));
        assert!(matches!(result, Err(VisionError::Io(_))));
    }

    #[test]
    fn test_load_rgb_not_an_image() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("notes.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();
        assert!(matches!(load_rgb(&path), Err(VisionError::Format(_))));
    }
}
