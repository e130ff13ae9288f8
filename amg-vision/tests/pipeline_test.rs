//! End-to-end harness flow over a mocked mask generator

use amg_vision::processing::Annotation;
use amg_vision::profiler::DEVICE_TARGET;
use amg_vision::{
    load_rgb, BenchmarkConfig, BenchmarkRunner, MaskGenerator, TraceRecorder, VisionError, Visualizer,
};
use flate2::read::GzDecoder;
use image::{Rgb, RgbImage};
use mockall::mock;
use ndarray::Array2;
use std::fs::File;
use std::io::Read;
use tempfile::TempDir;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

mock! {
    Generator {}

    impl MaskGenerator for Generator {
        fn generate(&self, image: &RgbImage) -> Result<Vec<Annotation>, VisionError>;
        fn synchronize(&self) -> Result<(), VisionError>;
    }
}

/// One mask per horizontal band of the image
fn banded_masks(image: &RgbImage, bands: usize) -> Vec<Annotation> {
    if bands == 0 {
        return Vec::new();
    }
    let (width, height) = (image.width() as usize, image.height() as usize);
    let band = height / bands;
    (0..bands)
        .filter_map(|i| {
            let mask = Array2::from_shape_fn((height, width), |(r, _)| r >= i * band && r < (i + 1) * band);
            tracing::info_span!(target: DEVICE_TARGET, "mask_decoder", band = i as u64).in_scope(|| {
                Annotation::from_mask(mask, 0.9, 0.97, [width as f32 / 2.0, (i * band) as f32])
            })
        })
        .collect()
}

fn dog_image(dir: &TempDir) -> RgbImage {
    let path = dir.path().join("dog.png");
    RgbImage::from_fn(640, 480, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
        .save(&path)
        .unwrap();
    load_rgb(&path).unwrap()
}

fn generator_with(bands: usize) -> MockGenerator {
    let mut generator = MockGenerator::new();
    generator
        .expect_generate()
        .returning(move |image| Ok(banded_masks(image, bands)));
    generator.expect_synchronize().returning(|| Ok(()));
    generator
}

#[test]
fn test_full_harness_flow() {
    let temp_dir = TempDir::new().unwrap();
    let image = dog_image(&temp_dir);
    let overlay_path = temp_dir.path().join("dog_mask_fast.png");
    let trace_path = temp_dir.path().join("amg_example_trace.json.gz");

    let recorder = TraceRecorder::new();
    let subscriber = Registry::default().with(recorder.clone());
    tracing::subscriber::with_default(subscriber, || {
        let generator = generator_with(4);
        let runner = BenchmarkRunner::new(BenchmarkConfig::default()).unwrap();

        let masks = runner.warmup(&generator, &image).unwrap();
        assert_eq!(masks.len(), 4);
        for mask in &masks {
            assert_eq!(mask.segmentation.dim(), (480, 640));
        }

        let written = Visualizer::seeded(0)
            .show_annotations(&image, &masks, &overlay_path)
            .unwrap();
        assert!(written);

        let latency = runner.time(&generator, &image).unwrap();
        assert_eq!(latency.iterations, 10);
        assert!(latency.mean_ms.is_finite() && latency.mean_ms >= 0.0);

        let profiled = runner.profile(&generator, &image, &recorder, &trace_path).unwrap();
        assert_eq!(profiled.len(), 4);
    });

    let overlay = image::open(&overlay_path).unwrap();
    assert_eq!((overlay.width(), overlay.height()), (640, 480));

    let mut json = String::new();
    GzDecoder::new(File::open(&trace_path).unwrap())
        .read_to_string(&mut json)
        .unwrap();
    let trace: serde_json::Value = serde_json::from_str(&json).unwrap();
    let events = trace["traceEvents"].as_array().unwrap();
    let decoder_events = events
        .iter()
        .filter(|e| e["name"] == "mask_decoder" && e["cat"] == "gpu_op")
        .count();
    assert_eq!(decoder_events, 4);
}

#[test]
fn test_no_masks_means_no_overlay() {
    let temp_dir = TempDir::new().unwrap();
    let image = RgbImage::new(32, 24);
    let overlay_path = temp_dir.path().join("overlay.png");

    let generator = generator_with(0);
    let runner = BenchmarkRunner::new(BenchmarkConfig { warmup_iterations: 1, iterations: 1 }).unwrap();
    let masks = runner.warmup(&generator, &image).unwrap();
    assert!(masks.is_empty());

    let written = Visualizer::new().show_annotations(&image, &masks, &overlay_path).unwrap();
    assert!(!written);
    assert!(!overlay_path.exists());
}

#[test]
fn test_overlay_replaces_existing_file() {
    let temp_dir = TempDir::new().unwrap();
    let image = RgbImage::from_pixel(40, 20, Rgb([255, 255, 255]));
    let overlay_path = temp_dir.path().join("overlay.png");
    std::fs::write(&overlay_path, b"stale").unwrap();

    let masks = banded_masks(&image, 2);
    assert!(Visualizer::seeded(5).show_annotations(&image, &masks, &overlay_path).unwrap());
    let overlay = image::open(&overlay_path).unwrap();
    assert_eq!((overlay.width(), overlay.height()), (40, 20));
}

#[test]
fn test_generator_failure_stops_run() {
    let mut generator = MockGenerator::new();
    generator
        .expect_generate()
        .times(1)
        .returning(|_| Err(VisionError::ResourceExhausted("failed to allocate memory".to_string())));

    let runner = BenchmarkRunner::new(BenchmarkConfig::default()).unwrap();
    let result = runner.warmup(&generator, &RgbImage::new(8, 8));
    assert!(matches!(result, Err(VisionError::ResourceExhausted(_))));
}
