//! Warmup, timing and profiling of a mask generator

use crate::config::HarnessConfig;
use crate::error::VisionError;
use crate::memory::{MemoryProbe, MemoryReport};
use crate::processing::{Annotation, MaskGenerator};
use crate::profiler::{profile_run, TraceRecorder};
use image::RgbImage;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span};

/// Iteration counts for one benchmark run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkConfig {
    pub warmup_iterations: usize,
    pub iterations: usize,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            warmup_iterations: 3,
            iterations: 10,
        }
    }
}

impl From<&HarnessConfig> for BenchmarkConfig {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            warmup_iterations: config.warmup_iterations,
            iterations: config.iterations,
        }
    }
}

impl BenchmarkConfig {
    pub fn validate(&self) -> Result<(), VisionError> {
        if self.warmup_iterations == 0 {
            return Err(VisionError::Config(
                "At least one warmup iteration is required before timing".to_string(),
            ));
        }
        if self.iterations == 0 {
            return Err(VisionError::Config("Timed iterations must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Wall-clock latency of the timed loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyReport {
    pub iterations: usize,
    pub total: Duration,
    /// Mean milliseconds per call
    pub mean_ms: f64,
}

impl LatencyReport {
    pub fn new(iterations: usize, total: Duration) -> Result<Self, VisionError> {
        if iterations == 0 {
            return Err(VisionError::Config("Timed iterations must be non-zero".to_string()));
        }
        Ok(Self {
            iterations,
            total,
            mean_ms: total.as_secs_f64() * 1000.0 / iterations as f64,
        })
    }
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mean_ms)
    }
}

/// Drives a [`MaskGenerator`] through warmup, timing and profiling
pub struct BenchmarkRunner {
    config: BenchmarkConfig,
    probe: Option<Box<dyn MemoryProbe>>,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig) -> Result<Self, VisionError> {
        config.validate()?;
        Ok(Self { config, probe: None })
    }

    /// Sample `probe` after generator calls so its peak covers the run
    pub fn with_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    pub fn probe(&self) -> Option<&dyn MemoryProbe> {
        self.probe.as_deref()
    }

    fn sample_memory(&self) -> Result<(), VisionError> {
        match &self.probe {
            Some(probe) => probe.sample(),
            None => Ok(()),
        }
    }

    /// Run the warmup calls; returns the annotations of the last one
    pub fn warmup(
        &self,
        generator: &dyn MaskGenerator,
        image: &RgbImage,
    ) -> Result<Vec<Annotation>, VisionError> {
        let _span = info_span!("warmup", iterations = self.config.warmup_iterations).entered();
        info!("Warming up with {} iterations", self.config.warmup_iterations);

        let mut annotations = Vec::new();
        for i in 0..self.config.warmup_iterations {
            annotations = generator.generate(image)?;
            self.sample_memory()?;
            debug!("Warmup {} produced {} masks", i + 1, annotations.len());
        }
        Ok(annotations)
    }

    /// Time `iterations` back-to-back calls between two synchronisations
    pub fn time(&self, generator: &dyn MaskGenerator, image: &RgbImage) -> Result<LatencyReport, VisionError> {
        let iterations = self.config.iterations;
        let _span = info_span!("time", iterations = iterations).entered();

        generator.synchronize()?;
        let start = Instant::now();
        for _ in 0..iterations {
            generator.generate(image)?;
        }
        generator.synchronize()?;
        let total = start.elapsed();
        self.sample_memory()?;

        let report = LatencyReport::new(iterations, total)?;
        info!("Timed {} iterations: {:.3} ms mean", iterations, report.mean_ms);
        Ok(report)
    }

    /// One call recorded by `recorder` and exported to `path`
    pub fn profile(
        &self,
        generator: &dyn MaskGenerator,
        image: &RgbImage,
        recorder: &TraceRecorder,
        path: &Path,
    ) -> Result<Vec<Annotation>, VisionError> {
        let annotations = profile_run(recorder, path, || {
            let annotations = generator.generate(image)?;
            generator.synchronize()?;
            Ok(annotations)
        })?;
        self.sample_memory()?;
        Ok(annotations)
    }

    /// Report of the attached probe, if any
    pub fn memory_report(&self) -> Option<Result<MemoryReport, VisionError>> {
        self.probe().map(MemoryReport::from_probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::generator::MockMaskGenerator;
    use ndarray::Array2;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn one_mask() -> Vec<Annotation> {
        let mask = Array2::from_shape_fn((4, 4), |(r, c)| r < 2 && c < 2);
        vec![Annotation::from_mask(mask, 0.9, 0.97, [1.0, 1.0]).unwrap()]
    }

    struct CountingProbe {
        samples: Arc<AtomicUsize>,
    }

    impl MemoryProbe for CountingProbe {
        fn sample(&self) -> Result<(), VisionError> {
            self.samples.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn peak_allocated(&self) -> Result<u64, VisionError> {
            Ok(512 << 20)
        }

        fn total(&self) -> Result<u64, VisionError> {
            Ok(2048 << 20)
        }
    }

    #[test]
    fn test_invalid_iteration_counts() {
        let zero_warmup = BenchmarkConfig { warmup_iterations: 0, iterations: 10 };
        assert!(matches!(BenchmarkRunner::new(zero_warmup), Err(VisionError::Config(_))));

        let zero_timed = BenchmarkConfig { warmup_iterations: 3, iterations: 0 };
        assert!(matches!(BenchmarkRunner::new(zero_timed), Err(VisionError::Config(_))));
    }

    #[test]
    fn test_warmup_calls_generator_and_returns_last() {
        let mut generator = MockMaskGenerator::new();
        generator.expect_generate().times(3).returning(|_| Ok(one_mask()));

        let runner = BenchmarkRunner::new(BenchmarkConfig::default()).unwrap();
        let annotations = runner.warmup(&generator, &RgbImage::new(4, 4)).unwrap();
        assert_eq!(annotations.len(), 1);
    }

    #[test]
    fn test_time_synchronises_around_loop() {
        let mut generator = MockMaskGenerator::new();
        generator.expect_generate().times(10).returning(|_| Ok(Vec::new()));
        generator.expect_synchronize().times(2).returning(|| Ok(()));

        let runner = BenchmarkRunner::new(BenchmarkConfig::default()).unwrap();
        let report = runner.time(&generator, &RgbImage::new(4, 4)).unwrap();
        assert_eq!(report.iterations, 10);
        assert!(report.mean_ms.is_finite());
        assert!(report.mean_ms >= 0.0);
    }

    #[test]
    fn test_out_of_memory_is_not_retried() {
        let mut generator = MockMaskGenerator::new();
        generator
            .expect_generate()
            .times(1)
            .returning(|_| Err(VisionError::ResourceExhausted("CUDA out of memory".to_string())));

        let runner = BenchmarkRunner::new(BenchmarkConfig::default()).unwrap();
        let result = runner.warmup(&generator, &RgbImage::new(4, 4));
        assert!(matches!(result, Err(VisionError::ResourceExhausted(_))));
    }

    #[test]
    fn test_probe_sampled_after_calls() {
        let samples = Arc::new(AtomicUsize::new(0));
        let mut generator = MockMaskGenerator::new();
        generator.expect_generate().returning(|_| Ok(one_mask()));
        generator.expect_synchronize().returning(|| Ok(()));

        let runner = BenchmarkRunner::new(BenchmarkConfig { warmup_iterations: 2, iterations: 5 })
            .unwrap()
            .with_probe(Box::new(CountingProbe { samples: samples.clone() }));
        let image = RgbImage::new(4, 4);
        runner.warmup(&generator, &image).unwrap();
        runner.time(&generator, &image).unwrap();
        assert_eq!(samples.load(Ordering::SeqCst), 3);

        let report = runner.memory_report().unwrap().unwrap();
        assert_eq!(report.to_string(), "memory(MiB): 512 memory(%): 25");
    }

    #[test]
    fn test_profile_writes_trace() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("trace.json.gz");
        let mut generator = MockMaskGenerator::new();
        generator.expect_generate().times(1).returning(|_| Ok(one_mask()));
        generator.expect_synchronize().times(1).returning(|| Ok(()));

        let runner = BenchmarkRunner::new(BenchmarkConfig::default()).unwrap();
        let annotations = runner
            .profile(&generator, &RgbImage::new(4, 4), &TraceRecorder::new(), &path)
            .unwrap();
        assert_eq!(annotations.len(), 1);
        assert!(path.exists());
    }

    #[test]
    fn test_latency_report_mean() {
        let report = LatencyReport::new(10, Duration::from_millis(2500)).unwrap();
        assert!((report.mean_ms - 250.0).abs() < 1e-9);
        assert_eq!(report.to_string(), "250");
        assert!(LatencyReport::new(0, Duration::ZERO).is_err());
    }

    #[test]
    fn test_benchmark_config_from_harness() {
        let mut harness = HarnessConfig::default();
        harness.iterations = 4;
        let config = BenchmarkConfig::from(&harness);
        assert_eq!(config, BenchmarkConfig { warmup_iterations: 3, iterations: 4 });
    }
}
