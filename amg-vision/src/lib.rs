//! amg-vision: automatic mask generation and benchmarking for SAM2
//!
//! Loads a SAM2 model from exported ONNX graphs, prompts it with a regular
//! point grid to segment everything in an image, and provides the pieces a
//! benchmark harness needs around that: warmup and timing, overlay
//! rendering, Chrome-trace profiling and peak memory reporting.

pub mod bench;
pub mod config;
pub mod error;
pub mod image_io;
pub mod memory;
pub mod models;
pub mod processing;
pub mod profiler;
pub mod visualize;
mod utils;

pub use bench::{BenchmarkConfig, BenchmarkRunner, LatencyReport};
pub use config::{GeneratorConfig, HarnessConfig};
pub use error::VisionError;
pub use image_io::load_rgb;
pub use memory::{probe_for, MemoryProbe, MemoryReport};
pub use models::{build_sam2, Device, Precision, Sam2Model};
pub use processing::{Annotation, AutomaticMaskGenerator, MaskGenerator};
pub use profiler::{profile_run, TraceRecorder};
pub use visualize::Visualizer;
