//! Error types for amg-vision

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("ONNX Runtime error: {0}")]
    Ort(String),

    #[error("Image error: {0}")]
    Image(image::ImageError),
}

/// Substrings ONNX Runtime and the CUDA provider use when an allocation fails.
const OOM_MARKERS: &[&str] = &[
    "out of memory",
    "failed to allocate",
    "cudaerrormemoryallocation",
    "bfcarena",
];

/// Classify an ONNX Runtime failure, separating allocation failures
pub(crate) fn ort_error<E: std::fmt::Display>(err: E) -> VisionError {
    let message = err.to_string();
    if is_out_of_memory(&message) {
        VisionError::ResourceExhausted(message)
    } else {
        VisionError::Ort(message)
    }
}

impl From<image::ImageError> for VisionError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(io) => VisionError::Io(io),
            image::ImageError::Decoding(e) => VisionError::Format(e.to_string()),
            image::ImageError::Unsupported(e) => VisionError::Format(e.to_string()),
            other => VisionError::Image(other),
        }
    }
}

impl From<nvml_wrapper::error::NvmlError> for VisionError {
    fn from(err: nvml_wrapper::error::NvmlError) -> Self {
        VisionError::Device(format!("NVML: {}", err))
    }
}

pub(crate) fn is_out_of_memory(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    OOM_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub type Result<T> = std::result::Result<T, VisionError>;
