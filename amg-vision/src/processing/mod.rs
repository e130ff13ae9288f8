//! Mask generation pipeline

pub mod annotation;
pub mod generator;

pub use annotation::Annotation;
pub use generator::{AutomaticMaskGenerator, MaskGenerator};
