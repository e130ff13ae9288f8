//! Configuration for the mask-generation harness

use crate::error::VisionError;
use crate::models::Precision;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Parameters of the automatic mask generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Prompts sampled along each image side (grid is points_per_side²)
    pub points_per_side: usize,
    /// Prompts sent to the mask decoder per run
    pub points_per_batch: usize,
    /// Minimum predicted IoU for a candidate mask
    pub pred_iou_thresh: f32,
    /// Minimum stability score for a candidate mask
    pub stability_score_thresh: f32,
    /// Logit offset used by the stability score
    pub stability_score_offset: f32,
    /// Logit threshold that binarises masks
    pub mask_threshold: f32,
    /// Box IoU above which a lower-scored mask is dropped
    pub box_nms_thresh: f32,
    /// Masks with fewer pixels are dropped (0 disables)
    pub min_mask_region_area: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            points_per_side: 32,
            points_per_batch: 64,
            pred_iou_thresh: 0.8,
            stability_score_thresh: 0.95,
            stability_score_offset: 1.0,
            mask_threshold: 0.0,
            box_nms_thresh: 0.7,
            min_mask_region_area: 0,
        }
    }
}

impl GeneratorConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.points_per_side == 0 || self.points_per_side > 256 {
            return Err("points_per_side must be between 1 and 256".to_string());
        }
        if self.points_per_batch == 0 {
            return Err("points_per_batch must be non-zero".to_string());
        }
        for (name, value) in [
            ("pred_iou_thresh", self.pred_iou_thresh),
            ("stability_score_thresh", self.stability_score_thresh),
            ("box_nms_thresh", self.box_nms_thresh),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(format!("{} must be within [0, 1]", name));
            }
        }
        if !self.stability_score_offset.is_finite() || self.stability_score_offset < 0.0 {
            return Err("stability_score_offset must be finite and non-negative".to_string());
        }
        if !self.mask_threshold.is_finite() {
            return Err("mask_threshold must be finite".to_string());
        }
        Ok(())
    }
}

/// Harness configuration: every path and knob the pipeline uses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Image to segment
    pub image_path: PathBuf,
    /// Directory holding the model graphs
    pub checkpoint: PathBuf,
    /// Model descriptor file or built-in variant id
    pub model_config: String,
    /// Target device (`cpu`, `cuda`, `cuda:N`)
    pub device: String,
    /// Precision applied to every submodule (`None` keeps the graph's own)
    pub precision: Option<Precision>,
    /// Discarded calls before timing
    pub warmup_iterations: usize,
    /// Timed calls
    pub iterations: usize,
    /// Rendered overlay destination
    pub overlay_path: PathBuf,
    /// Profiling trace destination
    pub trace_path: PathBuf,
    /// Seed for overlay colours (random when unset)
    pub color_seed: Option<u64>,
    /// Mask generator parameters
    pub generator: GeneratorConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            image_path: PathBuf::from("dog.jpg"),
            checkpoint: PathBuf::from("checkpoints/sam2_hiera_large"),
            model_config: "sam2_hiera_l.yaml".to_string(),
            device: "cuda".to_string(),
            precision: Some(Precision::F32),
            warmup_iterations: 3,
            iterations: 10,
            overlay_path: PathBuf::from("dog_mask_fast.png"),
            trace_path: PathBuf::from("amg_example_trace.json.gz"),
            color_seed: None,
            generator: GeneratorConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a JSON, TOML or YAML file
    pub fn from_file(path: &Path) -> Result<Self, VisionError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a string in any supported format
    pub fn from_str(content: &str) -> Result<Self, VisionError> {
        if let Ok(config) = serde_json::from_str::<HarnessConfig>(content) {
            return Ok(config);
        }

        if let Ok(config) = toml::from_str::<HarnessConfig>(content) {
            return Ok(config);
        }

        serde_yaml::from_str::<HarnessConfig>(content)
            .map_err(|e| VisionError::Config(format!("Unrecognised harness config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), VisionError> {
        if self.warmup_iterations == 0 {
            return Err(VisionError::Config(
                "At least one warmup iteration is required before timing".to_string(),
            ));
        }
        if self.iterations == 0 {
            return Err(VisionError::Config("Timed iterations must be non-zero".to_string()));
        }
        for (name, path) in [
            ("image_path", &self.image_path),
            ("checkpoint", &self.checkpoint),
            ("overlay_path", &self.overlay_path),
            ("trace_path", &self.trace_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(VisionError::Config(format!("{} must not be empty", name)));
            }
        }
        if self.model_config.trim().is_empty() {
            return Err(VisionError::Config("model_config must not be empty".to_string()));
        }
        if self.device.trim().is_empty() {
            return Err(VisionError::Config("device must not be empty".to_string()));
        }
        self.generator.validate().map_err(VisionError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = HarnessConfig::default();
        assert_eq!(config.image_path, PathBuf::from("dog.jpg"));
        assert_eq!(config.model_config, "sam2_hiera_l.yaml");
        assert_eq!(config.device, "cuda");
        assert_eq!(config.precision, Some(Precision::F32));
        assert_eq!(config.warmup_iterations, 3);
        assert_eq!(config.iterations, 10);
        assert_eq!(config.overlay_path, PathBuf::from("dog_mask_fast.png"));
        assert_eq!(config.trace_path, PathBuf::from("amg_example_trace.json.gz"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_warmup() {
        let mut config = HarnessConfig::default();
        config.warmup_iterations = 0;
        assert!(matches!(config.validate(), Err(VisionError::Config(_))));
    }

    #[test]
    fn test_config_validation_zero_iterations() {
        let mut config = HarnessConfig::default();
        config.iterations = 0;
        assert!(matches!(config.validate(), Err(VisionError::Config(_))));
    }

    #[test]
    fn test_config_validation_empty_paths() {
        let mut config = HarnessConfig::default();
        config.overlay_path = PathBuf::new();
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.model_config = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generator_validation() {
        let mut generator = GeneratorConfig::default();
        assert!(generator.validate().is_ok());

        generator.points_per_side = 0;
        assert!(generator.validate().is_err());

        let mut generator = GeneratorConfig::default();
        generator.pred_iou_thresh = 1.5;
        assert!(generator.validate().is_err());

        let mut generator = GeneratorConfig::default();
        generator.box_nms_thresh = f32::NAN;
        assert!(generator.validate().is_err());

        let mut generator = GeneratorConfig::default();
        generator.points_per_batch = 0;
        assert!(generator.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config = HarnessConfig::from_str(
            r#"
            image_path = "cat.png"
            device = "cpu"
            precision = "f16"
            iterations = 4

            [generator]
            points_per_side = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.image_path, PathBuf::from("cat.png"));
        assert_eq!(config.device, "cpu");
        assert_eq!(config.precision, Some(Precision::F16));
        assert_eq!(config.iterations, 4);
        assert_eq!(config.warmup_iterations, 3);
        assert_eq!(config.generator.points_per_side, 16);
        assert_eq!(config.generator.points_per_batch, 64);
    }

    #[test]
    fn test_config_from_yaml_and_json() {
        let yaml = HarnessConfig::from_str("device: cuda:1\nwarmup_iterations: 5\n").unwrap();
        assert_eq!(yaml.device, "cuda:1");
        assert_eq!(yaml.warmup_iterations, 5);

        let json = HarnessConfig::from_str(r#"{"precision": null, "color_seed": 7}"#).unwrap();
        assert_eq!(json.precision, None);
        assert_eq!(json.color_seed, Some(7));
    }

    #[test]
    fn test_config_from_garbage() {
        assert!(HarnessConfig::from_str("- [unterminated").is_err());
    }
}
