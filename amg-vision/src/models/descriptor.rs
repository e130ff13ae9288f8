//! Model descriptors: which graph backs each submodule and how to feed it

use crate::error::VisionError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Submodule names, in the order they are prepared
pub const IMAGE_ENCODER: &str = "image_encoder";
pub const PROMPT_ENCODER: &str = "prompt_encoder";
pub const MASK_DECODER: &str = "mask_decoder";
pub const SUBMODULES: [&str; 3] = [IMAGE_ENCODER, PROMPT_ENCODER, MASK_DECODER];

/// Reference to an ONNX graph inside the checkpoint directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRef {
    /// Path relative to the checkpoint directory
    pub graph: PathBuf,
    /// Expected SHA-256 of the graph file (hex)
    #[serde(default)]
    pub sha256: Option<String>,
}

impl GraphRef {
    fn new(graph: impl Into<PathBuf>) -> Self {
        Self { graph: graph.into(), sha256: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmoduleGraphs {
    pub image_encoder: GraphRef,
    pub prompt_encoder: GraphRef,
    pub mask_decoder: GraphRef,
}

impl SubmoduleGraphs {
    pub fn get(&self, name: &str) -> Option<&GraphRef> {
        match name {
            IMAGE_ENCODER => Some(&self.image_encoder),
            PROMPT_ENCODER => Some(&self.prompt_encoder),
            MASK_DECODER => Some(&self.mask_decoder),
            _ => None,
        }
    }
}

/// Tensor names of the image encoder graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderIo {
    pub image: String,
    /// Outputs forwarded to the decoder, in decoder input order
    pub outputs: Vec<String>,
}

impl Default for EncoderIo {
    fn default() -> Self {
        Self {
            image: "image".to_string(),
            outputs: vec![
                "image_embed".to_string(),
                "high_res_feats_0".to_string(),
                "high_res_feats_1".to_string(),
            ],
        }
    }
}

/// Tensor names of the prompt encoder + mask decoder graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderIo {
    /// Inputs receiving the encoder outputs, same order as `EncoderIo::outputs`
    pub embeddings: Vec<String>,
    pub point_coords: String,
    pub point_labels: String,
    pub mask_input: Option<String>,
    pub has_mask_input: Option<String>,
    pub masks: String,
    pub iou_predictions: String,
}

impl Default for DecoderIo {
    fn default() -> Self {
        Self {
            embeddings: EncoderIo::default().outputs,
            point_coords: "point_coords".to_string(),
            point_labels: "point_labels".to_string(),
            mask_input: Some("mask_input".to_string()),
            has_mask_input: Some("has_mask_input".to_string()),
            masks: "masks".to_string(),
            iou_predictions: "iou_predictions".to_string(),
        }
    }
}

fn default_image_size() -> u32 {
    1024
}

fn default_mask_input_size() -> u32 {
    256
}

fn default_pixel_mean() -> [f32; 3] {
    [0.485, 0.456, 0.406]
}

fn default_pixel_std() -> [f32; 3] {
    [0.229, 0.224, 0.225]
}

/// Everything needed to turn a checkpoint directory into a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    /// Square input resolution of the image encoder
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    /// Side of the low-resolution mask prompt
    #[serde(default = "default_mask_input_size")]
    pub mask_input_size: u32,
    #[serde(default = "default_pixel_mean")]
    pub pixel_mean: [f32; 3],
    #[serde(default = "default_pixel_std")]
    pub pixel_std: [f32; 3],
    pub submodules: SubmoduleGraphs,
    #[serde(default)]
    pub encoder: EncoderIo,
    #[serde(default)]
    pub decoder: DecoderIo,
}

impl ModelDescriptor {
    /// Parse a YAML descriptor
    pub fn from_yaml(content: &str) -> Result<Self, VisionError> {
        let descriptor: ModelDescriptor = serde_yaml::from_str(content)
            .map_err(|e| VisionError::Config(format!("Invalid model descriptor: {}", e)))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Validate descriptor
    pub fn validate(&self) -> Result<(), VisionError> {
        if self.name.trim().is_empty() {
            return Err(VisionError::Config("Descriptor name must not be empty".to_string()));
        }
        if self.image_size == 0 || self.image_size > 4096 {
            return Err(VisionError::Config("image_size must be between 1 and 4096".to_string()));
        }
        if self.mask_input_size == 0 || self.mask_input_size > self.image_size {
            return Err(VisionError::Config(
                "mask_input_size must be non-zero and no larger than image_size".to_string(),
            ));
        }
        if self.pixel_std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(VisionError::Config("pixel_std must be finite and positive".to_string()));
        }
        if self.encoder.outputs.is_empty() {
            return Err(VisionError::Config("Encoder must forward at least one output".to_string()));
        }
        if self.encoder.outputs.len() != self.decoder.embeddings.len() {
            return Err(VisionError::Config(format!(
                "Encoder forwards {} outputs but decoder expects {} embeddings",
                self.encoder.outputs.len(),
                self.decoder.embeddings.len()
            )));
        }
        for name in SUBMODULES {
            if let Some(graph) = self.submodules.get(name) {
                if graph.graph.as_os_str().is_empty() {
                    return Err(VisionError::Config(format!("{} has no graph", name)));
                }
            }
        }
        Ok(())
    }
}

/// Model variants known without a descriptor file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sam2Variant {
    Tiny,
    Small,
    BasePlus,
    Large,
}

impl Sam2Variant {
    pub const ALL: [Sam2Variant; 4] =
        [Sam2Variant::Tiny, Sam2Variant::Small, Sam2Variant::BasePlus, Sam2Variant::Large];

    /// Configuration identifier, without extension
    pub fn config_id(&self) -> &'static str {
        match self {
            Sam2Variant::Tiny => "sam2_hiera_t",
            Sam2Variant::Small => "sam2_hiera_s",
            Sam2Variant::BasePlus => "sam2_hiera_b+",
            Sam2Variant::Large => "sam2_hiera_l",
        }
    }

    /// Stem shared by the exported graph files
    pub fn file_stem(&self) -> &'static str {
        match self {
            Sam2Variant::Tiny => "sam2_hiera_tiny",
            Sam2Variant::Small => "sam2_hiera_small",
            Sam2Variant::BasePlus => "sam2_hiera_base_plus",
            Sam2Variant::Large => "sam2_hiera_large",
        }
    }

    /// Look up a variant by configuration id; `.yaml`/`.yml` suffixes are ignored
    pub fn from_config_id(id: &str) -> Option<Self> {
        let stem = id
            .trim()
            .trim_end_matches(".yaml")
            .trim_end_matches(".yml");
        Self::ALL.into_iter().find(|v| v.config_id() == stem)
    }

    /// Descriptor for the standard encoder/decoder export of this variant
    pub fn descriptor(&self) -> ModelDescriptor {
        let encoder = format!("{}.encoder.onnx", self.file_stem());
        let decoder = format!("{}.decoder.onnx", self.file_stem());
        ModelDescriptor {
            name: self.config_id().to_string(),
            image_size: default_image_size(),
            mask_input_size: default_mask_input_size(),
            pixel_mean: default_pixel_mean(),
            pixel_std: default_pixel_std(),
            submodules: SubmoduleGraphs {
                image_encoder: GraphRef::new(encoder),
                // The prompt encoder is exported fused into the decoder graph
                prompt_encoder: GraphRef::new(decoder.clone()),
                mask_decoder: GraphRef::new(decoder),
            },
            encoder: EncoderIo::default(),
            decoder: DecoderIo::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"
name: sam2_hiera_l
submodules:
  image_encoder:
    graph: sam2_hiera_large.encoder.onnx
  prompt_encoder:
    graph: sam2_hiera_large.decoder.onnx
  mask_decoder:
    graph: sam2_hiera_large.decoder.onnx
    sha256: "00ff"
"#;

    #[test]
    fn test_descriptor_defaults() {
        let descriptor = ModelDescriptor::from_yaml(DESCRIPTOR).unwrap();
        assert_eq!(descriptor.name, "sam2_hiera_l");
        assert_eq!(descriptor.image_size, 1024);
        assert_eq!(descriptor.mask_input_size, 256);
        assert_eq!(descriptor.encoder.outputs.len(), 3);
        assert_eq!(descriptor.decoder.embeddings, descriptor.encoder.outputs);
        assert_eq!(descriptor.submodules.mask_decoder.sha256.as_deref(), Some("00ff"));
        assert_eq!(
            descriptor.submodules.prompt_encoder.graph,
            descriptor.submodules.mask_decoder.graph
        );
    }

    #[test]
    fn test_descriptor_missing_submodule() {
        let yaml = "name: broken\nsubmodules:\n  image_encoder:\n    graph: a.onnx\n";
        assert!(matches!(ModelDescriptor::from_yaml(yaml), Err(VisionError::Config(_))));
    }

    #[test]
    fn test_descriptor_mismatched_embeddings() {
        let yaml = format!("{}decoder:\n  embeddings: [image_embed]\n", DESCRIPTOR);
        assert!(matches!(ModelDescriptor::from_yaml(&yaml), Err(VisionError::Config(_))));
    }

    #[test]
    fn test_descriptor_invalid_sizes() {
        let mut descriptor = Sam2Variant::Large.descriptor();
        descriptor.image_size = 0;
        assert!(descriptor.validate().is_err());

        let mut descriptor = Sam2Variant::Large.descriptor();
        descriptor.mask_input_size = 2048;
        assert!(descriptor.validate().is_err());

        let mut descriptor = Sam2Variant::Large.descriptor();
        descriptor.pixel_std = [0.2, 0.0, 0.2];
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_variant_lookup() {
        assert_eq!(Sam2Variant::from_config_id("sam2_hiera_l.yaml"), Some(Sam2Variant::Large));
        assert_eq!(Sam2Variant::from_config_id("sam2_hiera_b+"), Some(Sam2Variant::BasePlus));
        assert_eq!(Sam2Variant::from_config_id("sam2_hiera_t.yml"), Some(Sam2Variant::Tiny));
        assert_eq!(Sam2Variant::from_config_id("vit_h"), None);
    }

    #[test]
    fn test_variant_descriptors_validate() {
        for variant in Sam2Variant::ALL {
            let descriptor = variant.descriptor();
            assert!(descriptor.validate().is_ok());
            assert!(descriptor
                .submodules
                .image_encoder
                .graph
                .to_string_lossy()
                .starts_with(variant.file_stem()));
        }
    }
}
