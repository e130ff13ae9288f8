//! Automatic mask generation over a regular prompt grid

use crate::config::GeneratorConfig;
use crate::error::VisionError;
use crate::models::sam::{validate_decoder_output, DecoderOutput};
use crate::models::Sam2Model;
use crate::processing::annotation::{non_max_suppression, stability_score, Annotation};
use crate::utils::upsample_bilinear;
use image::RgbImage;
use tracing::{debug, info, info_span};

/// Anything that turns an image into a set of mask annotations
#[cfg_attr(test, mockall::automock)]
pub trait MaskGenerator {
    fn generate(&self, image: &RgbImage) -> Result<Vec<Annotation>, VisionError>;

    /// Block until all submitted device work has completed
    fn synchronize(&self) -> Result<(), VisionError> {
        Ok(())
    }
}

/// Prompt the model with every point of a grid and keep the good masks
pub struct AutomaticMaskGenerator {
    model: Sam2Model,
    config: GeneratorConfig,
    /// Normalised `(x, y)` prompt locations
    grid: Vec<[f32; 2]>,
}

impl AutomaticMaskGenerator {
    pub fn new(model: Sam2Model, config: GeneratorConfig) -> Result<Self, VisionError> {
        if !model.is_configured() {
            return Err(VisionError::Config(
                "Model must be put in eval mode before building a mask generator".to_string(),
            ));
        }
        config.validate().map_err(VisionError::Config)?;

        let grid = point_grid(config.points_per_side);
        info!(
            "Mask generator ready: {} prompts in batches of {}",
            grid.len(),
            config.points_per_batch
        );
        Ok(Self { model, config, grid })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn model(&self) -> &Sam2Model {
        &self.model
    }
}

impl MaskGenerator for AutomaticMaskGenerator {
    fn generate(&self, image: &RgbImage) -> Result<Vec<Annotation>, VisionError> {
        let (width, height) = image.dimensions();
        let _span = info_span!("generate", height = height, width = width).entered();

        let embeddings = self.model.encode_image(image)?;
        collect_masks(
            &self.config,
            &self.grid,
            (height as usize, width as usize),
            |batch| self.model.decode_points(&embeddings, batch),
        )
    }
}

/// Prompt `decode` with the grid scaled to the image, batch by batch, then
/// suppress duplicates across batches and drop small masks.
pub(crate) fn collect_masks<F>(
    config: &GeneratorConfig,
    grid: &[[f32; 2]],
    (height, width): (usize, usize),
    mut decode: F,
) -> Result<Vec<Annotation>, VisionError>
where
    F: FnMut(&[[f32; 2]]) -> Result<DecoderOutput, VisionError>,
{
    let points: Vec<[f32; 2]> = grid
        .iter()
        .map(|[x, y]| [x * width as f32, y * height as f32])
        .collect();

    let mut candidates = Vec::new();
    for batch in points.chunks(config.points_per_batch) {
        let output = decode(batch)?;
        candidates.extend(masks_from_batch(config, &output, batch, (height, width))?);
    }

    let found = candidates.len();
    let mut annotations = non_max_suppression(candidates, config.box_nms_thresh);
    if config.min_mask_region_area > 0 {
        annotations.retain(|a| a.area >= config.min_mask_region_area);
    }

    debug!("Generated {} masks ({} before suppression)", annotations.len(), found);
    Ok(annotations)
}

/// `n`×`n` points at cell centres of the unit square, x varying fastest
pub fn point_grid(n: usize) -> Vec<[f32; 2]> {
    let step = 1.0 / n as f32;
    let coords: Vec<f32> = (0..n).map(|i| (i as f32 + 0.5) * step).collect();
    coords
        .iter()
        .flat_map(|&y| coords.iter().map(move |&x| [x, y]))
        .collect()
}

/// Turn one decoder batch into annotations: IoU filter, upsample to the
/// image, stability filter, binarise, drop empty masks.
pub(crate) fn masks_from_batch(
    config: &GeneratorConfig,
    output: &DecoderOutput,
    points: &[[f32; 2]],
    (height, width): (usize, usize),
) -> Result<Vec<Annotation>, VisionError> {
    validate_decoder_output(output, points.len())?;
    let shape = &output.masks.shape;
    let (candidates, mask_h, mask_w) = (shape[1], shape[2], shape[3]);
    let plane = mask_h * mask_w;

    let mut annotations = Vec::new();
    for (b, point) in points.iter().enumerate() {
        for c in 0..candidates {
            let index = b * candidates + c;
            let predicted_iou = output.iou_predictions.data[index];
            if config.pred_iou_thresh > 0.0 && predicted_iou <= config.pred_iou_thresh {
                continue;
            }

            let logits = &output.masks.data[index * plane..(index + 1) * plane];
            let upsampled = upsample_bilinear(logits, mask_h, mask_w, height, width)?;

            let stability = stability_score(
                upsampled.iter(),
                config.mask_threshold,
                config.stability_score_offset,
            );
            if config.stability_score_thresh > 0.0 && stability < config.stability_score_thresh {
                continue;
            }

            let mask = upsampled.mapv(|v| v > config.mask_threshold);
            if let Some(annotation) = Annotation::from_mask(mask, predicted_iou, stability, *point) {
                annotations.push(annotation);
            }
        }
    }
    Ok(annotations)
}
