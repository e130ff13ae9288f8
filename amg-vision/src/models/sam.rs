//! SAM2 (Segment Anything 2) model backed by exported ONNX graphs

use crate::error::{ort_error, VisionError};
use crate::models::descriptor::{ModelDescriptor, IMAGE_ENCODER, MASK_DECODER, SUBMODULES};
use crate::models::device::Device;
use crate::models::layout::{ModelLayout, SubmoduleState};
use crate::models::manager::ModelManager;
use crate::models::precision::Precision;
use crate::profiler::DEVICE_TARGET;
use crate::utils::rgb_to_chw_tensor;
use half::{bf16, f16};
use image::RgbImage;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue};
use ort::value::{DynValue, Tensor};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span};

/// A dense float tensor copied out of a session
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl HostTensor {
    fn shape_i64(&self) -> Vec<i64> {
        self.shape.iter().map(|&d| d as i64).collect()
    }
}

/// Image encoder outputs for one image, wrapped once as decoder inputs and
/// shared by every decoder batch
pub struct ImageEmbeddings {
    /// Decoder input name and value, in decoder input order
    inputs: Vec<(String, DynValue)>,
    /// Encoder output shapes
    pub shapes: Vec<Vec<usize>>,
    /// (height, width) of the encoded image
    pub original_size: (u32, u32),
}

impl ImageEmbeddings {
    /// Convert encoder outputs to the precision each decoder input expects
    fn wrap(
        names: &[String],
        tensors: Vec<HostTensor>,
        precision_of: impl Fn(&str) -> Precision,
        original_size: (u32, u32),
    ) -> Result<Self, VisionError> {
        if names.len() != tensors.len() {
            return Err(VisionError::Format(format!(
                "{} encoder outputs for {} decoder inputs",
                tensors.len(),
                names.len()
            )));
        }

        let mut shapes = Vec::with_capacity(tensors.len());
        let mut inputs = Vec::with_capacity(tensors.len());
        for (name, tensor) in names.iter().zip(tensors) {
            let dims = tensor.shape_i64();
            shapes.push(tensor.shape);
            inputs.push((name.clone(), to_value(precision_of(name), dims, tensor.data)?));
        }
        Ok(Self { inputs, shapes, original_size })
    }
}

/// Mask decoder outputs for a batch of single-point prompts
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// Mask logits, `[batch, candidates, height, width]`
    pub masks: HostTensor,
    /// Predicted IoU per candidate, `[batch, candidates]`
    pub iou_predictions: HostTensor,
}

/// A loaded ONNX graph and the element types its inputs expect
struct GraphSession {
    session: Mutex<Session>,
    input_types: HashMap<String, Precision>,
}

impl GraphSession {
    fn load(path: &Path, device: Device) -> Result<Self, VisionError> {
        let builder = Session::builder()
            .map_err(ort_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort_error)?;

        let builder = builder
            .with_execution_providers(device.execution_providers())
            .map_err(|e| VisionError::Device(format!("{} is unavailable: {}", device, e)))?;

        let session = builder.commit_from_file(path).map_err(|e| {
            let err = ort_error(e);
            match err {
                VisionError::Ort(message) => {
                    VisionError::Config(format!("Failed to load graph {:?}: {}", path, message))
                }
                other => other,
            }
        })?;

        let input_types = session
            .inputs
            .iter()
            .filter_map(|input| {
                input
                    .input_type
                    .tensor_type()
                    .and_then(Precision::from_element_type)
                    .map(|p| (input.name.clone(), p))
            })
            .collect();

        info!("Graph loaded from {:?} on {}", path, device);

        Ok(Self {
            session: Mutex::new(session),
            input_types,
        })
    }

    fn input_precision(&self, name: &str) -> Option<Precision> {
        self.input_types.get(name).copied()
    }
}

/// SAM2 model: named submodules over one or more ONNX graphs
pub struct Sam2Model {
    descriptor: ModelDescriptor,
    layout: ModelLayout,
    graphs: HashMap<PathBuf, Arc<GraphSession>>,
}

/// Build a SAM2 model from a configuration id and checkpoint directory.
///
/// The returned model still has to be prepared with
/// [`Sam2Model::apply_eval_precision`] before it can generate masks.
pub fn build_sam2(config_id: &str, checkpoint: &Path, device: &str) -> Result<Sam2Model, VisionError> {
    Sam2Model::load(&ModelManager::default(), config_id, checkpoint, device)
}

impl Sam2Model {
    /// Resolve, verify and load every graph onto `device`
    pub fn load(
        manager: &ModelManager,
        config_id: &str,
        checkpoint: &Path,
        device: &str,
    ) -> Result<Self, VisionError> {
        let device: Device = device.parse()?;
        let descriptor = manager.resolve_descriptor(config_id)?;
        let graph_paths = manager.verify_checkpoint(&descriptor, checkpoint)?;

        let mut graphs: HashMap<PathBuf, Arc<GraphSession>> = HashMap::new();
        let mut submodules = Vec::with_capacity(SUBMODULES.len());

        for name in SUBMODULES {
            let path = graph_paths[name].clone();
            let graph = match graphs.get(&path) {
                Some(graph) => graph.clone(),
                None => {
                    let graph = Arc::new(GraphSession::load(&path, device)?);
                    graphs.insert(path.clone(), graph.clone());
                    graph
                }
            };

            let primary_input = if name == IMAGE_ENCODER {
                descriptor.encoder.image.as_str()
            } else {
                descriptor.decoder.embeddings[0].as_str()
            };
            let native = graph.input_precision(primary_input).ok_or_else(|| {
                VisionError::Config(format!(
                    "{} graph {:?} has no float input named '{}'",
                    name, path, primary_input
                ))
            })?;

            submodules.push(SubmoduleState::new(name, path, native, device));
        }

        info!(
            "Built {} on {} ({} graphs for {} submodules)",
            descriptor.name,
            device,
            graphs.len(),
            submodules.len()
        );

        Ok(Self {
            descriptor,
            layout: ModelLayout::new(submodules)?,
            graphs,
        })
    }

    /// Put each submodule in eval mode and cast it to `precision`, one
    /// submodule at a time so mixed precisions remain possible.
    pub fn apply_eval_precision(mut self, precision: Option<Precision>) -> Result<Self, VisionError> {
        self.layout.apply_eval_precision(precision)?;
        Ok(self)
    }

    /// Prepare a single submodule
    pub fn prepare_submodule(&mut self, name: &str, precision: Option<Precision>) -> Result<(), VisionError> {
        self.layout.prepare(name, precision)
    }

    pub fn is_configured(&self) -> bool {
        self.layout.is_configured()
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn device(&self) -> Device {
        self.layout.device()
    }

    fn graph_for(&self, submodule: &str) -> Result<(&SubmoduleState, &GraphSession), VisionError> {
        let state = self
            .layout
            .get(submodule)
            .ok_or_else(|| VisionError::Config(format!("Model has no {}", submodule)))?;
        let graph = self
            .graphs
            .get(&state.graph)
            .ok_or_else(|| VisionError::Config(format!("No graph loaded for {}", submodule)))?;
        Ok((state, graph))
    }

    fn ensure_configured(&self) -> Result<(), VisionError> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(VisionError::Config(
                "Model must be put in eval mode before inference".to_string(),
            ))
        }
    }

    /// Run the image encoder on one RGB image
    pub fn encode_image(&self, image: &RgbImage) -> Result<ImageEmbeddings, VisionError> {
        self.ensure_configured()?;
        let (state, graph) = self.graph_for(IMAGE_ENCODER)?;
        let size = self.descriptor.image_size;
        let shape = vec![1i64, 3, size as i64, size as i64];

        let _span = info_span!(
            target: DEVICE_TARGET,
            "image_encoder",
            input_shape = ?shape,
            image_size = ?(image.height(), image.width()),
            precision = %state.effective_precision(),
            device = %state.device,
        )
        .entered();

        let data = rgb_to_chw_tensor(image, size, self.descriptor.pixel_mean, self.descriptor.pixel_std)?;
        let name = self.descriptor.encoder.image.clone();
        let precision = graph.input_precision(&name).unwrap_or(state.effective_precision());
        let inputs = vec![(name, to_value(precision, shape, data)?)];

        let tensors = {
            let mut session = graph.session.lock();
            let outputs = session.run(inputs).map_err(ort_error)?;
            let mut tensors = Vec::with_capacity(self.descriptor.encoder.outputs.len());
            for output in &self.descriptor.encoder.outputs {
                let value = outputs.get(output.as_str()).ok_or_else(|| {
                    VisionError::Format(format!("Image encoder produced no '{}' output", output))
                })?;
                tensors.push(extract_f32(value)?);
            }
            tensors
        };

        let (decoder_state, decoder) = self.graph_for(MASK_DECODER)?;
        let fallback = decoder_state.effective_precision();
        let embeddings = ImageEmbeddings::wrap(
            &self.descriptor.decoder.embeddings,
            tensors,
            |name| decoder.input_precision(name).unwrap_or(fallback),
            (image.height(), image.width()),
        )?;

        debug!("Encoded image into {} tensors", embeddings.shapes.len());
        Ok(embeddings)
    }

    /// Decode a batch of single positive point prompts.
    ///
    /// `points` are `(x, y)` in the original image frame.
    pub fn decode_points(
        &self,
        embeddings: &ImageEmbeddings,
        points: &[[f32; 2]],
    ) -> Result<DecoderOutput, VisionError> {
        self.ensure_configured()?;
        if points.is_empty() {
            return Err(VisionError::Config("No prompts provided".to_string()));
        }
        let (state, graph) = self.graph_for(MASK_DECODER)?;
        let io = &self.descriptor.decoder;
        let batch = points.len();
        let (height, width) = embeddings.original_size;
        if height == 0 || width == 0 {
            return Err(VisionError::Format("Invalid embedding source size".to_string()));
        }

        let embedding_shapes: Vec<&[usize]> = embeddings.shapes.iter().map(Vec::as_slice).collect();
        let _span = info_span!(
            target: DEVICE_TARGET,
            "mask_decoder",
            batch = batch,
            embedding_shapes = ?embedding_shapes,
            precision = %state.effective_precision(),
            device = %state.device,
        )
        .entered();

        let fallback = state.effective_precision();
        let precision_of = |name: &str| graph.input_precision(name).unwrap_or(fallback);

        // Embeddings are borrowed; only the prompts are built per batch
        let mut inputs: Vec<(String, SessionInputValue<'_>)> = embeddings
            .inputs
            .iter()
            .map(|(name, value)| (name.clone(), SessionInputValue::from(value)))
            .collect();

        // Prompts live in the encoder's square input frame
        let size = self.descriptor.image_size as f32;
        let scale_x = size / width as f32;
        let scale_y = size / height as f32;
        let coords: Vec<f32> = points
            .iter()
            .flat_map(|[x, y]| [x * scale_x, y * scale_y])
            .collect();
        inputs.push((
            io.point_coords.clone(),
            to_value(precision_of(&io.point_coords), vec![batch as i64, 1, 2], coords)?.into(),
        ));
        inputs.push((
            io.point_labels.clone(),
            to_value(precision_of(&io.point_labels), vec![batch as i64, 1], vec![1.0; batch])?.into(),
        ));

        if let Some(name) = &io.mask_input {
            let side = self.descriptor.mask_input_size as usize;
            inputs.push((
                name.clone(),
                to_value(
                    precision_of(name),
                    vec![batch as i64, 1, side as i64, side as i64],
                    vec![0.0; batch * side * side],
                )?
                .into(),
            ));
        }
        if let Some(name) = &io.has_mask_input {
            inputs.push((
                name.clone(),
                to_value(precision_of(name), vec![batch as i64], vec![0.0; batch])?.into(),
            ));
        }

        let mut session = graph.session.lock();
        let outputs = session.run(inputs).map_err(ort_error)?;

        let masks = outputs
            .get(io.masks.as_str())
            .ok_or_else(|| VisionError::Format(format!("Mask decoder produced no '{}' output", io.masks)))?;
        let iou = outputs.get(io.iou_predictions.as_str()).ok_or_else(|| {
            VisionError::Format(format!("Mask decoder produced no '{}' output", io.iou_predictions))
        })?;

        let output = DecoderOutput {
            masks: extract_f32(masks)?,
            iou_predictions: extract_f32(iou)?,
        };
        validate_decoder_output(&output, batch)?;
        Ok(output)
    }
}

/// Check decoder output shapes agree with each other and the batch
pub(crate) fn validate_decoder_output(output: &DecoderOutput, batch: usize) -> Result<(), VisionError> {
    let masks = &output.masks.shape;
    let iou = &output.iou_predictions.shape;
    if masks.len() != 4 {
        return Err(VisionError::Format(format!("Expected 4-d mask logits, got {:?}", masks)));
    }
    if masks[0] != batch {
        return Err(VisionError::Format(format!(
            "Decoder returned {} mask groups for {} prompts",
            masks[0], batch
        )));
    }
    for tensor in [&output.masks, &output.iou_predictions] {
        let expected: usize = tensor.shape.iter().product();
        if tensor.data.len() != expected {
            return Err(VisionError::Format(format!(
                "Tensor of shape {:?} holds {} values",
                tensor.shape,
                tensor.data.len()
            )));
        }
    }
    if iou.len() != 2 || iou[0] != masks[0] || iou[1] != masks[1] {
        return Err(VisionError::Format(format!(
            "IoU predictions {:?} do not match masks {:?}",
            iou, masks
        )));
    }
    Ok(())
}

/// Wrap host floats in a session input of the requested precision
fn to_value(precision: Precision, shape: Vec<i64>, data: Vec<f32>) -> Result<DynValue, VisionError> {
    let value = match precision {
        Precision::F32 => Tensor::from_array((shape, data)).map_err(ort_error)?.into_dyn(),
        Precision::F16 => {
            let data: Vec<f16> = data.into_iter().map(f16::from_f32).collect();
            Tensor::from_array((shape, data)).map_err(ort_error)?.into_dyn()
        }
        Precision::BF16 => {
            let data: Vec<bf16> = data.into_iter().map(bf16::from_f32).collect();
            Tensor::from_array((shape, data)).map_err(ort_error)?.into_dyn()
        }
    };
    Ok(value)
}

/// Copy a float output of any precision back to host `f32`
fn extract_f32(value: &DynValue) -> Result<HostTensor, VisionError> {
    if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
        return Ok(HostTensor {
            shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
            data: data.to_vec(),
        });
    }
    if let Ok((shape, data)) = value.try_extract_tensor::<f16>() {
        return Ok(HostTensor {
            shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
            data: data.iter().map(|v| v.to_f32()).collect(),
        });
    }
    let (shape, data) = value.try_extract_tensor::<bf16>().map_err(ort_error)?;
    Ok(HostTensor {
        shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
        data: data.iter().map(|v| v.to_f32()).collect(),
    })
}
