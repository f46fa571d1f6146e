//! Collaborator seams: the inference algorithms are supplied by backends,
//! the engine only sequences, loads and tears them down.

use image::RgbImage;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use super::device::{DeviceTensor, SharedAccelerator};
use super::error::Result;
use super::reclaimer::PipelineKind;
use super::tensor::{DType, ParameterMap};
use super::weights::{SnapshotFetcher, WeightReader};

/// A named sub-model (unet, vae, ...) that can be detached from its parent.
pub trait ModelComponent: Send {
    fn clear_state(&mut self) -> std::result::Result<(), String>;

    /// Drop parameter and buffer tensors; returns accelerator bytes released.
    fn detach_parameters(&mut self) -> std::result::Result<u64, String>;
}

/// Any model object the reclaimer can tear down.
pub trait Releasable: Send {
    fn kind(&self) -> PipelineKind;

    fn offload_to_host(&mut self) -> std::result::Result<(), String>;

    /// Remove a named component from the object, leaving the slot empty.
    fn take_component(&mut self, name: &str) -> Option<Box<dyn ModelComponent>>;

    fn clear_state(&mut self) -> std::result::Result<(), String>;
}

/// Summary of a non-strict parameter merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub accepted: usize,
    pub unexpected_keys: Vec<String>,
}

/// Models that accept device tensors by name.
pub trait ParameterSink {
    fn load_parameters(&mut self, chunk: ParameterMap<DeviceTensor>) -> Result<MergeReport>;
}

// ---- segmentation ----

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub bbox: [i64; 4],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polygon: Option<Vec<[f32; 2]>>,
}

/// Prompt handed to the mask segmenter.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentPrompt {
    /// Rectangles, one outer entry per image in the batch.
    Boxes(Vec<Vec<[i64; 4]>>),
    Detections(Vec<Detection>),
}

/// Segmenter-ready inputs produced by the prompt processor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedPrompt {
    pub image_size: (u32, u32),
    pub boxes: Vec<Vec<[i64; 4]>>,
    pub labels: Vec<String>,
}

pub trait ObjectDetector: Releasable {
    fn detect(
        &mut self,
        image: &RgbImage,
        labels: &[String],
        threshold: f32,
    ) -> Result<Vec<Detection>>;
}

pub trait PromptProcessor: Releasable {
    fn prepare_inputs(
        &mut self,
        image: &RgbImage,
        prompt: &SegmentPrompt,
    ) -> Result<ProcessedPrompt>;
}

pub trait MaskSegmenter: Releasable {
    fn segment(
        &mut self,
        inputs: ProcessedPrompt,
        polygon_refinement: bool,
    ) -> Result<Vec<Detection>>;

    /// Render detections into the color-coded segmentation map.
    fn render_map(&mut self, image: &RgbImage, detections: &[Detection]) -> Result<RgbImage>;
}

/// What a segmentation backend hands back. Any handle may be missing.
#[derive(Default)]
pub struct SegmentationParts {
    pub detector: Option<Box<dyn ObjectDetector>>,
    pub processor: Option<Box<dyn PromptProcessor>>,
    pub segmenter: Option<Box<dyn MaskSegmenter>>,
}

pub struct SegmentationModels {
    pub detector: Box<dyn ObjectDetector>,
    pub processor: Box<dyn PromptProcessor>,
    pub segmenter: Box<dyn MaskSegmenter>,
}

impl SegmentationParts {
    /// All three handles, or the partial set back for teardown.
    pub fn into_complete(self) -> std::result::Result<SegmentationModels, SegmentationParts> {
        match self {
            SegmentationParts {
                detector: Some(detector),
                processor: Some(processor),
                segmenter: Some(segmenter),
            } => Ok(SegmentationModels {
                detector,
                processor,
                segmenter,
            }),
            partial => Err(partial),
        }
    }
}

pub trait SegmentationBackend: Send + Sync {
    fn prepare(
        &self,
        device: &SharedAccelerator,
        detector_id: &str,
        segmenter_id: &str,
    ) -> Result<SegmentationParts>;
}

// ---- geometry ----

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub seed: u64,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub do_image_padding: bool,
}

/// Exportable 3D scene.
pub trait SceneMesh: Send {
    fn export(&self, path: &Path) -> Result<()>;
    fn object_count(&self) -> usize;
}

pub trait GeometryPipeline: Releasable + ParameterSink {
    fn to_device(&mut self, device: &SharedAccelerator) -> Result<()>;

    fn init_custom_adapter(&mut self, self_attn_blocks: &[String]) -> Result<()>;

    /// Cast every floating parameter of the pipeline.
    fn cast(&mut self, dtype: DType) -> Result<()>;

    fn cast_component(&mut self, component: &str, dtype: DType) -> Result<()>;

    fn component_dtype(&self, component: &str) -> Option<DType>;

    fn generate(
        &mut self,
        image: &RgbImage,
        seg_map: &RgbImage,
        params: &GenerationParams,
    ) -> Result<Box<dyn SceneMesh>>;
}

pub trait GeometryBackend: Send + Sync {
    fn build_pipeline(
        &self,
        weights_dir: &Path,
        dtype: DType,
        device: &SharedAccelerator,
    ) -> Result<Box<dyn GeometryPipeline>>;
}

// ---- texturing ----

pub trait MultiviewPipeline: Releasable {
    fn generate_views(
        &mut self,
        scene: &dyn SceneMesh,
        image: &RgbImage,
        seg_map: &RgbImage,
        seed: u64,
    ) -> Result<Vec<RgbImage>>;
}

pub trait TexturePipeline: Releasable {
    fn apply(
        &mut self,
        scene: &dyn SceneMesh,
        views: Vec<RgbImage>,
        output_dir: &Path,
    ) -> Result<Box<dyn SceneMesh>>;
}

pub trait TexturingBackend: Send + Sync {
    fn prepare_multiview(
        &self,
        device: &SharedAccelerator,
        dtype: DType,
    ) -> Result<Box<dyn MultiviewPipeline>>;

    fn prepare_texture(
        &self,
        device: &SharedAccelerator,
        dtype: DType,
    ) -> Result<Box<dyn TexturePipeline>>;
}

pub struct TexturingPipelines {
    pub multiview: Box<dyn MultiviewPipeline>,
    pub texture: Box<dyn TexturePipeline>,
}

// ---- image editing ----

/// Prompt-driven edit of the input image before segmentation.
pub trait ImageEditor: Send + Sync {
    /// Edit `input` according to `prompt` and write the result to `output`.
    fn edit(
        &self,
        input: &Path,
        prompt: &str,
        output: &Path,
        on_progress: &mut dyn FnMut(u32),
    ) -> Result<()>;
}

/// Everything the engine needs from the outside world.
#[derive(Clone)]
pub struct Backends {
    pub segmentation: Arc<dyn SegmentationBackend>,
    pub geometry: Arc<dyn GeometryBackend>,
    pub texturing: Arc<dyn TexturingBackend>,
    pub snapshots: Arc<dyn SnapshotFetcher>,
    pub weights: Arc<dyn WeightReader>,
    pub editor: Option<Arc<dyn ImageEditor>>,
}
