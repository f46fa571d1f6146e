//! Deterministic reference collaborators for tests and the demo server.
//!
//! Each model allocates a fixed share of the accelerator so residency
//! mistakes surface as out-of-memory errors, exactly as on real hardware.

use image::{Rgb, RgbImage};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::backends::{
    Backends, Detection, GenerationParams, GeometryBackend, GeometryPipeline, MaskSegmenter,
    MergeReport, ModelComponent, MultiviewPipeline, ObjectDetector, ParameterSink,
    ProcessedPrompt, PromptProcessor, Releasable, SceneMesh, SegmentPrompt, SegmentationBackend,
    SegmentationParts, TexturePipeline, TexturingBackend,
};
use super::config::EngineConfig;
use super::device::{Accelerator, DeviceBuffer, DeviceTensor, SharedAccelerator};
use super::error::{EngineError, Result};
use super::model_registry::ModelGroup;
use super::reclaimer::PipelineKind;
use super::tensor::{DType, ParameterMap, Tensor};
use super::weights::{write_safetensors, SafetensorsReader, SnapshotFetcher};

// Share of accelerator capacity per model, in hundredths
const DETECTOR_SHARE: u64 = 30;
const SEGMENTER_SHARE: u64 = 30;
const GEOMETRY_COMPONENT_SHARE: u64 = 15;
const ADAPTER_COMPONENT_SHARE: u64 = 15;

const GEOMETRY_WEIGHTED: &[&str] = &["unet", "vae", "text_encoder", "image_encoder"];
const GEOMETRY_STATELESS: &[&str] = &[
    "tokenizer",
    "scheduler",
    "feature_extractor",
    "safety_checker",
];
const ADAPTER_WEIGHTED: &[&str] = &["unet", "vae"];
const ADAPTER_STATELESS: &[&str] = &["text_encoder", "tokenizer", "scheduler"];

const PALETTE: [[u8; 3]; 6] = [
    [230, 25, 75],
    [60, 180, 75],
    [255, 225, 25],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
];

/// Failures to inject into the reference collaborators.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockFaults {
    pub segmenter_missing: bool,
    pub geometry_load: bool,
    pub geometry_generate: bool,
    pub geometry_panic: bool,
    pub texture_prepare: bool,
    /// First snapshot download dies after writing part of the files.
    pub snapshot_interrupted: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeometrySummary {
    pub adapter_blocks: Vec<String>,
    pub parameters_loaded: usize,
}

#[derive(Default)]
struct MockState {
    prepare_calls: Mutex<HashMap<ModelGroup, usize>>,
    snapshot_fetches: AtomicUsize,
    geometry_summary: Mutex<Option<GeometrySummary>>,
}

impl MockState {
    fn count_prepare(&self, group: ModelGroup) {
        let mut calls = self.prepare_calls.lock().unwrap_or_else(|p| p.into_inner());
        *calls.entry(group).or_insert(0) += 1;
    }
}

/// Handle onto the reference backends and their call counters.
#[derive(Clone)]
pub struct MockBackends {
    faults: MockFaults,
    state: Arc<MockState>,
}

impl MockBackends {
    pub fn new(faults: MockFaults) -> Self {
        Self {
            faults,
            state: Arc::new(MockState::default()),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            segmentation: Arc::new(MockSegmentationBackend {
                faults: self.faults,
                state: Arc::clone(&self.state),
            }),
            geometry: Arc::new(MockGeometryBackend {
                faults: self.faults,
                state: Arc::clone(&self.state),
            }),
            texturing: Arc::new(MockTexturingBackend {
                faults: self.faults,
                state: Arc::clone(&self.state),
            }),
            snapshots: Arc::new(MockSnapshotFetcher {
                faults: self.faults,
                state: Arc::clone(&self.state),
            }),
            weights: Arc::new(SafetensorsReader),
            editor: None,
        }
    }

    pub fn prepare_calls(&self, group: ModelGroup) -> usize {
        let calls = self.state.prepare_calls.lock().unwrap_or_else(|p| p.into_inner());
        calls.get(&group).copied().unwrap_or(0)
    }

    pub fn snapshot_fetches(&self) -> usize {
        self.state.snapshot_fetches.load(Ordering::SeqCst)
    }

    pub fn last_geometry_summary(&self) -> Option<GeometrySummary> {
        self.state
            .geometry_summary
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Config rooted in a fresh temp directory with a 1 GB accelerator and no
/// cleanup pauses.
pub fn test_config() -> EngineConfig {
    let root = std::env::temp_dir().join(format!("scene_forge_{}", uuid::Uuid::new_v4()));
    EngineConfig {
        tmp_dir: root.join("tmp"),
        weights_dir: root.join("weights"),
        accelerator_capacity_gb: 1.0,
        cleanup_pause_ms: 0,
        disable_file_logging: true,
        ..EngineConfig::default()
    }
}

/// Remove the temp root created by `test_config`.
pub fn remove_test_dirs(config: &EngineConfig) {
    if let Some(root) = config.tmp_dir.parent() {
        let _ = std::fs::remove_dir_all(root);
    }
}

fn share(device: &Accelerator, hundredths: u64) -> u64 {
    device.memory_stats().capacity_bytes / 100 * hundredths
}

fn allocate_share(device: &Accelerator, hundredths: u64) -> Result<Option<DeviceBuffer>> {
    let bytes = share(device, hundredths);
    if bytes == 0 {
        return Ok(None);
    }
    device.allocate(bytes).map(Some)
}

// ---- components ----

struct MockComponent {
    device: SharedAccelerator,
    elements: u64,
    dtype: DType,
    buffer: Option<DeviceBuffer>,
    attributes: HashMap<String, String>,
}

impl MockComponent {
    fn weighted(device: &SharedAccelerator, bytes: u64, dtype: DType) -> Result<Self> {
        let elements = bytes / dtype.size_bytes() as u64;
        let buffer = if elements > 0 {
            Some(device.allocate(elements * dtype.size_bytes() as u64)?)
        } else {
            None
        };
        Ok(Self {
            device: Arc::clone(device),
            elements,
            dtype,
            buffer,
            attributes: HashMap::from([("config".to_string(), "loaded".to_string())]),
        })
    }

    fn stateless(device: &SharedAccelerator) -> Self {
        Self {
            device: Arc::clone(device),
            elements: 0,
            dtype: DType::F32,
            buffer: None,
            attributes: HashMap::new(),
        }
    }

    fn cast(&mut self, dtype: DType) -> Result<()> {
        if self.dtype == dtype {
            return Ok(());
        }
        self.dtype = dtype;
        if self.buffer.take().is_some() {
            self.buffer = Some(self.device.allocate(self.elements * dtype.size_bytes() as u64)?);
        }
        Ok(())
    }
}

impl ModelComponent for MockComponent {
    fn clear_state(&mut self) -> std::result::Result<(), String> {
        self.attributes.clear();
        Ok(())
    }

    fn detach_parameters(&mut self) -> std::result::Result<u64, String> {
        Ok(self.buffer.take().map(|b| b.bytes()).unwrap_or(0))
    }
}

type Components = HashMap<String, MockComponent>;

fn build_components(
    device: &SharedAccelerator,
    weighted: &[&str],
    stateless: &[&str],
    component_share: u64,
    dtype: DType,
) -> Result<Components> {
    let mut components = HashMap::new();
    for name in weighted {
        let bytes = share(device, component_share);
        components.insert(name.to_string(), MockComponent::weighted(device, bytes, dtype)?);
    }
    for name in stateless {
        components.insert(name.to_string(), MockComponent::stateless(device));
    }
    Ok(components)
}

fn take_boxed(components: &mut Components, name: &str) -> Option<Box<dyn ModelComponent>> {
    components
        .remove(name)
        .map(|c| Box::new(c) as Box<dyn ModelComponent>)
}

// ---- segmentation ----

struct MockSegmentationBackend {
    faults: MockFaults,
    state: Arc<MockState>,
}

impl SegmentationBackend for MockSegmentationBackend {
    fn prepare(
        &self,
        device: &SharedAccelerator,
        _detector_id: &str,
        _segmenter_id: &str,
    ) -> Result<SegmentationParts> {
        self.state.count_prepare(ModelGroup::Segmentation);

        let detector = MockDetector {
            buffer: allocate_share(device, DETECTOR_SHARE)?,
        };
        let segmenter = if self.faults.segmenter_missing {
            None
        } else {
            Some(Box::new(MockSegmenter {
                buffer: allocate_share(device, SEGMENTER_SHARE)?,
            }) as Box<dyn MaskSegmenter>)
        };

        Ok(SegmentationParts {
            detector: Some(Box::new(detector)),
            processor: Some(Box::new(MockProcessor { ready: true })),
            segmenter,
        })
    }
}

struct MockDetector {
    buffer: Option<DeviceBuffer>,
}

impl Releasable for MockDetector {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Segmentation
    }

    fn offload_to_host(&mut self) -> std::result::Result<(), String> {
        Ok(())
    }

    fn take_component(&mut self, _name: &str) -> Option<Box<dyn ModelComponent>> {
        None
    }

    fn clear_state(&mut self) -> std::result::Result<(), String> {
        self.buffer = None;
        Ok(())
    }
}

impl ObjectDetector for MockDetector {
    /// One detection per label, in equal vertical strips of the image.
    fn detect(
        &mut self,
        image: &RgbImage,
        labels: &[String],
        threshold: f32,
    ) -> Result<Vec<Detection>> {
        const SCORE: f32 = 0.9;
        if SCORE < threshold {
            return Ok(Vec::new());
        }
        let (width, height) = image.dimensions();
        let strip = (width as usize / labels.len().max(1)).max(1) as i64;
        Ok(labels
            .iter()
            .enumerate()
            .map(|(i, label)| Detection {
                label: label.clone(),
                score: SCORE,
                bbox: [strip * i as i64, 0, strip * (i as i64 + 1), height as i64],
                polygon: None,
            })
            .collect())
    }
}

struct MockProcessor {
    ready: bool,
}

impl Releasable for MockProcessor {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Segmentation
    }

    fn offload_to_host(&mut self) -> std::result::Result<(), String> {
        Ok(())
    }

    fn take_component(&mut self, _name: &str) -> Option<Box<dyn ModelComponent>> {
        None
    }

    fn clear_state(&mut self) -> std::result::Result<(), String> {
        self.ready = false;
        Ok(())
    }
}

impl PromptProcessor for MockProcessor {
    fn prepare_inputs(
        &mut self,
        image: &RgbImage,
        prompt: &SegmentPrompt,
    ) -> Result<ProcessedPrompt> {
        if !self.ready {
            return Err(EngineError::stage("processor has been released"));
        }
        let (boxes, labels) = match prompt {
            SegmentPrompt::Boxes(batches) => {
                let count = batches.iter().map(|b| b.len()).sum::<usize>();
                let labels = (0..count).map(|i| format!("object_{i}")).collect();
                (batches.clone(), labels)
            }
            SegmentPrompt::Detections(detections) => (
                vec![detections.iter().map(|d| d.bbox).collect()],
                detections.iter().map(|d| d.label.clone()).collect(),
            ),
        };
        if boxes.iter().all(|b: &Vec<[i64; 4]>| b.is_empty()) {
            return Err(EngineError::stage("No objects to segment"));
        }
        Ok(ProcessedPrompt {
            image_size: image.dimensions(),
            boxes,
            labels,
        })
    }
}

struct MockSegmenter {
    buffer: Option<DeviceBuffer>,
}

impl Releasable for MockSegmenter {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Segmentation
    }

    fn offload_to_host(&mut self) -> std::result::Result<(), String> {
        Ok(())
    }

    fn take_component(&mut self, _name: &str) -> Option<Box<dyn ModelComponent>> {
        None
    }

    fn clear_state(&mut self) -> std::result::Result<(), String> {
        self.buffer = None;
        Ok(())
    }
}

impl MaskSegmenter for MockSegmenter {
    fn segment(
        &mut self,
        inputs: ProcessedPrompt,
        polygon_refinement: bool,
    ) -> Result<Vec<Detection>> {
        let (width, height) = inputs.image_size;
        let clamp = |v: i64, max: u32| v.clamp(0, max as i64);
        let boxes = inputs.boxes.into_iter().flatten();
        Ok(boxes
            .zip(inputs.labels)
            .map(|(b, label)| {
                let bbox = [
                    clamp(b[0], width),
                    clamp(b[1], height),
                    clamp(b[2], width),
                    clamp(b[3], height),
                ];
                let polygon = polygon_refinement.then(|| {
                    vec![
                        [bbox[0] as f32, bbox[1] as f32],
                        [bbox[2] as f32, bbox[1] as f32],
                        [bbox[2] as f32, bbox[3] as f32],
                        [bbox[0] as f32, bbox[3] as f32],
                    ]
                });
                Detection {
                    label,
                    score: 1.0,
                    bbox,
                    polygon,
                }
            })
            .collect())
    }

    fn render_map(&mut self, image: &RgbImage, detections: &[Detection]) -> Result<RgbImage> {
        let (width, height) = image.dimensions();
        let mut map = RgbImage::new(width, height);
        for (i, detection) in detections.iter().enumerate() {
            let color = Rgb(PALETTE[i % PALETTE.len()]);
            let [x1, y1, x2, y2] = detection.bbox;
            for y in y1.max(0)..y2.min(height as i64) {
                for x in x1.max(0)..x2.min(width as i64) {
                    map.put_pixel(x as u32, y as u32, color);
                }
            }
        }
        Ok(map)
    }
}

// ---- geometry ----

struct MockGeometryBackend {
    faults: MockFaults,
    state: Arc<MockState>,
}

impl GeometryBackend for MockGeometryBackend {
    fn build_pipeline(
        &self,
        weights_dir: &Path,
        dtype: DType,
        device: &SharedAccelerator,
    ) -> Result<Box<dyn GeometryPipeline>> {
        self.state.count_prepare(ModelGroup::Geometry);
        if !weights_dir.join("model_index.json").exists() {
            return Err(EngineError::model_load(format!(
                "no pipeline description in {}",
                weights_dir.display()
            )));
        }
        let components = build_components(
            device,
            GEOMETRY_WEIGHTED,
            GEOMETRY_STATELESS,
            GEOMETRY_COMPONENT_SHARE,
            dtype,
        )?;
        Ok(Box::new(MockGeometryPipeline {
            device: Arc::clone(device),
            faults: self.faults,
            state: Arc::clone(&self.state),
            components,
            parameters: ParameterMap::new(),
            host_parameters: ParameterMap::new(),
            adapter_blocks: Vec::new(),
        }))
    }
}

struct MockGeometryPipeline {
    device: SharedAccelerator,
    faults: MockFaults,
    state: Arc<MockState>,
    components: Components,
    parameters: ParameterMap<DeviceTensor>,
    host_parameters: ParameterMap<Tensor>,
    adapter_blocks: Vec<String>,
}

impl Releasable for MockGeometryPipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Diffusion
    }

    fn offload_to_host(&mut self) -> std::result::Result<(), String> {
        let parameters = std::mem::take(&mut self.parameters);
        self.host_parameters = parameters
            .into_iter()
            .map(|(name, t)| (name, t.into_host()))
            .collect();
        Ok(())
    }

    fn take_component(&mut self, name: &str) -> Option<Box<dyn ModelComponent>> {
        take_boxed(&mut self.components, name)
    }

    fn clear_state(&mut self) -> std::result::Result<(), String> {
        self.parameters = ParameterMap::new();
        self.host_parameters = ParameterMap::new();
        self.adapter_blocks.clear();
        Ok(())
    }
}

impl ParameterSink for MockGeometryPipeline {
    fn load_parameters(&mut self, chunk: ParameterMap<DeviceTensor>) -> Result<MergeReport> {
        let mut report = MergeReport::default();
        for (name, tensor) in chunk {
            let owner = name.split('.').next().unwrap_or_default();
            if self.components.contains_key(owner) {
                self.parameters.insert(name, tensor);
                report.accepted += 1;
            } else {
                report.unexpected_keys.push(name);
            }
        }
        Ok(report)
    }
}

impl MockGeometryPipeline {
    fn cast_parameters(&mut self, prefix: Option<&str>, dtype: DType) -> Result<()> {
        let parameters = std::mem::take(&mut self.parameters);
        for (name, tensor) in parameters {
            let matches = prefix.map_or(true, |p| name.split('.').next() == Some(p));
            let tensor = if matches {
                tensor.cast(&self.device, dtype)?
            } else {
                tensor
            };
            self.parameters.insert(name, tensor);
        }
        Ok(())
    }
}

impl GeometryPipeline for MockGeometryPipeline {
    fn to_device(&mut self, _device: &SharedAccelerator) -> Result<()> {
        if self.faults.geometry_load {
            return Err(EngineError::model_load("device placement failed"));
        }
        Ok(())
    }

    fn init_custom_adapter(&mut self, self_attn_blocks: &[String]) -> Result<()> {
        self.adapter_blocks = self_attn_blocks.to_vec();
        let summary = GeometrySummary {
            adapter_blocks: self.adapter_blocks.clone(),
            parameters_loaded: self.parameters.len(),
        };
        *self
            .state
            .geometry_summary
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(summary);
        Ok(())
    }

    fn cast(&mut self, dtype: DType) -> Result<()> {
        for component in self.components.values_mut() {
            component.cast(dtype)?;
        }
        self.cast_parameters(None, dtype)
    }

    fn cast_component(&mut self, component: &str, dtype: DType) -> Result<()> {
        let target = self
            .components
            .get_mut(component)
            .ok_or_else(|| EngineError::model_load(format!("no component named {component}")))?;
        target.cast(dtype)?;
        self.cast_parameters(Some(component), dtype)
    }

    fn component_dtype(&self, component: &str) -> Option<DType> {
        self.components.get(component).map(|c| c.dtype)
    }

    fn generate(
        &mut self,
        _image: &RgbImage,
        seg_map: &RgbImage,
        params: &GenerationParams,
    ) -> Result<Box<dyn SceneMesh>> {
        if self.faults.geometry_panic {
            panic!("denoising kernel crashed");
        }
        if self.faults.geometry_generate {
            return Err(EngineError::stage("CUDA out of memory during denoising"));
        }
        let colors: HashSet<[u8; 3]> = seg_map
            .pixels()
            .map(|p| p.0)
            .filter(|c| *c != [0, 0, 0])
            .collect();
        Ok(Box::new(MockScene {
            objects: colors.len(),
            textured: false,
            seed: params.seed,
        }))
    }
}

// ---- texturing ----

struct MockTexturingBackend {
    faults: MockFaults,
    state: Arc<MockState>,
}

impl TexturingBackend for MockTexturingBackend {
    fn prepare_multiview(
        &self,
        device: &SharedAccelerator,
        dtype: DType,
    ) -> Result<Box<dyn MultiviewPipeline>> {
        self.state.count_prepare(ModelGroup::Texturing);
        let components = build_components(
            device,
            ADAPTER_WEIGHTED,
            ADAPTER_STATELESS,
            ADAPTER_COMPONENT_SHARE,
            dtype,
        )?;
        Ok(Box::new(MockAdapterPipeline { components }))
    }

    fn prepare_texture(
        &self,
        device: &SharedAccelerator,
        dtype: DType,
    ) -> Result<Box<dyn TexturePipeline>> {
        if self.faults.texture_prepare {
            return Err(EngineError::model_load("texture weights are corrupt"));
        }
        let components = build_components(
            device,
            ADAPTER_WEIGHTED,
            ADAPTER_STATELESS,
            ADAPTER_COMPONENT_SHARE,
            dtype,
        )?;
        Ok(Box::new(MockAdapterPipeline { components }))
    }
}

struct MockAdapterPipeline {
    components: Components,
}

impl Releasable for MockAdapterPipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Adapter
    }

    fn offload_to_host(&mut self) -> std::result::Result<(), String> {
        Ok(())
    }

    fn take_component(&mut self, name: &str) -> Option<Box<dyn ModelComponent>> {
        take_boxed(&mut self.components, name)
    }

    fn clear_state(&mut self) -> std::result::Result<(), String> {
        self.components.clear();
        Ok(())
    }
}

impl MultiviewPipeline for MockAdapterPipeline {
    fn generate_views(
        &mut self,
        _scene: &dyn SceneMesh,
        image: &RgbImage,
        _seg_map: &RgbImage,
        _seed: u64,
    ) -> Result<Vec<RgbImage>> {
        let view = image::imageops::thumbnail(image, 64, 64);
        Ok(vec![view; 6])
    }
}

impl TexturePipeline for MockAdapterPipeline {
    fn apply(
        &mut self,
        scene: &dyn SceneMesh,
        views: Vec<RgbImage>,
        output_dir: &Path,
    ) -> Result<Box<dyn SceneMesh>> {
        if let Some(first) = views.first() {
            first.save(output_dir.join("texture.png"))?;
        }
        Ok(Box::new(MockScene {
            objects: scene.object_count(),
            textured: !views.is_empty(),
            seed: 0,
        }))
    }
}

// ---- scene + snapshot ----

struct MockScene {
    objects: usize,
    textured: bool,
    seed: u64,
}

/// Minimal binary glTF container holding only a JSON chunk.
fn glb_bytes(json: &str) -> Vec<u8> {
    let mut chunk = json.as_bytes().to_vec();
    while chunk.len() % 4 != 0 {
        chunk.push(b' ');
    }
    let total = 12 + 8 + chunk.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(b"glTF");
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
    out.extend_from_slice(b"JSON");
    out.extend_from_slice(&chunk);
    out
}

impl SceneMesh for MockScene {
    fn export(&self, path: &Path) -> Result<()> {
        let nodes: Vec<serde_json::Value> = (0..self.objects)
            .map(|i| serde_json::json!({ "name": format!("object_{i}") }))
            .collect();
        let json = serde_json::json!({
            "asset": { "version": "2.0", "generator": "scene_forge" },
            "scene": 0,
            "scenes": [{ "nodes": (0..self.objects).collect::<Vec<_>>() }],
            "nodes": nodes,
            "extras": { "textured": self.textured, "seed": self.seed },
        });
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, glb_bytes(&json.to_string()))?;
        Ok(())
    }

    fn object_count(&self) -> usize {
        self.objects
    }
}

struct MockSnapshotFetcher {
    faults: MockFaults,
    state: Arc<MockState>,
}

impl SnapshotFetcher for MockSnapshotFetcher {
    fn fetch(&self, _repo_id: &str, local_dir: &Path) -> Result<()> {
        let attempt = self.state.snapshot_fetches.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(local_dir)?;
        std::fs::write(local_dir.join("model_index.json"), r#"{"_class_name": "MIDIPipeline"}"#)?;
        if self.faults.snapshot_interrupted && attempt == 0 {
            return Err(EngineError::external("connection reset"));
        }

        let unet: ParameterMap = [
            ("unet.conv_in.weight".to_string(), Tensor::zeros(vec![16, 16], DType::F32)),
            (
                "unet.time_embedding.linear_1.weight".to_string(),
                Tensor::zeros(vec![32, 8], DType::F32),
            ),
            ("unet.position_ids".to_string(), Tensor::zeros(vec![8], DType::I64)),
        ]
        .into_iter()
        .collect();
        let unet_path = local_dir.join("unet").join("diffusion_pytorch_model.safetensors");
        write_safetensors(&unet, &unet_path)?;

        let vae: ParameterMap = [
            ("vae.decoder.conv_out.weight".to_string(), Tensor::zeros(vec![8, 8], DType::F32)),
            ("lora.extra.weight".to_string(), Tensor::zeros(vec![4], DType::F32)),
        ]
        .into_iter()
        .collect();
        let vae_path = local_dir.join("vae").join("diffusion_pytorch_model.safetensors");
        write_safetensors(&vae, &vae_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glb_container_is_aligned() {
        let bytes = glb_bytes("{}");
        assert_eq!(&bytes[0..4], b"glTF");
        assert_eq!(bytes.len() % 4, 0);
        let total = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(total as usize, bytes.len());
    }

    #[test]
    fn detector_respects_threshold() {
        let mut detector = MockDetector { buffer: None };
        let image = RgbImage::new(90, 30);
        let labels = vec!["chair".to_string(), "table".to_string()];

        let found = detector.detect(&image, &labels, 0.3).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].bbox, [45, 0, 90, 30]);
        assert!(detector.detect(&image, &labels, 0.95).unwrap().is_empty());
    }

    #[test]
    fn segmentation_map_colors_each_region() {
        let mut segmenter = MockSegmenter { buffer: None };
        let image = RgbImage::new(20, 20);
        let inputs = ProcessedPrompt {
            image_size: (20, 20),
            boxes: vec![vec![[0, 0, 10, 10], [10, 10, 40, 40]]],
            labels: vec!["a".into(), "b".into()],
        };
        let detections = segmenter.segment(inputs, true).unwrap();
        assert_eq!(detections[1].bbox, [10, 10, 20, 20]);
        assert!(detections[0].polygon.is_some());

        let map = segmenter.render_map(&image, &detections).unwrap();
        assert_eq!(map.get_pixel(5, 5).0, PALETTE[0]);
        assert_eq!(map.get_pixel(15, 15).0, PALETTE[1]);
        assert_eq!(map.get_pixel(15, 5).0, [0, 0, 0]);
    }
}
