//! The stage sequence of one reconstruction task.
//!
//! segmentation → geometry → texturing, each group loaded right before its
//! stage and unloaded right after, so at most one group holds the
//! accelerator. Progress moves forward through fixed checkpoints and the
//! cancellation flag is checked between stages.

use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::backends::{GenerationParams, ImageEditor, SceneMesh, SegmentPrompt};
use super::config::EngineConfig;
use super::error::{EngineError, Result, TaskFailure};
use super::model_registry::{lock_registry, ModelGroup, SharedModelRegistry};
use super::models::SegmentationInput;
use super::task_store::{SharedTaskStore, TaskStatus};

// Import logging macros
use crate::{log_debug, log_info, log_warn};

/// Flag the worker checks between stages to stop early.
pub type CancellationFlag = Arc<AtomicBool>;

pub const ARTIFACT_FILE_NAME: &str = "textured_scene.glb";

/// Where the final textured scene of `task_id` lands.
pub fn artifact_path(tmp_dir: &Path, task_id: &str) -> PathBuf {
    tmp_dir
        .join(format!("textured_{task_id}"))
        .join(ARTIFACT_FILE_NAME)
}

pub fn input_image_path(tmp_dir: &Path, task_id: &str) -> PathBuf {
    tmp_dir.join(format!("{task_id}_input.png"))
}

/// Remove every `{task_id}_*` file in `tmp_dir`: the uploaded input and
/// the intermediates. Returns how many were removed.
pub fn remove_task_files(tmp_dir: &Path, task_id: &str) -> usize {
    let prefix = format!("{task_id}_");
    let entries = match std::fs::read_dir(tmp_dir) {
        Ok(entries) => entries,
        Err(e) => {
            log_warn!("task", "[{}] Could not list {}: {}", task_id, tmp_dir.display(), e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let owned = entry.file_name().to_string_lossy().starts_with(&prefix);
        if !owned || !path.is_file() {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => log_warn!("task", "Could not remove {}: {}", path.display(), e),
        }
    }
    removed
}

/// Remove everything a task that will never complete left in `tmp_dir`,
/// including a partially written artifact.
pub fn discard_task_files(tmp_dir: &Path, task_id: &str) -> usize {
    let mut removed = remove_task_files(tmp_dir, task_id);
    if let Some(output_dir) = artifact_path(tmp_dir, task_id).parent() {
        if output_dir.exists() {
            match std::fs::remove_dir_all(output_dir) {
                Ok(()) => removed += 1,
                Err(e) => log_warn!("task", "Could not remove {}: {}", output_dir.display(), e),
            }
        }
    }
    removed
}

pub fn result_locator(task_id: &str) -> String {
    format!("/download/{task_id}")
}

/// Order corners so `x1 <= x2` and `y1 <= y2`.
pub fn normalize_box(b: [i64; 4]) -> [i64; 4] {
    [b[0].min(b[2]), b[1].min(b[3]), b[0].max(b[2]), b[1].max(b[3])]
}

/// Everything the worker needs to run one task.
pub struct TaskContext {
    pub task_id: String,
    pub image_path: PathBuf,
    pub input: SegmentationInput,
    pub polygon_refinement: bool,
    pub edit_prompt: Option<String>,
    pub cancel: CancellationFlag,
}

impl TaskContext {
    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            log_info!("task", "[{}] Cancellation requested, stopping", self.task_id);
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

/// Writes `processing` checkpoints; progress never moves backwards.
pub struct ProgressReporter {
    store: SharedTaskStore,
    task_id: String,
    last: f32,
}

impl ProgressReporter {
    pub fn new(store: SharedTaskStore, task_id: &str) -> Self {
        Self {
            store,
            task_id: task_id.to_string(),
            last: 0.0,
        }
    }

    pub fn report(&mut self, message: &str, progress: f32) {
        let progress = progress.clamp(0.0, 1.0).max(self.last);
        self.last = progress;
        self.store.set(
            &self.task_id,
            TaskStatus::Processing,
            message,
            Some(progress),
            None,
        );
        log_info!("task", "[{}] {} ({:.0}%)", self.task_id, message, progress * 100.0);
    }

    pub fn last(&self) -> f32 {
        self.last
    }
}

pub struct StagePipeline {
    config: Arc<EngineConfig>,
    registry: SharedModelRegistry,
    editor: Option<Arc<dyn ImageEditor>>,
}

impl StagePipeline {
    pub fn new(
        config: Arc<EngineConfig>,
        registry: SharedModelRegistry,
        editor: Option<Arc<dyn ImageEditor>>,
    ) -> Self {
        Self {
            config,
            registry,
            editor,
        }
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.config.tmp_dir
    }

    pub fn editing_enabled(&self) -> bool {
        self.editor.is_some()
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            seed: self.config.seed,
            num_inference_steps: self.config.num_inference_steps,
            guidance_scale: self.config.guidance_scale,
            do_image_padding: self.config.do_image_padding,
        }
    }

    /// Run every stage. Returns the result locator on success. Resident
    /// groups are left for the caller to release on failure.
    pub fn run(
        &self,
        ctx: &TaskContext,
        progress: &mut ProgressReporter,
    ) -> std::result::Result<String, TaskFailure> {
        self.run_stages(ctx, progress).map_err(TaskFailure::from)
    }

    fn run_stages(&self, ctx: &TaskContext, progress: &mut ProgressReporter) -> Result<String> {
        let tmp = &self.config.tmp_dir;
        let id = ctx.task_id.as_str();
        let seg_path = tmp.join(format!("{id}_seg.png"));
        let scene_path = tmp.join(format!("{id}_scene.glb"));
        let edited_path = tmp.join(format!("{id}_edited.png"));

        progress.report("Starting 3D reconstruction process...", 0.05);
        ctx.check_cancelled()?;

        let source = match ctx.edit_prompt.as_deref() {
            Some(prompt) => {
                self.edit_input(ctx, prompt, &edited_path, progress)?;
                edited_path
            }
            None => ctx.image_path.clone(),
        };

        // ---- segmentation ----
        ctx.check_cancelled()?;
        progress.report("Loading segmentation models...", 0.10);
        self.load(ModelGroup::Segmentation)?;

        progress.report("Loading image...", 0.15);
        let image = image::ImageReader::open(&source)?
            .with_guessed_format()?
            .decode()?
            .to_rgb8();

        let seg_map = self.segment(ctx, &image, progress)?;
        seg_map.save(&seg_path)?;

        progress.report("Cleaning up segmentation models...", 0.28);
        self.unload(ModelGroup::Segmentation);

        // ---- geometry ----
        ctx.check_cancelled()?;
        progress.report("Loading 3D generation model...", 0.30);
        self.load(ModelGroup::Geometry)?;

        ctx.check_cancelled()?;
        progress.report("Generating 3D scene...", 0.50);
        let scene = self.generate_scene(&image, &seg_map)?;
        scene.export(&scene_path)?;
        log_debug!("task", "[{}] Scene with {} objects saved", id, scene.object_count());

        progress.report("Cleaning up 3D generation model...", 0.60);
        self.unload(ModelGroup::Geometry);

        // ---- texturing ----
        ctx.check_cancelled()?;
        progress.report("Loading texture generation models...", 0.70);
        self.load(ModelGroup::Texturing)?;

        ctx.check_cancelled()?;
        progress.report("Applying textures to 3D model...", 0.80);
        let artifact = artifact_path(tmp, id);
        let output_dir = artifact
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| tmp.clone());
        std::fs::create_dir_all(&output_dir)?;
        let textured = self.apply_textures(scene.as_ref(), &image, &seg_map, &output_dir)?;
        textured.export(&artifact)?;

        progress.report("Cleaning up texture generation models...", 0.90);
        self.unload(ModelGroup::Texturing);

        progress.report("Finalizing model...", 0.95);
        let removed = remove_task_files(tmp, id);
        log_debug!("task", "[{}] Removed {} working files", id, removed);

        Ok(result_locator(id))
    }

    fn load(&self, group: ModelGroup) -> Result<()> {
        lock_registry(&self.registry).load(group)
    }

    fn unload(&self, group: ModelGroup) {
        lock_registry(&self.registry).unload(group);
    }

    fn edit_input(
        &self,
        ctx: &TaskContext,
        prompt: &str,
        output: &Path,
        progress: &mut ProgressReporter,
    ) -> Result<()> {
        let editor = self.editor.as_ref().ok_or_else(|| {
            EngineError::Validation("Image editing is not configured on this server".to_string())
        })?;
        progress.report("Editing input image...", 0.07);
        let task_id = ctx.task_id.clone();
        let mut on_progress = |percent: u32| {
            log_debug!("prompt_queue", "[{}] Edit progress {}%", task_id, percent);
        };
        editor.edit(&ctx.image_path, prompt, output, &mut on_progress)?;
        log_info!("task", "[{}] Input image edited", ctx.task_id);
        Ok(())
    }

    fn segment(
        &self,
        ctx: &TaskContext,
        image: &RgbImage,
        progress: &mut ProgressReporter,
    ) -> Result<RgbImage> {
        let mut registry = lock_registry(&self.registry);
        let models = registry.segmentation_mut().ok_or_else(|| {
            EngineError::model_load("Segmentation models are not properly loaded")
        })?;

        let prompt = match &ctx.input {
            SegmentationInput::Boxes(boxes) => {
                progress.report(&format!("Processing {} bounding boxes...", boxes.len()), 0.20);
                SegmentPrompt::Boxes(vec![boxes.iter().copied().map(normalize_box).collect()])
            }
            SegmentationInput::Labels { labels, threshold } => {
                progress.report(
                    &format!("Detecting objects with labels: {}...", labels.join(", ")),
                    0.20,
                );
                SegmentPrompt::Detections(models.detector.detect(image, labels, *threshold)?)
            }
        };

        progress.report("Running segmentation...", 0.25);
        let inputs = models.processor.prepare_inputs(image, &prompt)?;
        let detections = models.segmenter.segment(inputs, ctx.polygon_refinement)?;
        log_debug!("task", "[{}] {} regions segmented", ctx.task_id, detections.len());
        models.segmenter.render_map(image, &detections)
    }

    fn generate_scene(&self, image: &RgbImage, seg_map: &RgbImage) -> Result<Box<dyn SceneMesh>> {
        let params = self.generation_params();
        let mut registry = lock_registry(&self.registry);
        let pipeline = registry
            .geometry_mut()
            .ok_or_else(|| EngineError::model_load("3D generation model is not loaded"))?;
        pipeline.generate(image, seg_map, &params)
    }

    fn apply_textures(
        &self,
        scene: &dyn SceneMesh,
        image: &RgbImage,
        seg_map: &RgbImage,
        output_dir: &Path,
    ) -> Result<Box<dyn SceneMesh>> {
        let mut registry = lock_registry(&self.registry);
        let pipes = registry
            .texturing_mut()
            .ok_or_else(|| EngineError::model_load("Texture generation models are not loaded"))?;
        let views = pipes
            .multiview
            .generate_views(scene, image, seg_map, self.config.seed)?;
        pipes.texture.apply(scene, views, output_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::device::Accelerator;
    use crate::web::error::FailureReason;
    use crate::web::mock_backend::{remove_test_dirs, test_config, MockBackends, MockFaults};
    use crate::web::model_registry::ModelRegistry;
    use crate::web::task_store::TaskStore;
    use std::sync::Mutex;

    struct Harness {
        config: Arc<EngineConfig>,
        registry: SharedModelRegistry,
        store: SharedTaskStore,
    }

    impl Harness {
        fn new(faults: MockFaults) -> Self {
            let config = Arc::new(test_config());
            std::fs::create_dir_all(&config.tmp_dir).unwrap();
            let accelerator = Arc::new(Accelerator::cuda(config.accelerator_capacity_bytes()));
            let backends = MockBackends::new(faults).backends();
            let registry =
                ModelRegistry::new(Arc::clone(&config), accelerator, backends).into_shared();
            Self {
                config,
                registry,
                store: Arc::new(TaskStore::new()),
            }
        }

        fn context(&self, task_id: &str, input: SegmentationInput) -> TaskContext {
            let image_path = input_image_path(&self.config.tmp_dir, task_id);
            RgbImage::from_pixel(64, 48, image::Rgb([200, 180, 160]))
                .save(&image_path)
                .unwrap();
            TaskContext {
                task_id: task_id.to_string(),
                image_path,
                input,
                polygon_refinement: true,
                edit_prompt: None,
                cancel: Arc::new(AtomicBool::new(false)),
            }
        }

        fn pipeline(&self, editor: Option<Arc<dyn ImageEditor>>) -> StagePipeline {
            StagePipeline::new(Arc::clone(&self.config), Arc::clone(&self.registry), editor)
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            remove_test_dirs(&self.config);
        }
    }

    #[test]
    fn box_mode_produces_artifact_and_cleans_intermediates() {
        let h = Harness::new(MockFaults::default());
        let ctx = h.context("t1", SegmentationInput::Boxes(vec![[0, 0, 32, 48], [40, 30, 32, 10]]));
        let mut progress = ProgressReporter::new(Arc::clone(&h.store), "t1");

        let locator = h.pipeline(None).run(&ctx, &mut progress).unwrap();

        assert_eq!(locator, "/download/t1");
        assert!(artifact_path(&h.config.tmp_dir, "t1").exists());
        assert!(!h.config.tmp_dir.join("t1_seg.png").exists());
        assert!(!h.config.tmp_dir.join("t1_scene.glb").exists());
        assert!(!input_image_path(&h.config.tmp_dir, "t1").exists());
        assert_eq!(progress.last(), 0.95);

        let registry = lock_registry(&h.registry);
        assert!(registry.resident_groups().is_empty());
        assert_eq!(registry.peak_resident(), 1);
        assert!(ModelGroup::ALL.iter().all(|g| registry.was_loaded(*g)));
    }

    #[test]
    fn label_mode_without_detections_fails_in_segmentation() {
        let h = Harness::new(MockFaults::default());
        let ctx = h.context(
            "t2",
            SegmentationInput::Labels {
                labels: vec!["chair".to_string()],
                threshold: 0.99,
            },
        );
        let mut progress = ProgressReporter::new(Arc::clone(&h.store), "t2");

        let failure = h.pipeline(None).run(&ctx, &mut progress).unwrap_err();
        assert_eq!(failure.reason, FailureReason::StageCompute);
        assert_eq!(failure.message, "No objects to segment");
        assert_eq!(progress.last(), 0.25);
        assert!(!lock_registry(&h.registry).was_loaded(ModelGroup::Geometry));
    }

    #[test]
    fn cancelled_task_loads_nothing() {
        let h = Harness::new(MockFaults::default());
        let ctx = h.context("t3", SegmentationInput::Boxes(vec![[0, 0, 8, 8]]));
        ctx.cancel.store(true, Ordering::SeqCst);
        let mut progress = ProgressReporter::new(Arc::clone(&h.store), "t3");

        let failure = h.pipeline(None).run(&ctx, &mut progress).unwrap_err();
        assert_eq!(failure, TaskFailure::cancelled());
        assert!(lock_registry(&h.registry).transitions().is_empty());
    }

    struct CopyEditor {
        prompts: Mutex<Vec<String>>,
    }

    impl ImageEditor for CopyEditor {
        fn edit(
            &self,
            input: &Path,
            prompt: &str,
            output: &Path,
            on_progress: &mut dyn FnMut(u32),
        ) -> Result<()> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            on_progress(100);
            std::fs::copy(input, output)?;
            Ok(())
        }
    }

    #[test]
    fn edit_prompt_runs_editor_before_segmentation() {
        let h = Harness::new(MockFaults::default());
        let mut ctx = h.context("t4", SegmentationInput::Boxes(vec![[0, 0, 16, 16]]));
        ctx.edit_prompt = Some("make the sofa blue".to_string());
        let editor = Arc::new(CopyEditor {
            prompts: Mutex::new(Vec::new()),
        });
        let mut progress = ProgressReporter::new(Arc::clone(&h.store), "t4");

        h.pipeline(Some(editor.clone() as Arc<dyn ImageEditor>))
            .run(&ctx, &mut progress)
            .unwrap();

        assert_eq!(*editor.prompts.lock().unwrap(), vec!["make the sofa blue"]);
        assert!(!h.config.tmp_dir.join("t4_edited.png").exists());
    }

    #[test]
    fn edit_prompt_without_editor_is_rejected() {
        let h = Harness::new(MockFaults::default());
        let mut ctx = h.context("t5", SegmentationInput::Boxes(vec![[0, 0, 16, 16]]));
        ctx.edit_prompt = Some("add a lamp".to_string());
        let mut progress = ProgressReporter::new(Arc::clone(&h.store), "t5");

        let failure = h.pipeline(None).run(&ctx, &mut progress).unwrap_err();
        assert_eq!(failure.reason, FailureReason::Validation);
    }

    #[test]
    fn discarding_a_task_spares_other_tasks() {
        let h = Harness::new(MockFaults::default());
        let tmp = &h.config.tmp_dir;
        for name in ["a1_input.png", "a1_seg.png", "a10_input.png", "b2_input.png"] {
            std::fs::write(tmp.join(name), b"x").unwrap();
        }
        let partial = artifact_path(tmp, "a1");
        std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
        std::fs::write(&partial, b"glTF").unwrap();

        assert_eq!(discard_task_files(tmp, "a1"), 3);
        assert!(!tmp.join("a1_input.png").exists());
        assert!(!tmp.join("a1_seg.png").exists());
        assert!(!partial.exists());
        assert!(tmp.join("a10_input.png").exists());
        assert!(tmp.join("b2_input.png").exists());
    }

    #[test]
    fn progress_never_moves_backwards() {
        let store = Arc::new(TaskStore::new());
        let mut progress = ProgressReporter::new(Arc::clone(&store), "t6");
        progress.report("Loading 3D generation model...", 0.30);
        progress.report("Running segmentation...", 0.25);

        let record = store.get("t6").unwrap();
        assert_eq!(record.progress, Some(0.30));
        assert_eq!(record.message, "Running segmentation...");
        assert_eq!(record.status, TaskStatus::Processing);
    }

    #[test]
    fn boxes_are_normalized() {
        assert_eq!(normalize_box([110, 220, 10, 20]), [10, 20, 110, 220]);
        assert_eq!(normalize_box([1, 2, 3, 4]), [1, 2, 3, 4]);
    }

    #[test]
    fn defaults_drive_generation_params() {
        let h = Harness::new(MockFaults::default());
        let params = h.pipeline(None).generation_params();
        assert_eq!(params.seed, 42);
        assert_eq!(params.num_inference_steps, 35);
        assert_eq!(params.guidance_scale, 7.0);
        assert!(params.do_image_padding);
    }
}
