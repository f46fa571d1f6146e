use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use super::backends::{
    Backends, GeometryPipeline, SegmentationModels, SegmentationParts, TexturingPipelines,
};
use super::chunked_loader::ChunkedWeightLoader;
use super::config::EngineConfig;
use super::device::SharedAccelerator;
use super::error::{EngineError, Result};
use super::reclaimer::Reclaimer;
use super::weights::{discover_weight_files, fetch_snapshot};

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelGroup {
    Segmentation,
    Geometry,
    Texturing,
}

impl ModelGroup {
    pub const ALL: [ModelGroup; 3] = [
        ModelGroup::Segmentation,
        ModelGroup::Geometry,
        ModelGroup::Texturing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelGroup::Segmentation => "segmentation",
            ModelGroup::Geometry => "geometry",
            ModelGroup::Texturing => "texturing",
        }
    }
}

impl std::fmt::Display for ModelGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slot state for one model group.
pub enum GroupState<H> {
    Absent,
    Loading,
    Resident(H),
}

impl<H> GroupState<H> {
    pub fn is_resident(&self) -> bool {
        matches!(self, GroupState::Resident(_))
    }

    fn label(&self) -> &'static str {
        match self {
            GroupState::Absent => "absent",
            GroupState::Loading => "loading",
            GroupState::Resident(_) => "resident",
        }
    }

    fn take(&mut self) -> Option<H> {
        match std::mem::replace(self, GroupState::Absent) {
            GroupState::Resident(h) => Some(h),
            _ => None,
        }
    }

    fn get_mut(&mut self) -> Option<&mut H> {
        match self {
            GroupState::Resident(h) => Some(h),
            _ => None,
        }
    }
}

/// Number of recent transitions kept for inspection.
pub const TRANSITION_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub group: ModelGroup,
    pub resident: bool,
    pub resident_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group: ModelGroup,
    pub state: &'static str,
}

/// Owns the three model groups and their load/unload lifecycle.
pub struct ModelRegistry {
    config: Arc<EngineConfig>,
    accelerator: SharedAccelerator,
    backends: Backends,
    loader: ChunkedWeightLoader,
    reclaimer: Reclaimer,
    segmentation: GroupState<SegmentationModels>,
    geometry: GroupState<Box<dyn GeometryPipeline>>,
    texturing: GroupState<TexturingPipelines>,
    snapshot_checked: bool,
    transitions: VecDeque<Transition>,
    ever_loaded: HashSet<ModelGroup>,
    peak_resident: usize,
}

pub type SharedModelRegistry = Arc<Mutex<ModelRegistry>>;

/// Lock the registry, recovering from a poisoned mutex.
pub fn lock_registry(registry: &SharedModelRegistry) -> MutexGuard<'_, ModelRegistry> {
    registry.lock().unwrap_or_else(|poisoned| {
        log_warn!("registry", "Registry mutex was poisoned, recovering...");
        poisoned.into_inner()
    })
}

/// Lock without waiting; `None` while a worker holds the registry.
pub fn try_lock_registry(registry: &SharedModelRegistry) -> Option<MutexGuard<'_, ModelRegistry>> {
    match registry.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

impl ModelRegistry {
    pub fn new(
        config: Arc<EngineConfig>,
        accelerator: SharedAccelerator,
        backends: Backends,
    ) -> Self {
        let loader = ChunkedWeightLoader::new(config.chunk_size_mb);
        let reclaimer = Reclaimer::new(Arc::clone(&accelerator), config.cleanup_pause());
        Self {
            config,
            accelerator,
            backends,
            loader,
            reclaimer,
            segmentation: GroupState::Absent,
            geometry: GroupState::Absent,
            texturing: GroupState::Absent,
            snapshot_checked: false,
            transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
            ever_loaded: HashSet::new(),
            peak_resident: 0,
        }
    }

    pub fn into_shared(self) -> SharedModelRegistry {
        Arc::new(Mutex::new(self))
    }

    pub fn is_resident(&self, group: ModelGroup) -> bool {
        match group {
            ModelGroup::Segmentation => self.segmentation.is_resident(),
            ModelGroup::Geometry => self.geometry.is_resident(),
            ModelGroup::Texturing => self.texturing.is_resident(),
        }
    }

    pub fn resident_groups(&self) -> Vec<ModelGroup> {
        ModelGroup::ALL
            .into_iter()
            .filter(|g| self.is_resident(*g))
            .collect()
    }

    pub fn peak_resident(&self) -> usize {
        self.peak_resident
    }

    /// The most recent transitions, oldest first.
    pub fn transitions(&self) -> &VecDeque<Transition> {
        &self.transitions
    }

    /// True if `group` was ever made resident.
    pub fn was_loaded(&self, group: ModelGroup) -> bool {
        self.ever_loaded.contains(&group)
    }

    pub fn status(&self) -> Vec<GroupStatus> {
        vec![
            GroupStatus {
                group: ModelGroup::Segmentation,
                state: self.segmentation.label(),
            },
            GroupStatus {
                group: ModelGroup::Geometry,
                state: self.geometry.label(),
            },
            GroupStatus {
                group: ModelGroup::Texturing,
                state: self.texturing.label(),
            },
        ]
    }

    pub fn accelerator(&self) -> &SharedAccelerator {
        &self.accelerator
    }

    pub fn segmentation_mut(&mut self) -> Option<&mut SegmentationModels> {
        self.segmentation.get_mut()
    }

    pub fn geometry_mut(&mut self) -> Option<&mut Box<dyn GeometryPipeline>> {
        self.geometry.get_mut()
    }

    pub fn texturing_mut(&mut self) -> Option<&mut TexturingPipelines> {
        self.texturing.get_mut()
    }

    fn record(&mut self, group: ModelGroup, resident: bool) {
        let resident_count = self.resident_groups().len();
        self.peak_resident = self.peak_resident.max(resident_count);
        if resident {
            self.ever_loaded.insert(group);
        }
        if self.transitions.len() == TRANSITION_HISTORY {
            self.transitions.pop_front();
        }
        self.transitions.push_back(Transition {
            group,
            resident,
            resident_count,
        });
    }

    fn log_memory(&self, context: &str) {
        let stats = self.accelerator.memory_stats();
        log_debug!(
            "registry",
            "{}: allocated {:.2} GB, reserved {:.2} GB",
            context,
            stats.allocated_gb(),
            stats.reserved_gb()
        );
    }

    /// Make `group` resident. A no-op when it already is.
    pub fn load(&mut self, group: ModelGroup) -> Result<()> {
        if self.is_resident(group) {
            log_debug!("registry", "{} already resident", group);
            return Ok(());
        }

        log_info!("registry", "Loading {} models...", group);
        self.log_memory(&format!("Before loading {group}"));

        let result = match group {
            ModelGroup::Segmentation => self.load_segmentation(),
            ModelGroup::Geometry => self.load_geometry(),
            ModelGroup::Texturing => self.load_texturing(),
        };

        match &result {
            Ok(()) => {
                self.record(group, true);
                self.log_memory(&format!("After loading {group}"));
                log_info!("registry", "{} models loaded successfully", group);
            }
            Err(e) => log_warn!("registry", "Failed to load {} models: {}", group, e),
        }
        result
    }

    fn load_segmentation(&mut self) -> Result<()> {
        self.segmentation = GroupState::Loading;

        let parts = match self.backends.segmentation.prepare(
            &self.accelerator,
            &self.config.detector_id,
            &self.config.segmenter_id,
        ) {
            Ok(parts) => parts,
            Err(e) => {
                self.segmentation = GroupState::Absent;
                self.reclaimer.aggressive_cleanup();
                return Err(EngineError::model_load(format!("segmentation: {e}")));
            }
        };

        match parts.into_complete() {
            Ok(models) => {
                self.segmentation = GroupState::Resident(models);
                Ok(())
            }
            Err(partial) => {
                self.segmentation = GroupState::Absent;
                reclaim_partial_segmentation(&self.reclaimer, partial);
                self.reclaimer.aggressive_cleanup();
                Err(EngineError::model_load(
                    "One or more segmentation models failed to load",
                ))
            }
        }
    }

    fn load_geometry(&mut self) -> Result<()> {
        self.geometry = GroupState::Loading;

        if !self.snapshot_checked {
            if !self.config.weights_dir.exists() {
                log_info!("registry", "Local weights missing, fetching {}", self.config.repo_id);
                let fetcher = self.backends.snapshots.as_ref();
                let dest = &self.config.weights_dir;
                if let Err(e) = fetch_snapshot(fetcher, &self.config.repo_id, dest) {
                    self.geometry = GroupState::Absent;
                    return Err(EngineError::model_load(format!("snapshot download: {e}")));
                }
            }
            self.snapshot_checked = true;
        }

        let mut pipeline = match self.backends.geometry.build_pipeline(
            &self.config.weights_dir,
            self.config.dtype,
            &self.accelerator,
        ) {
            Ok(p) => p,
            Err(e) => {
                self.geometry = GroupState::Absent;
                self.reclaimer.aggressive_cleanup();
                return Err(EngineError::model_load(format!("geometry pipeline: {e}")));
            }
        };

        match self.populate_geometry(pipeline.as_mut()) {
            Ok(()) => {
                self.geometry = GroupState::Resident(pipeline);
                Ok(())
            }
            Err(e) => {
                self.geometry = GroupState::Absent;
                self.reclaimer.reclaim(pipeline.as_mut());
                drop(pipeline);
                self.reclaimer.aggressive_cleanup();
                Err(match e {
                    EngineError::ModelLoad(_) => e,
                    other => EngineError::model_load(other),
                })
            }
        }
    }

    /// Device placement, precision pinning, weights and adapter setup.
    fn populate_geometry(&self, pipeline: &mut dyn GeometryPipeline) -> Result<()> {
        let config = &self.config;
        pipeline.to_device(&self.accelerator)?;
        pipeline.cast_component(&config.pinned_component, config.pinned_dtype)?;

        for file in discover_weight_files(&config.weights_dir)? {
            self.load_weight_file(&mut *pipeline, &file)?;
        }

        pipeline.init_custom_adapter(&config.adapter_blocks)?;
        pipeline.cast(config.dtype)?;
        pipeline.cast_component(&config.pinned_component, config.pinned_dtype)?;
        log_info!(
            "registry",
            "Geometry pipeline in {} with {} pinned to {}",
            config.dtype,
            config.pinned_component,
            config.pinned_dtype
        );
        Ok(())
    }

    fn load_weight_file(&self, pipeline: &mut dyn GeometryPipeline, file: &Path) -> Result<()> {
        let reader = self.backends.weights.as_ref();
        let dtype = self.config.dtype;
        match self.loader.load(&mut *pipeline, file, reader, &self.accelerator, dtype) {
            Ok(report) => {
                if !report.unexpected_keys.is_empty() {
                    log_debug!(
                        "loader",
                        "{} unexpected keys in {}",
                        report.unexpected_keys.len(),
                        file.display()
                    );
                }
                Ok(())
            }
            Err(e) => {
                log_warn!(
                    "loader",
                    "Chunked loading of {} failed ({}), falling back to standard loading",
                    file.display(),
                    e
                );
                self.loader
                    .load_unchunked(&mut *pipeline, file, reader, &self.accelerator, dtype)
                    .map(|_| ())
                    .map_err(|e| EngineError::model_load(format!("{}: {e}", file.display())))
            }
        }
    }

    fn load_texturing(&mut self) -> Result<()> {
        self.texturing = GroupState::Loading;
        let texturing = Arc::clone(&self.backends.texturing);

        let dtype = self.config.dtype;
        let mut multiview = match texturing.prepare_multiview(&self.accelerator, dtype) {
            Ok(p) => p,
            Err(e) => {
                self.texturing = GroupState::Absent;
                self.reclaimer.aggressive_cleanup();
                return Err(EngineError::model_load(format!("multi-view pipeline: {e}")));
            }
        };

        match texturing.prepare_texture(&self.accelerator, dtype) {
            Ok(texture) => {
                self.texturing = GroupState::Resident(TexturingPipelines { multiview, texture });
                Ok(())
            }
            Err(e) => {
                self.texturing = GroupState::Absent;
                self.reclaimer.reclaim(multiview.as_mut());
                drop(multiview);
                self.reclaimer.aggressive_cleanup();
                Err(EngineError::model_load(format!("texture pipeline: {e}")))
            }
        }
    }

    /// Release `group` if resident. Never fails; returns whether anything
    /// was unloaded.
    pub fn unload(&mut self, group: ModelGroup) -> bool {
        let released = match group {
            ModelGroup::Segmentation => match self.segmentation.take() {
                Some(mut models) => {
                    self.reclaimer.reclaim(models.detector.as_mut());
                    self.reclaimer.reclaim(models.processor.as_mut());
                    self.reclaimer.reclaim(models.segmenter.as_mut());
                    drop(models);
                    true
                }
                None => false,
            },
            ModelGroup::Geometry => match self.geometry.take() {
                Some(mut pipeline) => {
                    self.reclaimer.reclaim(pipeline.as_mut());
                    drop(pipeline);
                    true
                }
                None => false,
            },
            ModelGroup::Texturing => match self.texturing.take() {
                Some(mut pipes) => {
                    self.reclaimer.reclaim(pipes.multiview.as_mut());
                    self.reclaimer.reclaim(pipes.texture.as_mut());
                    drop(pipes);
                    true
                }
                None => false,
            },
        };

        if released {
            self.reclaimer.aggressive_cleanup();
            self.record(group, false);
            log_info!("registry", "{} models unloaded", group);
        }
        released
    }

    /// Unload every resident group; returns how many were released.
    pub fn unload_all(&mut self) -> usize {
        let count = ModelGroup::ALL
            .into_iter()
            .filter(|g| self.unload(*g))
            .count();
        if count > 0 {
            log_info!("registry", "Unloaded {} model groups", count);
        }
        count
    }
}

fn reclaim_partial_segmentation(reclaimer: &Reclaimer, partial: SegmentationParts) {
    let SegmentationParts {
        detector,
        processor,
        segmenter,
    } = partial;
    if let Some(mut detector) = detector {
        reclaimer.reclaim(detector.as_mut());
    }
    if let Some(mut processor) = processor {
        reclaimer.reclaim(processor.as_mut());
    }
    if let Some(mut segmenter) = segmenter {
        reclaimer.reclaim(segmenter.as_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::device::Accelerator;
    use crate::web::mock_backend::{remove_test_dirs, test_config, MockBackends, MockFaults};
    use crate::web::tensor::DType;
    use crate::web::weights::staging_dir;

    fn registry(faults: MockFaults) -> (ModelRegistry, MockBackends, Arc<EngineConfig>) {
        let config = Arc::new(test_config());
        let accelerator = Arc::new(Accelerator::cuda(config.accelerator_capacity_bytes()));
        let mocks = MockBackends::new(faults);
        let registry = ModelRegistry::new(Arc::clone(&config), accelerator, mocks.backends());
        (registry, mocks, config)
    }

    fn cleanup(config: &EngineConfig) {
        remove_test_dirs(config);
    }

    #[test]
    fn load_is_idempotent() {
        let (mut registry, mocks, config) = registry(MockFaults::default());
        registry.load(ModelGroup::Segmentation).unwrap();
        registry.load(ModelGroup::Segmentation).unwrap();

        assert!(registry.is_resident(ModelGroup::Segmentation));
        assert_eq!(mocks.prepare_calls(ModelGroup::Segmentation), 1);
        assert_eq!(registry.transitions().len(), 1);
        cleanup(&config);
    }

    #[test]
    fn unload_releases_accelerator_memory() {
        let (mut registry, _mocks, config) = registry(MockFaults::default());
        registry.load(ModelGroup::Texturing).unwrap();
        assert!(registry.accelerator().memory_stats().allocated_bytes > 0);

        assert!(registry.unload(ModelGroup::Texturing));
        assert!(!registry.unload(ModelGroup::Texturing));
        let stats = registry.accelerator().memory_stats();
        assert_eq!(stats.allocated_bytes, 0);
        assert_eq!(stats.reserved_bytes, 0);
        cleanup(&config);
    }

    #[test]
    fn partial_segmentation_load_is_rejected() {
        let (mut registry, _mocks, config) = registry(MockFaults {
            segmenter_missing: true,
            ..Default::default()
        });

        let err = registry.load(ModelGroup::Segmentation).unwrap_err();
        assert!(matches!(err, EngineError::ModelLoad(_)));
        assert!(!registry.is_resident(ModelGroup::Segmentation));
        assert_eq!(registry.accelerator().memory_stats().allocated_bytes, 0);
        cleanup(&config);
    }

    #[test]
    fn geometry_load_fetches_snapshot_once_and_pins_precision() {
        let (mut registry, mocks, config) = registry(MockFaults::default());
        assert!(!config.weights_dir.exists());

        registry.load(ModelGroup::Geometry).unwrap();
        assert_eq!(mocks.snapshot_fetches(), 1);

        let pipeline = registry.geometry_mut().unwrap();
        assert_eq!(pipeline.component_dtype("vae"), Some(DType::F32));
        assert_eq!(pipeline.component_dtype("unet"), Some(DType::F16));

        registry.unload(ModelGroup::Geometry);
        registry.load(ModelGroup::Geometry).unwrap();
        assert_eq!(mocks.snapshot_fetches(), 1);

        let summary = mocks.last_geometry_summary().unwrap();
        assert_eq!(
            summary.adapter_blocks,
            vec!["blocks.8", "blocks.9", "blocks.10", "blocks.11", "blocks.12"]
        );
        assert!(summary.parameters_loaded > 0);
        cleanup(&config);
    }

    #[test]
    fn interrupted_snapshot_is_fetched_again() {
        let (mut registry, mocks, config) = registry(MockFaults {
            snapshot_interrupted: true,
            ..Default::default()
        });

        let err = registry.load(ModelGroup::Geometry).unwrap_err();
        assert!(err.to_string().contains("snapshot download"));
        assert!(!config.weights_dir.exists());
        assert!(!staging_dir(&config.weights_dir).exists());

        registry.load(ModelGroup::Geometry).unwrap();
        assert_eq!(mocks.snapshot_fetches(), 2);
        assert!(config.weights_dir.join("model_index.json").exists());
        cleanup(&config);
    }

    #[test]
    fn failed_geometry_build_leaves_group_absent() {
        let (mut registry, _mocks, config) = registry(MockFaults {
            geometry_load: true,
            ..Default::default()
        });

        assert!(registry.load(ModelGroup::Geometry).is_err());
        assert!(!registry.is_resident(ModelGroup::Geometry));
        assert_eq!(registry.accelerator().memory_stats().allocated_bytes, 0);
        cleanup(&config);
    }

    #[test]
    fn texture_failure_reclaims_multiview_pipeline() {
        let (mut registry, mocks, config) = registry(MockFaults {
            texture_prepare: true,
            ..Default::default()
        });

        assert!(registry.load(ModelGroup::Texturing).is_err());
        assert!(!registry.is_resident(ModelGroup::Texturing));
        assert_eq!(registry.accelerator().memory_stats().allocated_bytes, 0);
        assert_eq!(mocks.prepare_calls(ModelGroup::Texturing), 1);
        cleanup(&config);
    }

    #[test]
    fn second_group_cannot_fit_alongside_first() {
        let (mut registry, _mocks, config) = registry(MockFaults::default());
        registry.load(ModelGroup::Segmentation).unwrap();

        // the footprints are sized so two groups exceed capacity
        assert!(registry.load(ModelGroup::Texturing).is_err());

        registry.unload(ModelGroup::Segmentation);
        registry.load(ModelGroup::Texturing).unwrap();
        assert_eq!(registry.peak_resident(), 1);
        cleanup(&config);
    }

    #[test]
    fn transition_history_stays_bounded() {
        let (mut registry, _mocks, config) = registry(MockFaults::default());
        for _ in 0..TRANSITION_HISTORY {
            registry.load(ModelGroup::Segmentation).unwrap();
            registry.unload(ModelGroup::Segmentation);
        }

        assert_eq!(registry.transitions().len(), TRANSITION_HISTORY);
        assert!(registry.was_loaded(ModelGroup::Segmentation));
        assert!(!registry.was_loaded(ModelGroup::Geometry));
        let last = registry.transitions().back().copied().unwrap();
        assert_eq!(last.group, ModelGroup::Segmentation);
        assert!(!last.resident);
        cleanup(&config);
    }

    #[test]
    fn unload_all_without_residents_is_a_noop() {
        let (mut registry, _mocks, config) = registry(MockFaults::default());
        assert_eq!(registry.unload_all(), 0);
        assert!(registry.transitions().is_empty());
        assert_eq!(registry.accelerator().counters().empty_cache_calls(), 0);

        registry.load(ModelGroup::Segmentation).unwrap();
        assert_eq!(registry.unload_all(), 1);
        assert!(registry.resident_groups().is_empty());
        cleanup(&config);
    }

    #[test]
    fn try_lock_does_not_wait_for_a_busy_registry() {
        let (registry, _mocks, config) = registry(MockFaults::default());
        let shared = registry.into_shared();
        let guard = lock_registry(&shared);
        assert!(try_lock_registry(&shared).is_none());
        drop(guard);
        assert!(try_lock_registry(&shared).is_some());
        cleanup(&config);
    }

    #[test]
    fn status_reports_each_group() {
        let (mut registry, _mocks, config) = registry(MockFaults::default());
        registry.load(ModelGroup::Segmentation).unwrap();
        let status = registry.status();
        assert_eq!(status.len(), 3);
        assert_eq!(status[0].state, "resident");
        assert_eq!(status[1].state, "absent");
        cleanup(&config);
    }
}
