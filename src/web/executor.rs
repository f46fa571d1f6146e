//! Task submission and background workers.
//!
//! `submit` records the task as queued and returns at once; a worker on the
//! blocking pool runs the stage pipeline. Every worker ends in a terminal
//! status: a failed or panicked run first releases all resident groups, then
//! records the error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::backends::Backends;
use super::config::EngineConfig;
use super::device::SharedAccelerator;
use super::error::{EngineError, FailureReason, Result, TaskFailure};
use super::memory::{memory_report, MemoryReport};
use super::model_registry::{lock_registry, ModelRegistry, SharedModelRegistry};
use super::models::Submission;
use super::pipeline::{
    artifact_path, discard_task_files, input_image_path, CancellationFlag, ProgressReporter,
    StagePipeline, TaskContext,
};
use super::task_store::{SharedTaskStore, TaskRecord, TaskStatus, TaskStore};

// Import logging macros
use crate::{log_debug, log_error, log_info, log_warn};

pub const QUEUED_MESSAGE: &str = "Task queued for processing";
pub const COMPLETED_MESSAGE: &str = "3D model with textures generated successfully!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    NotFound,
    NotCompleted,
    FileMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Requested,
    AlreadyFinished,
    NotFound,
}

type CancelFlags = Arc<Mutex<HashMap<String, CancellationFlag>>>;

pub struct TaskExecutor {
    config: Arc<EngineConfig>,
    accelerator: SharedAccelerator,
    registry: SharedModelRegistry,
    store: SharedTaskStore,
    pipeline: Arc<StagePipeline>,
    cancels: CancelFlags,
}

pub type SharedExecutor = Arc<TaskExecutor>;

impl TaskExecutor {
    pub fn new(
        config: Arc<EngineConfig>,
        accelerator: SharedAccelerator,
        backends: Backends,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.tmp_dir)?;
        let editor = backends.editor.clone();
        let registry = ModelRegistry::new(Arc::clone(&config), Arc::clone(&accelerator), backends)
            .into_shared();
        let pipeline = Arc::new(StagePipeline::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            editor,
        ));
        Ok(Self {
            config,
            accelerator,
            registry,
            store: Arc::new(TaskStore::new()),
            pipeline,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn accelerator(&self) -> &SharedAccelerator {
        &self.accelerator
    }

    pub fn registry(&self) -> &SharedModelRegistry {
        &self.registry
    }

    pub fn store(&self) -> &SharedTaskStore {
        &self.store
    }

    fn cancel_flags(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationFlag>> {
        self.cancels.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue a validated submission and start its worker. Must be called
    /// from within a tokio runtime.
    pub fn submit(&self, submission: Submission) -> Result<String> {
        if submission.edit_prompt.is_some() && !self.pipeline.editing_enabled() {
            return Err(EngineError::Validation(
                "Image editing is not configured on this server".to_string(),
            ));
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let image_path = input_image_path(&self.config.tmp_dir, &task_id);
        std::fs::write(&image_path, &submission.image)?;

        self.store.set(&task_id, TaskStatus::Queued, QUEUED_MESSAGE, None, None);
        let cancel: CancellationFlag = Arc::new(AtomicBool::new(false));
        self.cancel_flags().insert(task_id.clone(), Arc::clone(&cancel));

        log_info!(
            "task",
            "[{}] Queued with {}, polygon refinement {}",
            task_id,
            submission.input.describe(),
            submission.polygon_refinement
        );

        let ctx = TaskContext {
            task_id: task_id.clone(),
            image_path,
            input: submission.input,
            polygon_refinement: submission.polygon_refinement,
            edit_prompt: submission.edit_prompt,
            cancel,
        };
        tokio::spawn(run_task(
            ctx,
            Arc::clone(&self.pipeline),
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.cancels),
        ));
        Ok(task_id)
    }

    pub fn status(&self, task_id: &str) -> Option<TaskRecord> {
        self.store.get(task_id)
    }

    pub fn cancel(&self, task_id: &str) -> CancelOutcome {
        if let Some(flag) = self.cancel_flags().get(task_id) {
            flag.store(true, Ordering::SeqCst);
            log_info!("task", "[{}] Cancellation requested", task_id);
            return CancelOutcome::Requested;
        }
        match self.store.get(task_id) {
            Some(_) => CancelOutcome::AlreadyFinished,
            None => CancelOutcome::NotFound,
        }
    }

    /// Path of a completed task's scene file.
    pub fn artifact(&self, task_id: &str) -> std::result::Result<PathBuf, ArtifactError> {
        let record = self.store.get(task_id).ok_or(ArtifactError::NotFound)?;
        if record.status != TaskStatus::Completed {
            return Err(ArtifactError::NotCompleted);
        }
        let path = artifact_path(&self.config.tmp_dir, task_id);
        if !path.exists() {
            return Err(ArtifactError::FileMissing);
        }
        Ok(path)
    }

    pub fn memory_report(&self) -> MemoryReport {
        memory_report(&self.accelerator)
    }

    /// Unload every resident group. Blocks on the registry lock.
    pub fn cleanup(&self) -> usize {
        lock_registry(&self.registry).unload_all()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_task(
    ctx: TaskContext,
    pipeline: Arc<StagePipeline>,
    registry: SharedModelRegistry,
    store: SharedTaskStore,
    cancels: CancelFlags,
) {
    let task_id = ctx.task_id.clone();
    let tmp_dir = pipeline.tmp_dir().to_path_buf();
    let worker_store = Arc::clone(&store);

    let joined = tokio::task::spawn_blocking(move || {
        let mut progress = ProgressReporter::new(worker_store, &ctx.task_id);
        pipeline.run(&ctx, &mut progress)
    })
    .await;

    let outcome = match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TaskFailure::new(
            FailureReason::StageCompute,
            format!("Worker panicked: {}", panic_message(e.into_panic())),
        )),
        Err(e) => Err(TaskFailure::new(FailureReason::StageCompute, e.to_string())),
    };

    match outcome {
        Ok(locator) => {
            store.set(
                &task_id,
                TaskStatus::Completed,
                COMPLETED_MESSAGE,
                Some(1.0),
                Some(locator),
            );
            log_info!("task", "[{}] Completed", task_id);
        }
        Err(failure) => {
            let unload = tokio::task::spawn_blocking(move || lock_registry(&registry).unload_all());
            let released = match unload.await {
                Ok(count) => count,
                Err(e) => {
                    log_warn!("task", "[{}] Unloading after failure failed: {}", task_id, e);
                    0
                }
            };
            let discarded = discard_task_files(&tmp_dir, &task_id);
            log_debug!("task", "[{}] Discarded {} working files", task_id, discarded);
            log_error!(
                "task",
                "[{}] Failed ({}): {} - released {} model groups",
                task_id,
                failure.reason.as_str(),
                failure.message,
                released
            );
            store.set_failed(&task_id, &failure);
        }
    }

    cancels
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .remove(&task_id);
}
