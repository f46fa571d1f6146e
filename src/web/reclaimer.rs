use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use super::backends::Releasable;
use super::device::{release_host_memory, SharedAccelerator};

// Import logging macros
use crate::{log_debug, log_info, log_warn};

const HOST_ROUNDS: usize = 5;
const ACCELERATOR_ROUNDS: usize = 5;
const FINAL_HOST_ROUNDS: usize = 3;

const DIFFUSION_COMPONENTS: &[&str] = &[
    "unet",
    "vae",
    "text_encoder",
    "tokenizer",
    "scheduler",
    "feature_extractor",
    "image_encoder",
    "safety_checker",
];

const ADAPTER_COMPONENTS: &[&str] = &["unet", "vae", "text_encoder", "tokenizer", "scheduler"];

/// Pipeline family; decides which named components get torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Diffusion,
    Adapter,
    Segmentation,
}

impl PipelineKind {
    pub fn teardown_components(&self) -> &'static [&'static str] {
        match self {
            PipelineKind::Diffusion => DIFFUSION_COMPONENTS,
            PipelineKind::Adapter => ADAPTER_COMPONENTS,
            PipelineKind::Segmentation => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub components_released: usize,
    pub failed_steps: Vec<String>,
    pub bytes_detached: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub host_rounds: usize,
    pub accelerator_rounds: usize,
    pub bytes_released: u64,
}

/// Best-effort teardown of model objects. Nothing here returns an error.
pub struct Reclaimer {
    accelerator: SharedAccelerator,
    pause: Duration,
}

/// Run one teardown step, absorbing both errors and panics.
fn guarded<T>(
    report: &mut ReclaimReport,
    step: &str,
    f: impl FnOnce() -> Result<T, String>,
) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            log_warn!("reclaim", "{} failed: {}", step, e);
            report.failed_steps.push(step.to_string());
            None
        }
        Err(_) => {
            log_warn!("reclaim", "{} panicked", step);
            report.failed_steps.push(step.to_string());
            None
        }
    }
}

impl Reclaimer {
    pub fn new(accelerator: SharedAccelerator, pause: Duration) -> Self {
        Self { accelerator, pause }
    }

    pub fn accelerator(&self) -> &SharedAccelerator {
        &self.accelerator
    }

    /// Tear down `object` in place. The caller drops it afterwards.
    pub fn reclaim<R: Releasable + ?Sized>(&self, object: &mut R) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        let kind = object.kind();
        let before = self.accelerator.memory_stats().allocated_bytes;

        guarded(&mut report, "offload_to_host", || object.offload_to_host());

        for name in kind.teardown_components() {
            let taken = guarded(&mut report, &format!("take {name}"), || {
                Ok(object.take_component(name))
            });
            let Some(Some(mut component)) = taken else {
                continue;
            };
            guarded(&mut report, &format!("clear {name}"), || component.clear_state());
            if let Some(bytes) =
                guarded(&mut report, &format!("detach {name}"), || component.detach_parameters())
            {
                report.bytes_detached += bytes;
            }
            drop(component);
            report.components_released += 1;
            log_debug!("reclaim", "Released component {}", name);
        }

        guarded(&mut report, "clear_state", || object.clear_state());

        let after = self.accelerator.memory_stats().allocated_bytes;
        log_info!(
            "reclaim",
            "Reclaimed {:?} object: {} components, {} bytes detached, {} failed steps, allocated {} -> {}",
            kind,
            report.components_released,
            report.bytes_detached,
            report.failed_steps.len(),
            before,
            after
        );
        report
    }

    fn pause(&self) {
        if !self.pause.is_zero() {
            std::thread::sleep(self.pause);
        }
    }

    /// Host collection rounds, accelerator cache rounds, peak reset, then
    /// the final host rounds.
    pub fn aggressive_cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let reserved_before = self.accelerator.memory_stats().reserved_bytes;

        for _ in 0..HOST_ROUNDS {
            release_host_memory();
            report.host_rounds += 1;
            self.pause();
        }

        if self.accelerator.is_accelerator() {
            for _ in 0..ACCELERATOR_ROUNDS {
                self.accelerator.empty_cache();
                self.accelerator.synchronize();
                report.accelerator_rounds += 1;
                self.pause();
            }
            self.accelerator.reset_peak_stats();
        }

        for _ in 0..FINAL_HOST_ROUNDS {
            release_host_memory();
            report.host_rounds += 1;
        }

        let stats = self.accelerator.memory_stats();
        report.bytes_released = reserved_before.saturating_sub(stats.reserved_bytes);
        log_info!(
            "reclaim",
            "Cleanup done: allocated {:.2} GB, reserved {:.2} GB",
            stats.allocated_gb(),
            stats.reserved_gb()
        );
        report
    }
}
