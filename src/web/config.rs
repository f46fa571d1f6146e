use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::device::DeviceKind;
use super::prompt_queue::DEFAULT_WAIT_TIMEOUT;
use super::tensor::DType;

// Import logging macros
use crate::{sys_info, sys_warn};

pub const DEFAULT_CONFIG_PATH: &str = "assets/config.json";
pub const CONFIG_PATH_ENV: &str = "SCENE_FORGE_CONFIG";

/// Engine configuration. Every field has a default so a partial
/// `assets/config.json` is enough.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default = "default_weights_dir")]
    pub weights_dir: PathBuf,
    #[serde(default = "default_repo_id")]
    pub repo_id: String,
    #[serde(default = "default_detector_id")]
    pub detector_id: String,
    #[serde(default = "default_segmenter_id")]
    pub segmenter_id: String,
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    #[serde(default = "default_device")]
    pub device: DeviceKind,
    #[serde(default = "default_accelerator_capacity_gb")]
    pub accelerator_capacity_gb: f64,
    #[serde(default = "default_dtype")]
    pub dtype: DType,
    #[serde(default = "default_pinned_component")]
    pub pinned_component: String,
    #[serde(default = "default_pinned_dtype")]
    pub pinned_dtype: DType,
    #[serde(default = "default_adapter_blocks")]
    pub adapter_blocks: Vec<String>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_num_inference_steps")]
    pub num_inference_steps: u32,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f32,
    #[serde(default = "default_true")]
    pub do_image_padding: bool,
    #[serde(default = "default_cleanup_pause_ms")]
    pub cleanup_pause_ms: u64,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Largest accepted upload body.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,
    #[serde(default)]
    pub prompt_queue_address: Option<String>,
    #[serde(default)]
    pub edit_workflow_path: Option<PathBuf>,
    #[serde(default = "default_prompt_queue_timeout_secs")]
    pub prompt_queue_timeout_secs: u64,
    #[serde(default)]
    pub disable_file_logging: bool,
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("tmp")
}
fn default_weights_dir() -> PathBuf {
    PathBuf::from("pretrained_weights/MIDI-3D")
}
fn default_repo_id() -> String {
    "VAST-AI/MIDI-3D".to_string()
}
fn default_detector_id() -> String {
    "IDEA-Research/grounding-dino-tiny".to_string()
}
fn default_segmenter_id() -> String {
    "facebook/sam-vit-base".to_string()
}
fn default_chunk_size_mb() -> u64 {
    500
}
fn default_device() -> DeviceKind {
    DeviceKind::Cuda
}
fn default_accelerator_capacity_gb() -> f64 {
    24.0
}
fn default_dtype() -> DType {
    DType::F16
}
fn default_pinned_component() -> String {
    "vae".to_string()
}
fn default_pinned_dtype() -> DType {
    DType::F32
}
fn default_adapter_blocks() -> Vec<String> {
    (8..=12).map(|i| format!("blocks.{i}")).collect()
}
fn default_seed() -> u64 {
    42
}
fn default_num_inference_steps() -> u32 {
    35
}
fn default_guidance_scale() -> f32 {
    7.0
}
fn default_true() -> bool {
    true
}
fn default_cleanup_pause_ms() -> u64 {
    100
}
fn default_bind_address() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_max_upload_mb() -> u64 {
    50
}
fn default_prompt_queue_timeout_secs() -> u64 {
    DEFAULT_WAIT_TIMEOUT.as_secs()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tmp_dir: default_tmp_dir(),
            weights_dir: default_weights_dir(),
            repo_id: default_repo_id(),
            detector_id: default_detector_id(),
            segmenter_id: default_segmenter_id(),
            chunk_size_mb: default_chunk_size_mb(),
            device: default_device(),
            accelerator_capacity_gb: default_accelerator_capacity_gb(),
            dtype: default_dtype(),
            pinned_component: default_pinned_component(),
            pinned_dtype: default_pinned_dtype(),
            adapter_blocks: default_adapter_blocks(),
            seed: default_seed(),
            num_inference_steps: default_num_inference_steps(),
            guidance_scale: default_guidance_scale(),
            do_image_padding: true,
            cleanup_pause_ms: default_cleanup_pause_ms(),
            bind_address: default_bind_address(),
            max_upload_mb: default_max_upload_mb(),
            prompt_queue_address: None,
            edit_workflow_path: None,
            prompt_queue_timeout_secs: default_prompt_queue_timeout_secs(),
            disable_file_logging: false,
        }
    }
}

impl EngineConfig {
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }

    pub fn accelerator_capacity_bytes(&self) -> u64 {
        (self.accelerator_capacity_gb.max(0.0) * 1024.0 * 1024.0 * 1024.0) as u64
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }

    pub fn cleanup_pause(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.cleanup_pause_ms)
    }

    pub fn prompt_queue_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.prompt_queue_timeout_secs)
    }
}

/// Config file location: `$SCENE_FORGE_CONFIG` or `assets/config.json`.
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load configuration, falling back to defaults on a missing or invalid file.
pub fn load_config(path: &Path) -> EngineConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<EngineConfig>(&contents) {
            Ok(config) => {
                sys_info!("Loaded configuration from {}", path.display());
                config
            }
            Err(e) => {
                sys_warn!("Invalid config at {}: {}; using defaults", path.display(), e);
                EngineConfig::default()
            }
        },
        Err(_) => {
            sys_info!("No config at {}; using defaults", path.display());
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_pipeline() {
        let config = EngineConfig::default();
        assert_eq!(config.repo_id, "VAST-AI/MIDI-3D");
        assert_eq!(config.chunk_size_mb, 500);
        assert_eq!(config.dtype, DType::F16);
        assert_eq!(config.pinned_component, "vae");
        assert_eq!(config.pinned_dtype, DType::F32);
        assert_eq!(
            config.adapter_blocks,
            vec!["blocks.8", "blocks.9", "blocks.10", "blocks.11", "blocks.12"]
        );
        assert_eq!(config.seed, 42);
        assert_eq!(config.num_inference_steps, 35);
        assert!((config.guidance_scale - 7.0).abs() < f32::EPSILON);
        assert_eq!(config.max_upload_bytes(), 50 * 1024 * 1024);
        assert_eq!(config.prompt_queue_timeout().as_secs(), 300);
        assert!(config.prompt_queue_address.is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"chunk_size_mb": 64, "device": "cpu", "dtype": "bf16"}"#)
                .unwrap();
        assert_eq!(config.chunk_size_mb, 64);
        assert_eq!(config.chunk_size_bytes(), 64 * 1024 * 1024);
        assert_eq!(config.device, DeviceKind::Cpu);
        assert_eq!(config.dtype, DType::BF16);
        assert_eq!(config.tmp_dir, PathBuf::from("tmp"));
    }

    #[test]
    fn missing_or_invalid_file_falls_back() {
        let dir = std::env::temp_dir().join(format!("scene_forge_cfg_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let missing = load_config(&dir.join("absent.json"));
        assert_eq!(missing.bind_address, "0.0.0.0:8000");

        let invalid_path = dir.join("invalid.json");
        std::fs::write(&invalid_path, "{ not json").unwrap();
        let invalid = load_config(&invalid_path);
        assert_eq!(invalid.chunk_size_mb, 500);

        let valid_path = dir.join("valid.json");
        std::fs::write(&valid_path, r#"{"cleanup_pause_ms": 0}"#).unwrap();
        assert_eq!(load_config(&valid_path).cleanup_pause_ms, 0);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
