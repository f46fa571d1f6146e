//! Weight sources: safetensors files on disk and remote model snapshots.

use memmap2::Mmap;
use safetensors::SafeTensors;
use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::error::{EngineError, Result};
use super::tensor::{DType, ParameterMap, Tensor};

// Import logging macros
use crate::{log_debug, log_info, log_warn};

pub const WEIGHT_EXTENSIONS: &[&str] = &["safetensors"];

/// Reads a weight file into a host parameter mapping.
pub trait WeightReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<ParameterMap>;
}

/// Fetches a model snapshot into a local directory.
pub trait SnapshotFetcher: Send + Sync {
    fn fetch(&self, repo_id: &str, local_dir: &Path) -> Result<()>;
}

fn map_dtype(dtype: safetensors::Dtype) -> Result<DType> {
    match dtype {
        safetensors::Dtype::F32 => Ok(DType::F32),
        safetensors::Dtype::F16 => Ok(DType::F16),
        safetensors::Dtype::BF16 => Ok(DType::BF16),
        safetensors::Dtype::I64 => Ok(DType::I64),
        safetensors::Dtype::I32 => Ok(DType::I32),
        safetensors::Dtype::I8 => Ok(DType::I8),
        safetensors::Dtype::U8 => Ok(DType::U8),
        safetensors::Dtype::BOOL => Ok(DType::Bool),
        dt => Err(EngineError::model_load(format!("unsupported dtype {dt:?}"))),
    }
}

fn to_safetensors_dtype(dtype: DType) -> safetensors::Dtype {
    match dtype {
        DType::F32 => safetensors::Dtype::F32,
        DType::F16 => safetensors::Dtype::F16,
        DType::BF16 => safetensors::Dtype::BF16,
        DType::I64 => safetensors::Dtype::I64,
        DType::I32 => safetensors::Dtype::I32,
        DType::I8 => safetensors::Dtype::I8,
        DType::U8 => safetensors::Dtype::U8,
        DType::Bool => safetensors::Dtype::BOOL,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SafetensorsReader;

impl WeightReader for SafetensorsReader {
    /// Tensors come back in on-disk order. The file is mapped rather than
    /// read, so host memory holds one copy of the weights.
    fn read(&self, path: &Path) -> Result<ParameterMap> {
        let file = File::open(path)?;
        // SAFETY: read-only mapping, dropped before returning; weight files
        // are not rewritten while a model loads.
        let mmap = unsafe { Mmap::map(&file)? };
        let st = SafeTensors::deserialize(&mmap).map_err(|e| {
            EngineError::model_load(format!("{}: {e}", path.display()))
        })?;

        let base = mmap.as_ptr() as usize;
        let mut views = st.tensors();
        views.sort_by_key(|(_, view)| view.data().as_ptr() as usize - base);

        let mut map = ParameterMap::new();
        for (name, view) in views {
            let dtype = map_dtype(view.dtype())?;
            let tensor = Tensor::new(view.shape().to_vec(), dtype, view.data().to_vec())?;
            map.insert(name, tensor);
        }
        log_debug!(
            "loader",
            "Read {} tensors ({} bytes) from {}",
            map.len(),
            map.total_bytes(),
            path.display()
        );
        Ok(map)
    }
}

/// Serialize a mapping as a `.safetensors` file.
pub fn write_safetensors(map: &ParameterMap, path: &Path) -> Result<()> {
    let mut views = Vec::with_capacity(map.len());
    for (name, tensor) in map.iter() {
        let view = safetensors::tensor::TensorView::new(
            to_safetensors_dtype(tensor.dtype()),
            tensor.shape().to_vec(),
            tensor.as_bytes(),
        )
        .map_err(|e| EngineError::model_load(format!("{name}: {e}")))?;
        views.push((name.to_string(), view));
    }
    let bytes = safetensors::serialize(views, &None)
        .map_err(|e| EngineError::model_load(format!("serialize {}: {e}", path.display())))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

/// All weight files under `dir`, sorted by path.
pub fn discover_weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| EngineError::model_load(format!("{}: {e}", dir.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| WEIGHT_EXTENSIONS.contains(&ext))
            .unwrap_or(false);
        if matches {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Sibling directory a snapshot is downloaded into before it is complete.
pub fn staging_dir(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    dest.with_file_name(format!("{name}.partial"))
}

/// Fetch `repo_id` so that `dest` only ever appears complete. The download
/// lands in [`staging_dir`] and is renamed into place on success; a failed
/// or leftover staging directory is removed.
pub fn fetch_snapshot(fetcher: &dyn SnapshotFetcher, repo_id: &str, dest: &Path) -> Result<()> {
    let staging = staging_dir(dest);
    if staging.exists() {
        log_warn!("loader", "Removing incomplete snapshot at {}", staging.display());
        std::fs::remove_dir_all(&staging)?;
    }

    if let Err(e) = fetcher.fetch(repo_id, &staging) {
        if staging.exists() {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                log_warn!("loader", "Could not remove {}: {}", staging.display(), cleanup);
            }
        }
        return Err(e);
    }

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(&staging, dest)?;
    log_info!("loader", "Snapshot {} ready at {}", repo_id, dest.display());
    Ok(())
}

/// Downloads every file of a Hugging Face model repo.
#[derive(Debug, Default, Clone, Copy)]
pub struct HfHubFetcher;

impl SnapshotFetcher for HfHubFetcher {
    fn fetch(&self, repo_id: &str, local_dir: &Path) -> Result<()> {
        log_info!("loader", "Downloading snapshot {} to {}", repo_id, local_dir.display());

        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| EngineError::external(format!("hub client: {e}")))?;
        let repo = api.model(repo_id.to_string());
        let info = repo
            .info()
            .map_err(|e| EngineError::external(format!("{repo_id}: {e}")))?;

        std::fs::create_dir_all(local_dir)?;
        for sibling in &info.siblings {
            let cached = repo
                .get(&sibling.rfilename)
                .map_err(|e| EngineError::external(format!("{}: {e}", sibling.rfilename)))?;
            let dest = local_dir.join(&sibling.rfilename);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&cached, &dest)?;
        }

        log_info!("loader", "Snapshot {} complete ({} files)", repo_id, info.siblings.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("scene_forge_weights_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn safetensors_file_reads_back() {
        let dir = temp_dir();
        let path = dir.join("unet").join("model.safetensors");

        let mut map = ParameterMap::new();
        let conv = Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        map.insert("unet.conv.weight", conv);
        map.insert("unet.position_ids", Tensor::zeros(vec![3], DType::I64));
        write_safetensors(&map, &path).unwrap();

        let read = SafetensorsReader.read(&path).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read.get("unet.conv.weight"), map.get("unet.conv.weight"));
        assert_eq!(read.get("unet.position_ids").unwrap().dtype(), DType::I64);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_file_is_a_model_load_error() {
        let dir = temp_dir();
        let path = dir.join("broken.safetensors");
        std::fs::write(&path, b"not a weight file").unwrap();

        let err = SafetensorsReader.read(&path).unwrap_err();
        assert!(matches!(err, EngineError::ModelLoad(_)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    struct FlakyFetcher {
        fail: bool,
    }

    impl SnapshotFetcher for FlakyFetcher {
        fn fetch(&self, _repo_id: &str, local_dir: &Path) -> Result<()> {
            std::fs::create_dir_all(local_dir)?;
            std::fs::write(local_dir.join("model_index.json"), b"{}")?;
            if self.fail {
                return Err(EngineError::external("connection reset"));
            }
            std::fs::write(local_dir.join("model.safetensors"), b"")?;
            Ok(())
        }
    }

    #[test]
    fn interrupted_fetch_leaves_no_snapshot_behind() {
        let dir = temp_dir();
        let dest = dir.join("weights");

        let err = fetch_snapshot(&FlakyFetcher { fail: true }, "org/model", &dest).unwrap_err();
        assert!(matches!(err, EngineError::ExternalService(_)));
        assert!(!dest.exists());
        assert!(!staging_dir(&dest).exists());

        // leftovers from a killed process are cleared before the next attempt
        std::fs::create_dir_all(staging_dir(&dest).join("stale")).unwrap();
        fetch_snapshot(&FlakyFetcher { fail: false }, "org/model", &dest).unwrap();
        assert!(dest.join("model.safetensors").exists());
        assert!(!dest.join("stale").exists());
        assert!(!staging_dir(&dest).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn discovery_finds_nested_weight_files_only() {
        let dir = temp_dir();
        std::fs::create_dir_all(dir.join("vae")).unwrap();
        std::fs::write(dir.join("vae").join("b.safetensors"), b"").unwrap();
        std::fs::write(dir.join("a.safetensors"), b"").unwrap();
        std::fs::write(dir.join("config.json"), b"{}").unwrap();

        let files = discover_weight_files(&dir).unwrap();
        assert_eq!(files, vec![dir.join("a.safetensors"), dir.join("vae").join("b.safetensors")]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
