//! Size-bounded weight staging.
//!
//! A weight file is read once into host memory, split into chunks no larger
//! than the budget, and each chunk is converted, uploaded and merged before
//! the next one is touched. Host staging is released between chunks.

use serde::Serialize;
use std::path::Path;

use super::backends::ParameterSink;
use super::device::{release_host_memory, Accelerator, DeviceTensor};
use super::error::{EngineError, Result};
use super::tensor::{estimate_size, DType, ParameterMap, Tensor};
use super::weights::WeightReader;

// Import logging macros
use crate::{log_debug, log_info};

pub const DEFAULT_CHUNK_SIZE_MB: u64 = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub chunks: usize,
    pub tensors: usize,
    pub bytes: u64,
    pub unexpected_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkedWeightLoader {
    budget_bytes: u64,
}

impl Default for ChunkedWeightLoader {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE_MB)
    }
}

impl ChunkedWeightLoader {
    pub fn new(chunk_size_mb: u64) -> Self {
        Self::with_budget_bytes(chunk_size_mb * 1024 * 1024)
    }

    pub fn with_budget_bytes(budget_bytes: u64) -> Self {
        Self { budget_bytes }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Split in insertion order. A chunk closes when the next tensor would
    /// push it over budget; a single oversized tensor gets its own chunk.
    pub fn split(&self, mapping: ParameterMap) -> Vec<ParameterMap> {
        let mut chunks = Vec::new();
        let mut current = ParameterMap::new();
        let mut current_bytes: u64 = 0;

        for (name, tensor) in mapping {
            let size = estimate_size(&tensor) as u64;
            if !current.is_empty() && current_bytes + size > self.budget_bytes {
                chunks.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += size;
            current.insert(name, tensor);
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    /// Chunked load of one weight file into `model`.
    pub fn load<M: ParameterSink + ?Sized>(
        &self,
        model: &mut M,
        source: &Path,
        reader: &dyn WeightReader,
        device: &Accelerator,
        dtype: DType,
    ) -> Result<LoadReport> {
        log_info!(
            "loader",
            "Loading {} in chunks of {:.0} MB",
            source.display(),
            self.budget_bytes as f64 / (1024.0 * 1024.0)
        );

        let mapping = reader.read(source)?;
        let chunks = self.split(mapping);
        let total = chunks.len();

        let mut report = LoadReport::default();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let (tensors, bytes) = (chunk.len(), chunk.total_bytes() as u64);
            let staged = stage_chunk(chunk, device, dtype)?;
            let merged = model.load_parameters(staged)?;

            report.chunks += 1;
            report.tensors += tensors;
            report.bytes += bytes;
            report.unexpected_keys.extend(merged.unexpected_keys);

            release_host_memory();
            device.empty_cache();
            log_debug!(
                "loader",
                "Chunk {}/{} loaded ({} tensors, {} bytes)",
                index + 1,
                total,
                tensors,
                bytes
            );
        }

        log_info!(
            "loader",
            "Loaded {} tensors from {} in {} chunks",
            report.tensors,
            source.display(),
            report.chunks
        );
        Ok(report)
    }

    /// Single read, convert and merge. Used when chunked loading fails.
    pub fn load_unchunked<M: ParameterSink + ?Sized>(
        &self,
        model: &mut M,
        source: &Path,
        reader: &dyn WeightReader,
        device: &Accelerator,
        dtype: DType,
    ) -> Result<LoadReport> {
        let mapping = reader.read(source)?;
        let (tensors, bytes) = (mapping.len(), mapping.total_bytes() as u64);
        let staged = stage_chunk(mapping, device, dtype)?;
        let merged = model.load_parameters(staged)?;
        release_host_memory();
        device.empty_cache();

        Ok(LoadReport {
            chunks: 1,
            tensors,
            bytes,
            unexpected_keys: merged.unexpected_keys,
        })
    }
}

/// Floating tensors go to `(device, dtype)`, everything else keeps its dtype.
fn stage_chunk(
    chunk: ParameterMap<Tensor>,
    device: &Accelerator,
    dtype: DType,
) -> Result<ParameterMap<DeviceTensor>> {
    let mut staged = ParameterMap::new();
    for (name, tensor) in chunk {
        let target = tensor.dtype().is_floating_point().then_some(dtype);
        let on_device = device
            .upload(tensor, target)
            .map_err(|e| EngineError::model_load(format!("{name}: {e}")))?;
        staged.insert(name, on_device);
    }
    Ok(staged)
}
