//! Shared accelerator with byte-accurate accounting.
//!
//! Memory behaves like a caching device allocator: freed buffers stay
//! *reserved* until `empty_cache` returns them, and allocations fail once
//! live buffers would exceed the configured capacity.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::error::{EngineError, Result};
use super::tensor::{DType, Tensor};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub allocated_bytes: u64,
    pub reserved_bytes: u64,
    pub peak_allocated_bytes: u64,
    pub capacity_bytes: u64,
}

impl MemoryStats {
    pub fn allocated_gb(&self) -> f64 {
        self.allocated_bytes as f64 / BYTES_PER_GB
    }

    pub fn reserved_gb(&self) -> f64 {
        self.reserved_bytes as f64 / BYTES_PER_GB
    }

    pub fn peak_gb(&self) -> f64 {
        self.peak_allocated_bytes as f64 / BYTES_PER_GB
    }

    pub fn capacity_gb(&self) -> f64 {
        self.capacity_bytes as f64 / BYTES_PER_GB
    }
}

#[derive(Debug, Default)]
struct Pool {
    allocated: u64,
    reserved: u64,
    peak: u64,
}

impl Pool {
    fn release(&mut self, bytes: u64) {
        self.allocated = self.allocated.saturating_sub(bytes);
    }
}

/// Counts of maintenance calls, read by cleanup tests and `/memory`.
#[derive(Debug, Default)]
pub struct MaintenanceCounters {
    empty_cache: AtomicU64,
    synchronize: AtomicU64,
    reset_peak: AtomicU64,
}

impl MaintenanceCounters {
    pub fn empty_cache_calls(&self) -> u64 {
        self.empty_cache.load(Ordering::Relaxed)
    }

    pub fn synchronize_calls(&self) -> u64 {
        self.synchronize.load(Ordering::Relaxed)
    }

    pub fn reset_peak_calls(&self) -> u64 {
        self.reset_peak.load(Ordering::Relaxed)
    }
}

pub struct Accelerator {
    kind: DeviceKind,
    capacity: u64,
    pool: Arc<Mutex<Pool>>,
    counters: MaintenanceCounters,
}

pub type SharedAccelerator = Arc<Accelerator>;

impl Accelerator {
    pub fn new(kind: DeviceKind, capacity_bytes: u64) -> Self {
        let capacity = match kind {
            DeviceKind::Cpu => u64::MAX,
            DeviceKind::Cuda => capacity_bytes,
        };
        Self {
            kind,
            capacity,
            pool: Arc::new(Mutex::new(Pool::default())),
            counters: MaintenanceCounters::default(),
        }
    }

    pub fn cpu() -> Self {
        Self::new(DeviceKind::Cpu, 0)
    }

    pub fn cuda(capacity_bytes: u64) -> Self {
        Self::new(DeviceKind::Cuda, capacity_bytes)
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// True when a discrete accelerator (not host memory) backs this device.
    pub fn is_accelerator(&self) -> bool {
        self.kind == DeviceKind::Cuda
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Reserve `bytes` of device memory for an opaque model allocation.
    pub fn allocate(&self, bytes: u64) -> Result<DeviceBuffer> {
        let mut pool = self.pool();
        let wanted = pool.allocated.saturating_add(bytes);
        if wanted > self.capacity {
            return Err(EngineError::model_load(format!(
                "out of accelerator memory: requested {:.2} GB with {:.2} GB of {:.2} GB in use",
                bytes as f64 / BYTES_PER_GB,
                pool.allocated as f64 / BYTES_PER_GB,
                self.capacity as f64 / BYTES_PER_GB
            )));
        }
        pool.allocated = wanted;
        pool.reserved = pool.reserved.max(pool.allocated);
        pool.peak = pool.peak.max(pool.allocated);
        Ok(DeviceBuffer {
            bytes,
            pool: Arc::clone(&self.pool),
        })
    }

    /// Move a host tensor onto the device, converting floating tensors to
    /// `dtype` when given. The host copy is consumed.
    pub fn upload(&self, tensor: Tensor, dtype: Option<DType>) -> Result<DeviceTensor> {
        let tensor = match dtype {
            Some(target) if tensor.dtype().is_floating_point() => tensor.to_dtype(target)?,
            _ => tensor,
        };
        let buffer = self.allocate(tensor.size_bytes() as u64)?;
        Ok(DeviceTensor { tensor, buffer })
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let pool = self.pool();
        MemoryStats {
            allocated_bytes: pool.allocated,
            reserved_bytes: pool.reserved,
            peak_allocated_bytes: pool.peak,
            capacity_bytes: if self.is_accelerator() { self.capacity } else { 0 },
        }
    }

    /// Return cached but unused blocks.
    pub fn empty_cache(&self) {
        self.counters.empty_cache.fetch_add(1, Ordering::Relaxed);
        let mut pool = self.pool();
        pool.reserved = pool.allocated;
    }

    /// Wait for outstanding device work. Work is synchronous here, so this
    /// is only a barrier for accounting.
    pub fn synchronize(&self) {
        self.counters.synchronize.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_peak_stats(&self) {
        self.counters.reset_peak.fetch_add(1, Ordering::Relaxed);
        let mut pool = self.pool();
        pool.peak = pool.allocated;
    }

    pub fn counters(&self) -> &MaintenanceCounters {
        &self.counters
    }
}

/// Live device allocation; bytes return to the pool on drop.
#[derive(Debug)]
pub struct DeviceBuffer {
    bytes: u64,
    pool: Arc<Mutex<Pool>>,
}

impl DeviceBuffer {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        let mut pool = self.pool.lock().unwrap_or_else(|p| p.into_inner());
        pool.release(self.bytes);
    }
}

/// Tensor resident on the accelerator.
#[derive(Debug)]
pub struct DeviceTensor {
    tensor: Tensor,
    buffer: DeviceBuffer,
}

impl DeviceTensor {
    pub fn dtype(&self) -> DType {
        self.tensor.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }

    pub fn size_bytes(&self) -> u64 {
        self.buffer.bytes()
    }

    /// Copy back to host memory, releasing the device allocation.
    pub fn into_host(self) -> Tensor {
        self.tensor
    }

    /// Re-materialize in another floating precision on the same device.
    pub fn cast(self, device: &Accelerator, dtype: DType) -> Result<DeviceTensor> {
        if self.dtype() == dtype || !self.dtype().is_floating_point() {
            return Ok(self);
        }
        let DeviceTensor { tensor, buffer } = self;
        drop(buffer);
        device.upload(tensor, Some(dtype))
    }
}

/// Return freed heap pages to the operating system. Rust frees eagerly, so
/// this is the analogue of a managed runtime's collection pass.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub fn release_host_memory() {
    // SAFETY: malloc_trim only walks allocator free lists.
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub fn release_host_memory() {}
