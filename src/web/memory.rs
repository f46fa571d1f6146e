//! Accelerator and host memory snapshot for the `/memory` endpoint.

use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

use super::device::Accelerator;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;
const NOT_AVAILABLE: &str = "Not Available";

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum GpuMemory {
    Available {
        allocated_gb: f64,
        reserved_gb: f64,
        peak_gb: f64,
        capacity_gb: f64,
    },
    NotAvailable(&'static str),
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    pub gpu: GpuMemory,
    pub process_rss_gb: f64,
    pub process_percent: f64,
    pub system_used_gb: f64,
    pub system_total_gb: f64,
    pub system_percent: f64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        round2(part as f64 * 100.0 / total as f64)
    }
}

pub fn memory_report(accelerator: &Accelerator) -> MemoryReport {
    let gpu = if accelerator.is_accelerator() {
        let stats = accelerator.memory_stats();
        GpuMemory::Available {
            allocated_gb: round2(stats.allocated_gb()),
            reserved_gb: round2(stats.reserved_gb()),
            peak_gb: round2(stats.peak_gb()),
            capacity_gb: round2(stats.capacity_gb()),
        }
    } else {
        GpuMemory::NotAvailable(NOT_AVAILABLE)
    };

    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    let used = sys.used_memory();

    let rss = match sysinfo::get_current_pid() {
        Ok(pid) => {
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            sys.process(pid).map(|p| p.memory()).unwrap_or(0)
        }
        Err(_) => 0,
    };

    MemoryReport {
        gpu,
        process_rss_gb: round2(rss as f64 / GB),
        process_percent: percent(rss, total),
        system_used_gb: round2(used as f64 / GB),
        system_total_gb: round2(total as f64 / GB),
        system_percent: percent(used, total),
    }
}

impl MemoryReport {
    /// Multi-line form for logs.
    pub fn to_text(&self) -> String {
        let gpu = match &self.gpu {
            GpuMemory::Available {
                allocated_gb,
                reserved_gb,
                peak_gb,
                capacity_gb,
            } => format!(
                "GPU Memory:\n  Allocated: {allocated_gb:.2} GB\n  Reserved: {reserved_gb:.2} GB\n  Peak: {peak_gb:.2} GB\n  Capacity: {capacity_gb:.2} GB"
            ),
            GpuMemory::NotAvailable(text) => format!("GPU Memory: {text}"),
        };
        format!(
            "{gpu}\nProcess Memory:\n  RSS: {:.2} GB ({:.2}%)\nSystem Memory:\n  Used: {:.2} GB / {:.2} GB ({:.2}%)",
            self.process_rss_gb,
            self.process_percent,
            self.system_used_gb,
            self.system_total_gb,
            self.system_percent
        )
    }
}
