//! Host memory held while a weight file is read.
//!
//! Lives in its own test binary because it installs a counting global
//! allocator.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

use scene_forge::web::tensor::{DType, ParameterMap, Tensor};
use scene_forge::web::weights::{write_safetensors, SafetensorsReader, WeightReader};

static CURRENT: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);

struct CountingAllocator;

fn grew(bytes: usize) {
    let now = CURRENT.fetch_add(bytes, Ordering::SeqCst) + bytes;
    PEAK.fetch_max(now, Ordering::SeqCst);
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            grew(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        CURRENT.fetch_sub(layout.size(), Ordering::SeqCst);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            if new_size >= layout.size() {
                grew(new_size - layout.size());
            } else {
                CURRENT.fetch_sub(layout.size() - new_size, Ordering::SeqCst);
            }
        }
        new_ptr
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

const MB: usize = 1024 * 1024;

#[test]
fn reading_holds_one_copy_of_the_weights() {
    let dir = std::env::temp_dir().join(format!("scene_forge_host_{}", uuid::Uuid::new_v4()));
    let path = dir.join("model.safetensors");

    {
        let mut map = ParameterMap::new();
        for i in 0..4 {
            // 16 MB each
            map.insert(format!("blocks.{i}.weight"), Tensor::zeros(vec![4 * MB], DType::F32));
        }
        write_safetensors(&map, &path).unwrap();
    }
    let file_len = std::fs::metadata(&path).unwrap().len() as usize;

    let baseline = CURRENT.load(Ordering::SeqCst);
    PEAK.store(baseline, Ordering::SeqCst);

    let read = SafetensorsReader.read(&path).unwrap();

    let held = CURRENT.load(Ordering::SeqCst) - baseline;
    let peak = PEAK.load(Ordering::SeqCst) - baseline;
    assert_eq!(read.len(), 4);
    assert_eq!(read.total_bytes(), 64 * MB);
    assert!(held >= 64 * MB, "mapping held {held} bytes");
    assert!(
        peak <= file_len + file_len / 8,
        "peak {peak} bytes while reading a {file_len} byte file"
    );

    drop(read);
    let _ = std::fs::remove_dir_all(&dir);
}
