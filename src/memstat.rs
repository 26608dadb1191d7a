//! Per-service allocation accounting.
//!
//! [`CountingAlloc`] wraps the system allocator: every block gets an
//! 8-byte trailer recording the service the allocating thread was
//! dispatching for, and the byte/block counters plus a 65,536-slot
//! per-service table are kept in step on alloc and free. Install it with
//! `#[global_allocator]` (the binary does); the library works identically
//! without it, the counters just stay at zero.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};

use crate::handle::Handle;

/// Trailer appended to every allocation: the owning handle, padded to 8.
const PREFIX_SIZE: usize = 8;

const SLOT_SIZE: usize = 0x10000;

static USED_MEMORY: AtomicUsize = AtomicUsize::new(0);
static MEMORY_BLOCKS: AtomicUsize = AtomicUsize::new(0);

struct MemData {
    handle: AtomicU32,
    allocated: AtomicI64,
}

#[allow(clippy::declare_interior_mutable_const)]
const MEM_DATA_INIT: MemData = MemData {
    handle: AtomicU32::new(0),
    allocated: AtomicI64::new(0),
};

static MEM_STATS: [MemData; SLOT_SIZE] = [MEM_DATA_INIT; SLOT_SIZE];

/// Total live heap bytes attributed by the wrapper.
pub fn used_memory() -> usize {
    USED_MEMORY.load(Ordering::Relaxed)
}

/// Total live allocation count.
pub fn memory_blocks() -> usize {
    MEMORY_BLOCKS.load(Ordering::Relaxed)
}

/// Live bytes attributed to `handle`, if its slot is currently owned by it.
pub fn service_memory(handle: Handle) -> Option<i64> {
    let data = &MEM_STATS[handle as usize & (SLOT_SIZE - 1)];
    (data.handle.load(Ordering::Relaxed) == handle)
        .then(|| data.allocated.load(Ordering::Relaxed))
}

/// Find (or claim) the accounting slot for `handle`. A slot owned by a
/// retired service is evicted once its running count has fallen to zero
/// or below; counts can dip negative because blocks allocated before the
/// wrapper was installed are freed through it.
fn allocated_field(handle: Handle) -> Option<&'static AtomicI64> {
    let data = &MEM_STATS[handle as usize & (SLOT_SIZE - 1)];
    let old_handle = data.handle.load(Ordering::Relaxed);
    let old_alloc = data.allocated.load(Ordering::Relaxed);
    if old_handle == 0 || old_alloc <= 0 {
        if data
            .handle
            .compare_exchange(old_handle, handle, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        if old_alloc < 0 {
            let _ = data.allocated.compare_exchange(
                old_alloc,
                0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }
    if data.handle.load(Ordering::Relaxed) != handle {
        return None;
    }
    Some(&data.allocated)
}

fn stat_alloc(handle: Handle, bytes: usize) {
    USED_MEMORY.fetch_add(bytes, Ordering::Relaxed);
    MEMORY_BLOCKS.fetch_add(1, Ordering::Relaxed);
    if let Some(allocated) = allocated_field(handle) {
        allocated.fetch_add(bytes as i64, Ordering::Relaxed);
    }
}

fn stat_free(handle: Handle, bytes: usize) {
    USED_MEMORY.fetch_sub(bytes, Ordering::Relaxed);
    MEMORY_BLOCKS.fetch_sub(1, Ordering::Relaxed);
    if let Some(allocated) = allocated_field(handle) {
        allocated.fetch_sub(bytes as i64, Ordering::Relaxed);
    }
}

/// System-allocator wrapper that attributes every block to the service the
/// current thread is dispatching for.
pub struct CountingAlloc;

impl CountingAlloc {
    pub const fn new() -> Self {
        CountingAlloc
    }

    // the trailer starts at the original size; alignment is unchanged
    fn padded(layout: Layout) -> Option<Layout> {
        Layout::from_size_align(layout.size().checked_add(PREFIX_SIZE)?, layout.align()).ok()
    }
}

impl Default for CountingAlloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(padded) = Self::padded(layout) else {
            return std::ptr::null_mut();
        };
        let ptr = System.alloc(padded);
        if ptr.is_null() {
            return ptr;
        }
        let handle = crate::context::current_handle();
        std::ptr::write_unaligned(ptr.add(layout.size()).cast::<u32>(), handle);
        stat_alloc(handle, padded.size());
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(padded) = Self::padded(layout) else {
            // alloc never hands out a block whose padded layout overflows
            System.dealloc(ptr, layout);
            return;
        };
        let handle = std::ptr::read_unaligned(ptr.add(layout.size()).cast::<u32>());
        stat_free(handle, padded.size());
        System.dealloc(ptr, padded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_balance() {
        let alloc = CountingAlloc::new();
        let layout = Layout::from_size_align(100, 8).unwrap();

        let before_bytes = used_memory();
        let before_blocks = memory_blocks();

        // attribute to a fake service address
        crate::context::init_thread(crate::context::ThreadKind::Main);
        let ptr = unsafe { alloc.alloc(layout) };
        assert!(!ptr.is_null());
        assert_eq!(used_memory() - before_bytes, 100 + PREFIX_SIZE);
        assert_eq!(memory_blocks() - before_blocks, 1);

        unsafe { alloc.dealloc(ptr, layout) };
        assert_eq!(used_memory(), before_bytes);
        assert_eq!(memory_blocks(), before_blocks);
    }

    #[test]
    fn slot_tracks_owner_and_evicts_retired() {
        // use high slot indices unlikely to collide with other tests
        let a: Handle = 0x0100_F0F0;
        let b: Handle = 0x0200_F0F0; // same slot as `a`

        let fa = allocated_field(a).unwrap();
        fa.fetch_add(64, Ordering::Relaxed);

        // a still owns the slot: b cannot claim it
        assert!(allocated_field(b).is_none());

        // once a's count drains, b takes over
        fa.fetch_sub(64, Ordering::Relaxed);
        let fb = allocated_field(b).unwrap();
        fb.fetch_add(8, Ordering::Relaxed);
        assert_eq!(service_memory(b), Some(8));
        assert_eq!(service_memory(a), None);
        fb.fetch_sub(8, Ordering::Relaxed);
    }
}
