//! The user-space heap every process in this tree allocates `alloc::` types
//! from: `Vec`s of directory entries, RPC request/reply scratch space, the
//! loader's per-module bookkeeping.
//!
//! Unlike [`crate::heap`](self) in the kernel, a process has no reserved
//! window it can extend into on demand - [`crate::mem::allocate_pages`]
//! hands back whatever base address the kernel's address-space allocator
//! finds free, which need not sit next to the previous chunk. So this heap
//! commits one fixed-size region up front and does not grow; callers that
//! need more than [`HEAP_SIZE_PAGES`] worth of live allocations are almost
//! always using the wrong primitive (shared memory, an MMF) for the job.

use linked_list_allocator::LockedHeap;

use crate::mem::{self, PAGE_SIZE};

/// Pages committed to the heap at [`init`]. 4 MiB, generous for an RPC
/// service's bookkeeping without committing physical memory a simple
/// driver or the loader will never touch.
pub const HEAP_SIZE_PAGES: u64 = 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Commits [`HEAP_SIZE_PAGES`] pages and hands them to the allocator. Must
/// run once, before any `alloc::` type is touched.
pub fn init() {
    let base = mem::allocate_pages(HEAP_SIZE_PAGES).expect("perception heap: failed to allocate backing pages");
    unsafe {
        ALLOCATOR.lock().init(base as *mut u8, (HEAP_SIZE_PAGES * PAGE_SIZE) as usize);
    }
}

#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("perception heap exhausted allocating {:?}", layout);
}
