//! The kernel's own heap: backs every `alloc::` allocation (the process and
//! thread arenas, `Vec`s hanging off services/timers/address spaces, and
//! `format_args!` scratch space for `println!`).
//!
//! Small, frequently-recycled fixed-size kernel objects (messages, timer
//! events) bypass this heap entirely and draw frames straight from
//! [`crate::mm::pool`]; this allocator exists for everything else.

use core::alloc::{GlobalAlloc, Layout};

use linked_list_allocator::LockedHeap;

use crate::mm::frame;
use crate::mm::paging::{self, PhysAddr, VirtAddr, PTE_MAPPED_SIZE};

/// Wraps [`LockedHeap`] so that a failed allocation grows the backing
/// region once and retries before giving up, rather than handing the
/// allocator crate's unstable `#[alloc_error_handler]` a decision it can't
/// act on (that hook must diverge; it cannot ask `alloc` to try again).
struct GrowingHeap(LockedHeap);

unsafe impl GlobalAlloc for GrowingHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let first = self.0.alloc(layout);
        if !first.is_null() {
            return first;
        }
        if grow() {
            self.0.alloc(layout)
        } else {
            core::ptr::null_mut()
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.0.dealloc(ptr, layout);
    }
}

#[global_allocator]
static ALLOCATOR: GrowingHeap = GrowingHeap(LockedHeap::empty());

/// Virtual base of the kernel heap, a fixed region of the shared top-level
/// slot reserved below the temporary-mapping window.
const HEAP_BASE: VirtAddr = paging::TEMP_WINDOW_BASE - HEAP_MAX_SIZE;
/// Upper bound the heap may grow to before `AllocError` becomes real.
const HEAP_MAX_SIZE: u64 = 512 * 1024 * 1024;
/// Pages mapped in up front; [`grow`] extends this lazily from the
/// allocation-error handler.
const HEAP_INITIAL_PAGES: u64 = 256;

/// Maps `HEAP_INITIAL_PAGES` worth of fresh frames at [`HEAP_BASE`] and hands
/// them to the allocator. Must run once during boot, after the kernel's own
/// PML4 and the physical direct map are live.
pub fn init() {
    map_pages(0, HEAP_INITIAL_PAGES);
    unsafe {
        ALLOCATOR.0.lock().init(HEAP_BASE as *mut u8, (HEAP_INITIAL_PAGES * PTE_MAPPED_SIZE) as usize);
    }
}

fn map_pages(from_page: u64, count: u64) {
    for page in from_page..from_page + count {
        let va = HEAP_BASE + page * PTE_MAPPED_SIZE;
        let frame: PhysAddr = frame::acquire().expect("kernel heap: out of physical memory");
        let mut alloc_frame = || frame::acquire().ok();
        unsafe {
            let table = crate::mm::paging::PageTable::from_root(paging::kernel_pml4());
            table
                .map(va, frame, false, true, false, false, &mut alloc_frame)
                .expect("kernel heap: failed to map page");
        }
    }
}

/// Extends the heap by one more batch of pages. Called from the allocation
/// error handler; gives up (returning `false`) once [`HEAP_MAX_SIZE`] would
/// be exceeded.
fn grow() -> bool {
    let current = ALLOCATOR.0.lock().size() as u64;
    if current >= HEAP_MAX_SIZE {
        return false;
    }
    let added = HEAP_INITIAL_PAGES.min((HEAP_MAX_SIZE - current) / PTE_MAPPED_SIZE);
    if added == 0 {
        return false;
    }
    map_pages(current / PTE_MAPPED_SIZE, added);
    unsafe {
        ALLOCATOR.0.lock().extend((added * PTE_MAPPED_SIZE) as usize);
    }
    true
}

#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted allocating {:?}", layout);
}
