//! The physical frame allocator: a LIFO stack of free 4 KiB frames whose
//! link word is stored inside each free frame itself, so the stack costs no
//! separate bookkeeping memory. `acquire` zeroes what it hands out;
//! `release` only ever writes the single link word.

use spin::Mutex;

use super::paging::{self, PhysAddr, TempSlot};
use crate::mm::pool::drain_all_pools;
use perception_abi::Error;

struct FrameStack {
    head: Option<PhysAddr>,
    free_count: usize,
}

static FRAMES: Mutex<FrameStack> = Mutex::new(FrameStack { head: None, free_count: 0 });

/// Threads a single frame onto the free stack. Used directly by boot setup,
/// which has its own bulk-threading fast path; general callers should go
/// through [`release`].
fn push_raw(stack: &mut FrameStack, frame: PhysAddr) {
    unsafe {
        let link = paging::temp_map(frame, TempSlot::FrameLink) as *mut u64;
        link.write_volatile(stack.head.unwrap_or(u64::MAX));
    }
    stack.head = Some(frame);
    stack.free_count += 1;
}

/// Threads every page of `base..base + len` onto the free stack, from the
/// top down, so that low addresses are popped first. Called once per
/// surviving multiboot memory-map region during boot.
pub fn seed_region(base: PhysAddr, len: u64) {
    let mut stack = FRAMES.lock();
    let page_count = len / paging::PTE_MAPPED_SIZE;
    for i in (0..page_count).rev() {
        push_raw(&mut stack, base + i * paging::PTE_MAPPED_SIZE);
    }
}

/// Pops a frame off the free stack and zeroes it. If the stack is
/// momentarily empty, every kernel object pool is asked to return spare
/// frames before giving up with `OutOfMemory`.
pub fn acquire() -> Result<PhysAddr, Error> {
    {
        let mut stack = FRAMES.lock();
        if let Some(frame) = pop_raw(&mut stack) {
            zero_frame(frame);
            return Ok(frame);
        }
    }

    drain_all_pools();

    let mut stack = FRAMES.lock();
    match pop_raw(&mut stack) {
        Some(frame) => {
            zero_frame(frame);
            Ok(frame)
        }
        None => Err(Error::OutOfMemory),
    }
}

fn pop_raw(stack: &mut FrameStack) -> Option<PhysAddr> {
    let frame = stack.head?;
    let next = unsafe {
        let link = paging::temp_map(frame, TempSlot::FrameLink) as *const u64;
        link.read_volatile()
    };
    stack.head = if next == u64::MAX { None } else { Some(next) };
    stack.free_count -= 1;
    Some(frame)
}

fn zero_frame(frame: PhysAddr) {
    unsafe {
        let ptr = paging::phys_to_virt(frame).cast::<u64>();
        core::ptr::write_bytes(ptr, 0, paging::PTE_MAPPED_SIZE as usize / 8);
    }
}

/// Returns `frame` to the free stack.
pub fn release(frame: PhysAddr) {
    let mut stack = FRAMES.lock();
    push_raw(&mut stack, frame);
}

/// Number of frames currently on the free stack. Diagnostic only; there is
/// no guarantee this many `acquire()` calls will all succeed without a
/// `release` in between, since pool draining can add to the count.
pub fn free_frame_count() -> usize {
    FRAMES.lock().free_count
}
