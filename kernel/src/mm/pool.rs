//! A type-parameterised slab pool for small, frequently allocated kernel
//! objects (messages, timer events, ...). Each pool carves acquired physical
//! frames into fixed-size slots and keeps its own free-list; under memory
//! pressure the frame allocator asks every registered pool to return frames
//! that are entirely unused before declaring `OutOfMemory`.

use alloc::vec::Vec;
use core::mem::MaybeUninit;

use spin::Mutex;

use super::frame;
use super::paging::{self, PhysAddr};
use perception_abi::Error;

trait Drainable: Send {
    /// Returns any currently wholly-unused backing frames to the frame
    /// allocator. Returns the number of frames released.
    fn drain(&self) -> usize;
}

static REGISTRY: Mutex<Vec<&'static (dyn Drainable + Sync)>> = Mutex::new(Vec::new());

/// Called by the frame allocator when its free stack runs dry.
pub fn drain_all_pools() {
    for pool in REGISTRY.lock().iter() {
        pool.drain();
    }
}

struct FrameSlab<T> {
    frame: PhysAddr,
    /// Number of slots in this frame currently handed out.
    in_use: usize,
}

struct Inner<T> {
    slots_per_frame: usize,
    frames: Vec<FrameSlab<T>>,
    free: Vec<*mut MaybeUninit<T>>,
}

// SAFETY: `Pool<T>` is only ever touched behind its own `Mutex`; raw
// pointers inside point at kernel-owned frames, not at anything `T: !Send`
// would care about.
unsafe impl<T> Send for Inner<T> {}

/// A slab pool of `T`. Intended to back a single global `static`.
pub struct Pool<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Pool<T> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { slots_per_frame: 0, frames: Vec::new(), free: Vec::new() }),
        }
    }

    fn slots_per_frame() -> usize {
        (paging::PTE_MAPPED_SIZE as usize) / core::mem::size_of::<MaybeUninit<T>>().max(1)
    }

    /// Allocates one `T`-sized slot, growing the pool by one frame if
    /// necessary.
    pub fn alloc(&self) -> Result<*mut MaybeUninit<T>, Error> {
        let mut inner = self.inner.lock();
        if inner.free.is_empty() {
            let frame = frame::acquire()?;
            let spf = Self::slots_per_frame();
            inner.slots_per_frame = spf;
            let base = paging::phys_to_virt(frame).cast::<MaybeUninit<T>>();
            for i in 0..spf {
                inner.free.push(unsafe { base.add(i) });
            }
            inner.frames.push(FrameSlab { frame, in_use: 0 });
        }
        let ptr = inner.free.pop().expect("just ensured free slot availability");
        let frame_idx = self.frame_index_of(&inner, ptr);
        inner.frames[frame_idx].in_use += 1;
        Ok(ptr)
    }

    /// Returns a slot previously handed out by `alloc`.
    ///
    /// # Safety
    /// `ptr` must have come from this pool's `alloc` and not already have
    /// been freed.
    pub unsafe fn free(&self, ptr: *mut MaybeUninit<T>) {
        let mut inner = self.inner.lock();
        let frame_idx = self.frame_index_of(&inner, ptr);
        inner.frames[frame_idx].in_use -= 1;
        inner.free.push(ptr);
    }

    fn frame_index_of(&self, inner: &Inner<T>, ptr: *mut MaybeUninit<T>) -> usize {
        let addr = ptr as usize;
        inner
            .frames
            .iter()
            .position(|f| {
                let base = paging::phys_to_virt(f.frame) as usize;
                addr >= base && addr < base + paging::PTE_MAPPED_SIZE as usize
            })
            .expect("pool pointer not owned by any of this pool's frames")
    }
}

impl<T> Drainable for Pool<T> {
    fn drain(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut released = 0;
        let spf = inner.slots_per_frame;
        inner.frames.retain(|f| {
            if f.in_use != 0 {
                return true;
            }
            let base = paging::phys_to_virt(f.frame).cast::<MaybeUninit<T>>();
            inner.free.retain(|&p| {
                let within = (p as usize) >= (base as usize) && (p as usize) < (base as usize) + spf * core::mem::size_of::<MaybeUninit<T>>();
                !within
            });
            frame::release(f.frame);
            released += 1;
            false
        });
        released
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers `pool` with the global drain registry. Call once per
/// `static Pool<T>` during kernel init.
pub fn register<T: 'static>(pool: &'static Pool<T>)
where
    Pool<T>: Sync,
{
    REGISTRY.lock().push(pool);
}
