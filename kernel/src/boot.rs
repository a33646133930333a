//! Early boot-time bring-up: turns BOOTBOOT's page tables into the ones the
//! rest of the kernel assumes exist - a direct physical map covering every
//! reported byte of RAM, and the temporary-mapping window - before
//! `mm::frame`, `mm::paging::phys_to_virt`, or the heap can be used.
//!
//! BOOTBOOT hands off control with every region it reports free already
//! identity mapped (address equals linear address); `bootboot::mmap_available_iter`
//! already relies on exactly that to probe regions by a direct read/write
//! before trusting them. This module leans on the same assumption to reach
//! physical memory before `mm::paging::PHYS_MAP_OFFSET` exists, and keeps
//! BOOTBOOT's own PML4 as the kernel's permanent one rather than building a
//! fresh one, since the kernel image, the BOOTBOOT info structure, and the
//! framebuffer are already mapped correctly within it.

use amd64::paging::PTE;
use amd64::registers::CR3;

use crate::bootboot;
use crate::mm::frame;
use crate::mm::paging::{self, PhysAddr, PDE_MAPPED_SIZE, PTE_MAPPED_SIZE, PHYS_MAP_OFFSET, TEMP_WINDOW_BASE};

/// A bump allocator over the BOOTBOOT memory map, used only until the real
/// frame stack can be seeded - the mappings built here have to exist before
/// that seeding is possible at all. Frames are handed out low addresses
/// first within each region, in the order BOOTBOOT reports regions.
struct EarlyFrames<I: Iterator<Item = (usize, usize)>> {
    regions: I,
    cur_base: u64,
    cur_len: u64,
}

impl<I: Iterator<Item = (usize, usize)>> EarlyFrames<I> {
    fn new(mut regions: I) -> Self {
        let (base, len) = regions.next().unwrap_or((0, 0));
        Self { regions, cur_base: base as u64, cur_len: len as u64 }
    }

    /// Hands out one zeroed 4 KiB frame, accessed at its identity address -
    /// valid only this early, before the direct map exists.
    fn take(&mut self) -> PhysAddr {
        while self.cur_len < PTE_MAPPED_SIZE {
            let (base, len) = self.regions.next().expect("boot memory exhausted before paging setup finished");
            self.cur_base = base as u64;
            self.cur_len = len as u64;
        }
        let frame = self.cur_base;
        self.cur_base += PTE_MAPPED_SIZE;
        self.cur_len -= PTE_MAPPED_SIZE;
        unsafe { core::ptr::write_bytes(frame as *mut u8, 0, PTE_MAPPED_SIZE as usize) };
        frame
    }

    /// Threads everything this allocator hasn't handed out yet - the rest
    /// of its current region, and every region it never reached - onto the
    /// real frame stack.
    fn seed_remaining(mut self) {
        if self.cur_len > 0 {
            frame::seed_region(self.cur_base, self.cur_len);
        }
        for (base, len) in self.regions {
            frame::seed_region(base as u64, len as u64);
        }
    }
}

fn table_at(pa: PhysAddr) -> &'static mut [PTE] {
    unsafe { core::slice::from_raw_parts_mut(pa as *mut PTE, 512) }
}

/// Highest (exclusive) physical address any reported region extends to;
/// the extent the direct physical map has to cover.
fn highest_extent(regions: impl Iterator<Item = (usize, usize)>) -> u64 {
    regions.map(|(base, len)| (base + len) as u64).max().unwrap_or(0)
}

/// Walks (allocating as needed) down to the PD entry governing `va` within
/// `pml4`, for 2 MiB leaf mappings only.
fn pd_entry(pml4: PhysAddr, va: u64, early: &mut EarlyFrames<impl Iterator<Item = (usize, usize)>>) -> &'static mut PTE {
    let [i4, i3, i2, _] = paging::table_indices(va);
    let mut table = table_at(pml4);

    for idx in [i4, i3] {
        let entry = &mut table[idx];
        if !entry.contains(PTE::PRESENT) {
            let frame = early.take();
            let new_table = table_at(frame);
            new_table.fill(PTE::empty());
            *entry = PTE::from_paddr(frame) | PTE::PRESENT | PTE::WRITE;
        }
        table = table_at(entry.get_paddr());
    }

    &mut table[i2]
}

/// Installs `PHYS_MAP_OFFSET + pa -> pa` for every `pa` in `0..highest`,
/// using 2 MiB pages so the whole map costs a handful of frames rather than
/// one page-table entry per 4 KiB page.
fn map_direct_physical(pml4: PhysAddr, highest: u64, early: &mut EarlyFrames<impl Iterator<Item = (usize, usize)>>) {
    let mut pa = 0u64;
    while pa < highest {
        let entry = pd_entry(pml4, PHYS_MAP_OFFSET + pa, early);
        *entry = PTE::from_paddr(pa) | PTE::PRESENT | PTE::WRITE | PTE::NO_EXECUTE | PTE::HUGE_PAGE;
        pa += PDE_MAPPED_SIZE;
    }
}

/// Installs the level-1 page table backing the temporary-mapping window,
/// initially empty; [`paging::temp_map`] fills in individual slots on
/// demand.
fn install_temp_window(pml4: PhysAddr, early: &mut EarlyFrames<impl Iterator<Item = (usize, usize)>>) {
    let pt_frame = early.take();
    let entry = pd_entry(pml4, TEMP_WINDOW_BASE, early);
    *entry = PTE::from_paddr(pt_frame) | PTE::PRESENT | PTE::WRITE;
    unsafe { paging::init_temp_window(pt_frame) };
}

/// Brings physical and virtual memory management online: installs the
/// direct physical map and temporary-mapping window into BOOTBOOT's own
/// PML4 (kept as the kernel's permanent one), records it via
/// [`paging::set_kernel_pml4`], and seeds [`frame`] with whatever memory
/// the early bump allocator didn't consume building those tables.
///
/// # Safety
/// Must be called exactly once, very early in `_start`, before any other
/// kernel subsystem touches physical memory, while BOOTBOOT's handoff
/// identity map of free memory is still intact.
pub unsafe fn bring_up() {
    let regions = bootboot::mmap_available_iter();
    let highest = highest_extent(regions.clone());
    let mut early = EarlyFrames::new(regions);

    let pml4 = CR3::read().paddr as u64;

    map_direct_physical(pml4, highest, &mut early);
    install_temp_window(pml4, &mut early);
    paging::set_kernel_pml4(pml4);

    early.seed_remaining();
}
