//! The four-level x86-64 page-table walker and the temporary mapping window
//! it uses to touch arbitrary physical frames without a permanent mapping.
//!
//! All of physical memory is additionally direct-mapped at a fixed offset
//! (`PHYS_MAP_OFFSET`) during `paging_setup`, the same trick the bootstrap
//! code uses to reach page tables before the heap exists. The temporary
//! window below exists for code that must map a frame that (by contract)
//! falls outside that direct map - the sole case in this kernel is none in
//! practice, but the slot machinery is kept as the architecturally-specified
//! mechanism lazily-allocated shared pages and table-to-table copies rely on
//! so that `throw_on_access` entries can be installed without ever reading
//! through a mapping that doesn't yet exist.

use amd64::paging::PTE;
use spin::Mutex;

pub use amd64::paging::{PDE_MAPPED_SIZE, PDPE_MAPPED_SIZE, PML4E_MAPPED_SIZE, PTE_MAPPED_SIZE};

/// A 4 KiB aligned physical address.
pub type PhysAddr = u64;
/// A canonical 48-bit (sign-extended) virtual address.
pub type VirtAddr = u64;

/// Offset at which the entirety of physical memory is linearly mapped,
/// read-write, no-execute, for the kernel's own use.
pub const PHYS_MAP_OFFSET: u64 = amd64::paging::CANONICAL_HIGHER_HALF + amd64::paging::PML4E_MAPPED_SIZE;

/// The lower bound of the canonical higher half; everything below this is
/// user-space, everything at or above is kernel-space. Every PML4 slot
/// spanning the higher half is reserved for the kernel and shared by every
/// address space, so no cross-process broadcast of kernel mappings is
/// needed - the direct physical map, the temporary-mapping window, and the
/// kernel image itself all live somewhere in this range.
pub const USER_VA_UPPER_BOUND: u64 = amd64::paging::CANONICAL_LOWER_HALF;
/// First PML4 slot of the shared higher half (inclusive); every slot from
/// here to 511 is copied verbatim into freshly built address spaces.
pub const KERNEL_PML4_SLOT_BASE: usize = 256;

#[inline]
pub fn phys_to_virt(pa: PhysAddr) -> *mut u8 {
    (pa + PHYS_MAP_OFFSET) as *mut u8
}

#[inline]
pub fn virt_to_phys_direct(va: *const u8) -> PhysAddr {
    va as u64 - PHYS_MAP_OFFSET
}

/// The closed enumeration of temporary-mapping slots. Operations needing
/// more than one simultaneous temporary mapping (table-to-table copies) each
/// reserve their own named slot so they never collide.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempSlot {
    /// Used by the frame allocator to read/write a free frame's link word.
    FrameLink = 0,
    /// Source side of a table-to-table copy.
    CopySrc = 1,
    /// Destination side of a table-to-table copy.
    CopyDst = 2,
    /// Scratch slot used while tearing down an address space.
    Teardown = 3,
}

/// Number of slots in the closed enumeration above.
pub const TEMP_SLOT_COUNT: usize = 4;

/// Virtual base of the 2 MiB temporary-mapping window. One level-1 page
/// table backs the whole window, giving 512 addressable slots; only the
/// first [`TEMP_SLOT_COUNT`] are ever used.
pub const TEMP_WINDOW_BASE: u64 = amd64::paging::CANONICAL_HIGHER_HALF + PML4E_MAPPED_SIZE - PDE_MAPPED_SIZE;

struct TempWindow {
    /// Physical address of the level-1 page table backing the window.
    /// `None` until `init` installs it.
    table: Option<PhysAddr>,
}

static TEMP_WINDOW: Mutex<TempWindow> = Mutex::new(TempWindow { table: None });

/// Installs the temporary-mapping window's backing page table. Must be
/// called once, early in boot, before any `temp_map` call.
///
/// # Safety
/// `table_frame` must be a freshly-acquired, zeroed physical frame, and
/// `TEMP_WINDOW_BASE` must fall within a region of the kernel's page tables
/// that is otherwise unused.
pub unsafe fn init_temp_window(table_frame: PhysAddr) {
    TEMP_WINDOW.lock().table = Some(table_frame);
}

fn temp_window_table() -> &'static mut [PTE] {
    let table = TEMP_WINDOW.lock().table.expect("temp window not initialised");
    unsafe { core::slice::from_raw_parts_mut(phys_to_virt(table).cast(), 512) }
}

/// Maps `frame` into the temporary window at `slot`, returning a pointer to
/// its content. Rewrites the slot's PTE only if it currently points
/// elsewhere, and invalidates exactly that one virtual page.
///
/// # Safety
/// The caller must not hold a `temp_map` pointer for `slot` across a call
/// that remaps the same slot, and must not alias the frame through any
/// other mutable reference for the lifetime of the returned pointer.
pub unsafe fn temp_map(frame: PhysAddr, slot: TempSlot) -> *mut u8 {
    let idx = slot as usize;
    let va = TEMP_WINDOW_BASE + idx as u64 * PTE_MAPPED_SIZE;
    let table = temp_window_table();
    let desired = PTE::from_paddr(frame) | PTE::PRESENT | PTE::WRITE | PTE::NO_EXECUTE;
    if table[idx] != desired {
        table[idx] = desired;
        invlpg(va);
    }
    va as *mut u8
}

#[inline]
fn invlpg(va: VirtAddr) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
}

/// Page table indices `[pml4, pdpt, pd, pt]` for a canonical virtual address.
#[inline]
pub fn table_indices(va: VirtAddr) -> [usize; 4] {
    [
        amd64::paging::pml4t_index(va),
        amd64::paging::pdpt_index(va),
        amd64::paging::pdt_index(va),
        amd64::paging::pt_index(va),
    ]
}

static KERNEL_PML4: Mutex<Option<PhysAddr>> = Mutex::new(None);

/// Records the kernel's own PML4, built during boot. Every subsequent
/// address space copies its slot 511 (`KERNEL_PML4_SLOT`) from this one so
/// kernel mappings never need broadcasting to other address spaces.
///
/// # Safety
/// Must be called exactly once, after the kernel's own page tables (with
/// every kernel mapping already installed in slot 511) are live.
pub unsafe fn set_kernel_pml4(pml4: PhysAddr) {
    *KERNEL_PML4.lock() = Some(pml4);
}

pub fn kernel_pml4() -> PhysAddr {
    KERNEL_PML4.lock().expect("kernel PML4 not yet initialised")
}

/// Builds a fresh PML4 for a new address space: a zeroed frame with every
/// higher-half slot copied verbatim from the kernel's own table, so kernel
/// mappings (phys map, temp window, kernel image, heap) are visible without
/// further work, no matter which process's CR3 the kernel happens to be
/// running under.
pub fn new_address_space_pml4(frame: PhysAddr) {
    let table = PageTable::table_at(frame);
    table.fill(PTE::empty());
    let kernel_table = PageTable::table_at(kernel_pml4());
    table[KERNEL_PML4_SLOT_BASE..512].copy_from_slice(&kernel_table[KERNEL_PML4_SLOT_BASE..512]);
}

/// A live four-level page table hierarchy rooted at a physical frame.
pub struct PageTable {
    pub pml4: PhysAddr,
}

impl PageTable {
    /// Wraps an already-constructed PML4 physical frame.
    pub const fn from_root(pml4: PhysAddr) -> Self {
        Self { pml4 }
    }

    fn table_at(pa: PhysAddr) -> &'static mut [PTE] {
        unsafe { core::slice::from_raw_parts_mut(phys_to_virt(pa).cast(), 512) }
    }

    /// Walks (and, if `create`, allocates) the page tables down to the PTE
    /// governing `va`, using `alloc_frame` for any missing intermediate
    /// table. Returns `None` if a level is missing and `create` is false.
    fn walk(
        &self,
        va: VirtAddr,
        create: bool,
        alloc_frame: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Option<*mut PTE> {
        let [i4, i3, i2, i1] = table_indices(va);
        let mut table = Self::table_at(self.pml4);

        for &idx in &[i4, i3, i2] {
            let entry = &mut table[idx];
            if !entry.contains(PTE::PRESENT) {
                if !create {
                    return None;
                }
                let frame = alloc_frame()?;
                let new_table = Self::table_at(frame);
                new_table.fill(PTE::empty());
                *entry = PTE::from_paddr(frame) | PTE::PRESENT | PTE::WRITE | PTE::USERLAND;
            }
            table = Self::table_at(entry.get_paddr());
        }

        Some(&mut table[i1] as *mut PTE)
    }

    /// Maps a single 4 KiB page. `throw_on_access` installs a
    /// present-but-reserved entry (see [`PTE_RESERVED`]) that faults on any
    /// access instead of silently mapping garbage, used for lazily
    /// allocated shared-memory pages.
    ///
    /// # Safety
    /// `pa` must be an owned-or-shared frame appropriate for `own`, and
    /// `alloc_frame` must return frames this page table is allowed to use
    /// for its own bookkeeping.
    pub unsafe fn map(
        &self,
        va: VirtAddr,
        pa: PhysAddr,
        own: bool,
        writable: bool,
        user: bool,
        throw_on_access: bool,
        alloc_frame: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Result<(), ()> {
        let entry_ptr = self.walk(va, true, alloc_frame).ok_or(())?;
        let mut flags = PTE::empty();
        if writable {
            flags |= PTE::WRITE;
        }
        if user {
            flags |= PTE::USERLAND;
        }
        if own {
            flags |= PTE_OWNED;
        }
        if throw_on_access {
            // Present so the entry doesn't read as "entirely absent" to
            // debugging tools, but access is denied via !PRESENT in the
            // hardware sense is contradictory; instead we mark it absent
            // and stash the "this is lazy, not truly unmapped" bit so the
            // page-fault handler can tell the two cases apart.
            unsafe { *entry_ptr = PTE::from_paddr(pa) | flags | PTE_LAZY };
        } else {
            unsafe { *entry_ptr = PTE::from_paddr(pa) | flags | PTE::PRESENT };
        }
        invlpg(va);
        Ok(())
    }

    /// Unmaps a single page, returning the frame that was mapped there (if
    /// any) together with whether the ownership bit was set.
    pub fn unmap(&self, va: VirtAddr) -> Option<(PhysAddr, bool)> {
        let entry_ptr = self.walk(va, false, &mut || None)?;
        let entry = unsafe { *entry_ptr };
        if !entry.contains(PTE::PRESENT) && !entry.contains(PTE_LAZY) {
            return None;
        }
        let owned = entry.contains(PTE_OWNED);
        let pa = entry.get_paddr();
        unsafe { *entry_ptr = PTE::empty() };
        invlpg(va);
        Some((pa, owned))
    }

    /// True if `va` is mapped with `PTE_LAZY` set: present-but-reserved,
    /// i.e. a lazily allocated shared page awaiting materialisation.
    pub fn is_lazy_reserved(&self, va: VirtAddr) -> bool {
        match self.walk(va, false, &mut || None) {
            Some(ptr) => unsafe { (*ptr).contains(PTE_LAZY) && !(*ptr).contains(PTE::PRESENT) },
            None => false,
        }
    }

    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let entry_ptr = self.walk(va, false, &mut || None)?;
        let entry = unsafe { *entry_ptr };
        entry.contains(PTE::PRESENT).then(|| entry.get_paddr())
    }
}

// Two software-defined bits (available to the OS per the AMD64 spec) used
// as private bookkeeping conventions on top of `amd64::paging::PTE`. Both
// fall within `PTE::AVAILABLE_MASK_0`, so direct bit construction is sound.
/// Bit 9: set exactly when the owning process should release the underlying
/// frame on unmap.
pub const PTE_OWNED: PTE = unsafe { PTE::from_bits_unchecked(1 << 9) };
/// Bit 10: set on a present-but-reserved entry installed for a lazily
/// allocated shared-memory page that hasn't been materialised yet.
pub const PTE_LAZY: PTE = unsafe { PTE::from_bits_unchecked(1 << 10) };
