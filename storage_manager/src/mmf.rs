//! Memory-mapped files: a `LazilyAllocated` shared segment per open MMF,
//! materialised page by page as the opener touches it.
//!
//! In the original design the lazy-page-miss IPC travels from the MMF
//! server to a separate file-system driver process; here that driver is
//! this same process (there being no separate block-device driver in this
//! tree), so the hop collapses into an ordinary function call instead of a
//! second round of messages.
//!
//! Each open MMF gets its own lazy-message id (the kernel tags a miss only
//! with `(id, offset)`, no segment id - see `kernel::ipc::shared_memory::
//! page_fault`), starting at [`FIRST_LAZY_MESSAGE_ID`] and counting up, so
//! the serve loop can tell a lazy-page miss apart from every other inbound
//! message by id alone.

use alloc::collections::BTreeMap;

use perception::{mem, shared_memory};
use perception_abi::{Error, Pid, SegmentId, SharedMemoryFlags};

use crate::block_device::{BlockDevice, SECTOR_SIZE};
use crate::iso9660::{Entry, Iso9660};

pub const FIRST_LAZY_MESSAGE_ID: u64 = 1000;

struct MappedFile {
    entry: Entry,
    segment: SegmentId,
    #[allow(dead_code)]
    creator: Pid,
}

pub struct MmfTable {
    next_lazy_id: u64,
    by_lazy_id: BTreeMap<u64, MappedFile>,
}

impl MmfTable {
    pub const fn new() -> Self {
        Self { next_lazy_id: FIRST_LAZY_MESSAGE_ID, by_lazy_id: BTreeMap::new() }
    }

    /// Creates a lazily-allocated segment the size of `entry`, returning
    /// the segment id the caller joins and the lazy-message id this table
    /// now owns for it.
    pub fn open(&mut self, entry: Entry, creator: Pid) -> Result<(SegmentId, u64), Error> {
        let lazy_id = self.next_lazy_id;
        let pages = (entry.data_length as u64).div_ceil(mem::PAGE_SIZE).max(1);
        let segment = shared_memory::create(pages, SharedMemoryFlags::LAZILY_ALLOCATED, lazy_id)?;
        self.next_lazy_id += 1;
        self.by_lazy_id.insert(lazy_id, MappedFile { entry, segment, creator });
        Ok((segment, lazy_id))
    }

    pub fn owns_message_id(&self, id: u64) -> bool {
        self.by_lazy_id.contains_key(&id)
    }

    /// Services one lazy-page-miss delivered on `lazy_id`: reads one
    /// `SECTOR_SIZE`-aligned chunk of the backing file starting at
    /// `offset` rounded down, and installs it at that aligned offset.
    pub fn handle_page_miss<D: BlockDevice>(&self, fs: &Iso9660<D>, lazy_id: u64, offset: u64) -> Result<(), Error> {
        let mapped = self.by_lazy_id.get(&lazy_id).ok_or(Error::InvalidArgument)?;
        let aligned_offset = offset - (offset % SECTOR_SIZE as u64);

        let page = mem::allocate_pages(1)?;
        let mut buf = alloc::vec![0u8; mem::PAGE_SIZE as usize];
        fs.read(&mapped.entry, aligned_offset, &mut buf)?;
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), page as *mut u8, buf.len()) };

        shared_memory::move_page_into_segment(mapped.segment, aligned_offset, page)
    }

    pub fn close(&mut self, lazy_id: u64) {
        self.by_lazy_id.remove(&lazy_id);
    }
}

impl Default for MmfTable {
    fn default() -> Self {
        Self::new()
    }
}
