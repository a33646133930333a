//! Named shared-memory segment wrappers.

use perception_abi::{Error, SegmentId, SharedMemoryFlags, Syscall};

use crate::syscall::{call0, call1};

/// Creates a segment of `pages` pages. If `flags` includes
/// `LAZILY_ALLOCATED`, `lazy_message_id` is the message id the creator
/// wants lazy-page-miss notifications delivered on; ignored otherwise.
pub fn create(pages: u64, flags: SharedMemoryFlags, lazy_message_id: u64) -> Result<SegmentId, Error> {
    call1(Syscall::CreateSharedMemory, pages, flags.bits(), lazy_message_id, 0, 0, 0, 0, 0)
}

pub fn join(segment: SegmentId) -> Result<u64, Error> {
    call1(Syscall::JoinSharedMemory, segment, 0, 0, 0, 0, 0, 0, 0)
}

pub fn leave(segment: SegmentId) -> Result<(), Error> {
    call0(Syscall::LeaveSharedMemory, segment, 0, 0, 0, 0, 0, 0, 0)
}

/// Services a lazy-page miss: installs the page the caller prepared at
/// `page_va` (in its own address space) into `segment` at `offset_in_buffer`.
pub fn move_page_into_segment(segment: SegmentId, offset_in_buffer: u64, page_va: u64) -> Result<(), Error> {
    call0(Syscall::MovePageIntoSharedMemory, segment, offset_in_buffer, page_va, 0, 0, 0, 0, 0)
}

pub fn set_access(segment: SegmentId, joiners_can_write: bool) -> Result<(), Error> {
    call0(Syscall::SetSharedMemoryAccess, segment, joiners_can_write as u64, 0, 0, 0, 0, 0, 0)
}

pub fn size_in_pages(segment: SegmentId) -> Result<u64, Error> {
    call1(Syscall::GetSharedMemorySize, segment, 0, 0, 0, 0, 0, 0, 0)
}

pub fn flags(segment: SegmentId) -> Result<SharedMemoryFlags, Error> {
    call1(Syscall::GetSharedMemoryFlags, segment, 0, 0, 0, 0, 0, 0, 0)
        .map(SharedMemoryFlags::from_bits_truncate)
}
