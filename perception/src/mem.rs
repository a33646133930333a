//! Anonymous memory allocation wrappers: pages allocated directly from the
//! caller's address space, as distinct from the heap ([`crate::heap`]) that
//! sits on top of them.

use perception_abi::{Error, Syscall};

use crate::syscall::{call0, call1};

pub const PAGE_SIZE: u64 = 4096;

/// Allocates `pages` anonymous, zeroed, writable pages in the caller's
/// address space, returning the base virtual address.
pub fn allocate_pages(pages: u64) -> Result<u64, Error> {
    call1(Syscall::AllocateMemoryPages, pages, 0, 0, 0, 0, 0, 0, 0)
}

pub fn release_pages(base: u64) -> Result<(), Error> {
    call0(Syscall::ReleaseMemoryPages, base, 0, 0, 0, 0, 0, 0, 0)
}

pub fn free_system_memory_pages() -> u64 {
    call1(Syscall::GetFreeSystemMemory, 0, 0, 0, 0, 0, 0, 0, 0).unwrap_or(0)
}

/// Reserves (without backing) `pages` of virtual address space starting
/// exactly at `va`. Used by the ELF loader and the MMF server, both of
/// which need specific addresses rather than whatever the allocator would
/// otherwise pick.
pub fn map_free_memory_at(va: u64, pages: u64) -> Result<(), Error> {
    call0(Syscall::MapFreeMemoryAtAddress, va, pages, 0, 0, 0, 0, 0, 0)
}

/// Maps `pages` starting at physical address `pa` into the caller's address
/// space, read-write. Driver-only in practice (the kernel doesn't check,
/// but only a driver has any legitimate physical address to hand it).
pub fn map_physical_memory(pa: u64, pages: u64) -> Result<u64, Error> {
    call1(Syscall::MapPhysicalMemory, pa, pages, 0, 0, 0, 0, 0, 0)
}
