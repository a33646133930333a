//! Physical and virtual memory management: the frame allocator, the page
//! table walker, the per-process address-space manager, the AA-tree free
//! range index, and the small-object slab pool.

pub mod aatree;
pub mod addrspace;
pub mod frame;
pub mod paging;
pub mod pool;
