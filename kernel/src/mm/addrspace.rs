//! The per-process address-space manager: tracks free and used virtual
//! ranges and drives the page-table walker to back them with physical
//! frames.
//!
//! Free ranges live in three places at once: an address-ordered doubly
//! linked list (for O(1) neighbour coalescing), and two AA-trees - one keyed
//! by starting address (to find and unlink a specific range), one keyed by
//! `(length, id)` (to find the smallest free range that satisfies a
//! request). All three always agree; every mutation updates all three
//! together.

use crate::arena::{Arena, Id};
use crate::mm::frame;
use crate::mm::paging::{PageTable, PhysAddr, VirtAddr, PTE_MAPPED_SIZE, USER_VA_UPPER_BOUND};
use crate::mm::aatree::AaTree;
use crate::utils::idlist::{IdList, Links};
use perception_abi::Error;

struct Range {
    start: VirtAddr,
    len: u64,
    free: bool,
    links: Links<Id<Range>>,
}

/// Disambiguates free ranges of equal length in the by-size tree: ties break
/// on the range's own id, which is unique and stable for its lifetime.
type SizeKey = (u64, u32);

fn size_key(len: u64, id: Id<Range>) -> SizeKey {
    (len, id.raw())
}

pub struct AddressSpace {
    ranges: Arena<Range>,
    order: IdList<Id<Range>>,
    by_addr: AaTree<VirtAddr, Id<Range>>,
    by_size: AaTree<SizeKey, Id<Range>>,
    pub page_table: PageTable,
    user_committed_pages: usize,
}

impl AddressSpace {
    /// Builds a fresh address space over `[0, USER_VA_UPPER_BOUND)`, entirely
    /// free, rooted at an already-allocated (and kernel-half-populated) PML4
    /// frame.
    pub fn new(pml4: PhysAddr) -> Self {
        let mut ranges = Arena::new();
        let mut order = IdList::new();
        let mut by_addr = AaTree::new();
        let mut by_size = AaTree::new();

        let id = ranges.insert(Range { start: 0, len: USER_VA_UPPER_BOUND, free: true, links: Links::new() });
        order.push_back(id, |i| &mut ranges.get_mut(i).unwrap().links);
        by_addr.insert(0, id);
        by_size.insert(size_key(USER_VA_UPPER_BOUND, id), id);

        Self {
            ranges,
            order,
            by_addr,
            by_size,
            page_table: PageTable::from_root(pml4),
            user_committed_pages: 0,
        }
    }

    fn unlink_free(&mut self, id: Id<Range>) {
        let r = self.ranges.get(id).unwrap();
        self.by_addr.remove(&r.start);
        self.by_size.remove(&size_key(r.len, id));
    }

    fn relink_free(&mut self, id: Id<Range>) {
        let r = self.ranges.get(id).unwrap();
        self.by_addr.insert(r.start, id);
        self.by_size.insert(size_key(r.len, id), id);
    }

    /// Reserves `len` bytes (rounded up to whole pages) of virtual address
    /// space anywhere free, marking it used without mapping any frames.
    /// Returns the range's starting address.
    pub fn reserve(&mut self, len: u64) -> Result<VirtAddr, Error> {
        let len = round_up_page(len);
        if len == 0 {
            return Err(Error::InvalidArgument);
        }
        let candidate = self.by_size.ceiling(&(len, 0)).ok_or(Error::OutOfMemory)?;
        self.carve(candidate, len)
    }

    /// Reserves exactly `[start, start + len)`, failing if any part of that
    /// range is not currently free.
    pub fn reserve_at(&mut self, start: VirtAddr, len: u64) -> Result<(), Error> {
        let len = round_up_page(len);
        if len == 0 || start % PTE_MAPPED_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        let containing = self.find_containing(start).ok_or(Error::InvalidArgument)?;
        let r = self.ranges.get(containing).unwrap();
        if !r.free || start < r.start || start + len > r.start + r.len {
            return Err(Error::InvalidArgument);
        }
        self.carve_from(containing, start, len)?;
        Ok(())
    }

    /// Finds whichever range (free or used) contains `addr`, by walking the
    /// address-ordered list from the nearest `by_addr` entry at or below it.
    fn find_containing(&self, addr: VirtAddr) -> Option<Id<Range>> {
        let mut cur = self.order.head;
        let mut best = None;
        while let Some(id) = cur {
            let r = self.ranges.get(id).unwrap();
            if r.start <= addr && addr < r.start + r.len {
                best = Some(id);
                break;
            }
            cur = r.links.next;
        }
        best
    }

    /// Splits `len` pages off the front of free range `id`, returning the
    /// new used range's start address.
    fn carve(&mut self, id: Id<Range>, len: u64) -> Result<VirtAddr, Error> {
        let start = self.ranges.get(id).unwrap().start;
        self.carve_from(id, start, len)?;
        Ok(start)
    }

    /// Splits `[start, start+len)` out of free range `id` (which must
    /// contain it), leaving up to two smaller free ranges behind, and
    /// inserts a new used range covering `[start, start+len)` in its place
    /// in the address-ordered list.
    fn carve_from(&mut self, id: Id<Range>, start: VirtAddr, len: u64) -> Result<(), Error> {
        self.unlink_free(id);
        let (range_start, range_len) = {
            let r = self.ranges.get(id).unwrap();
            (r.start, r.len)
        };
        let head_len = start - range_start;
        let tail_len = (range_start + range_len) - (start + len);

        let used_id = id;
        self.ranges.get_mut(used_id).unwrap().start = start;
        self.ranges.get_mut(used_id).unwrap().len = len;
        self.ranges.get_mut(used_id).unwrap().free = false;

        if head_len > 0 {
            let head_id = self.ranges.insert(Range { start: range_start, len: head_len, free: true, links: Links::new() });
            let ranges = &mut self.ranges;
            self.order.insert_before(used_id, head_id, |i| &mut ranges.get_mut(i).unwrap().links);
            self.relink_free(head_id);
        }
        if tail_len > 0 {
            let tail_id = self.ranges.insert(Range { start: start + len, len: tail_len, free: true, links: Links::new() });
            let ranges = &mut self.ranges;
            self.order.insert_after(used_id, tail_id, |i| &mut ranges.get_mut(i).unwrap().links);
            self.relink_free(tail_id);
        }
        Ok(())
    }

    /// Releases the used range starting at `start`, unmapping and freeing
    /// every owned frame within it, then coalesces it with free neighbours.
    pub fn release(&mut self, start: VirtAddr) -> Result<(), Error> {
        let id = self.by_start_used(start).ok_or(Error::InvalidArgument)?;
        let (range_start, range_len) = {
            let r = self.ranges.get(id).unwrap();
            (r.start, r.len)
        };

        let mut va = range_start;
        while va < range_start + range_len {
            if let Some((pa, owned)) = self.page_table.unmap(va) {
                if owned {
                    frame::release(pa);
                    self.user_committed_pages -= 1;
                }
            }
            va += PTE_MAPPED_SIZE;
        }

        self.ranges.get_mut(id).unwrap().free = true;
        self.coalesce(id);
        Ok(())
    }

    fn by_start_used(&self, start: VirtAddr) -> Option<Id<Range>> {
        let id = self.find_containing(start)?;
        let r = self.ranges.get(id).unwrap();
        (r.start == start && !r.free).then_some(id)
    }

    /// Merges freshly-freed range `id` with an immediately adjacent free
    /// neighbour on either side, repeating until both sides are either used
    /// ranges or the ends of the address space.
    fn coalesce(&mut self, id: Id<Range>) {
        if let Some(prev) = self.ranges.get(id).unwrap().links.prev {
            if self.ranges.get(prev).unwrap().free {
                self.merge(prev, id);
                return self.coalesce(prev);
            }
        }
        if let Some(next) = self.ranges.get(id).unwrap().links.next {
            if self.ranges.get(next).unwrap().free {
                self.merge(id, next);
                return self.coalesce(id);
            }
        }
        self.relink_free(id);
    }

    /// Absorbs `second` into `first` (both adjacent, `first` lower in
    /// address), removing `second` entirely.
    fn merge(&mut self, first: Id<Range>, second: Id<Range>) {
        if self.ranges.get(first).unwrap().free && self.by_addr.get(&self.ranges.get(first).unwrap().start).is_some() {
            self.unlink_free(first);
        }
        if self.ranges.get(second).unwrap().free && self.by_addr.get(&self.ranges.get(second).unwrap().start).is_some() {
            self.unlink_free(second);
        }
        let second_len = self.ranges.get(second).unwrap().len;
        self.ranges.get_mut(first).unwrap().len += second_len;
        self.order.remove(second, |i| &mut self.ranges.get_mut(i).unwrap().links);
        self.ranges.remove(second);
    }

    /// Reserves and immediately backs `len` bytes with fresh zeroed,
    /// writable frames. Convenience used by process/thread construction for
    /// stacks and heaps.
    pub fn allocate(&mut self, len: u64, user: bool) -> Result<VirtAddr, Error> {
        let start = self.reserve(len)?;
        let len = round_up_page(len);
        let mut mapped = 0u64;
        while mapped < len {
            let va = start + mapped;
            let frame = match frame::acquire() {
                Ok(f) => f,
                Err(e) => {
                    self.release_partial(start, mapped);
                    return Err(e);
                }
            };
            let mut alloc_frame = || frame::acquire().ok();
            if unsafe { self.page_table.map(va, frame, true, true, user, false, &mut alloc_frame) }.is_err() {
                frame::release(frame);
                self.release_partial(start, mapped);
                return Err(Error::OutOfMemory);
            }
            self.user_committed_pages += 1;
            mapped += PTE_MAPPED_SIZE;
        }
        Ok(start)
    }

    fn release_partial(&mut self, start: VirtAddr, mapped: u64) {
        let mut va = start;
        while va < start + mapped {
            if let Some((pa, owned)) = self.page_table.unmap(va) {
                if owned {
                    frame::release(pa);
                }
            }
            va += PTE_MAPPED_SIZE;
        }
        let _ = self.release(start);
    }

    /// Tears down the entire address space, releasing every owned frame
    /// still mapped in it. Leaves the manager empty; the caller is
    /// responsible for freeing the PML4 frame itself.
    pub fn destroy(&mut self) {
        let used: alloc::vec::Vec<(VirtAddr, u64)> = {
            let mut v = alloc::vec::Vec::new();
            let mut cur = self.order.head;
            while let Some(id) = cur {
                let r = self.ranges.get(id).unwrap();
                if !r.free {
                    v.push((r.start, r.len));
                }
                cur = r.links.next;
            }
            v
        };
        for (start, len) in used {
            let mut va = start;
            while va < start + len {
                if let Some((pa, owned)) = self.page_table.unmap(va) {
                    if owned {
                        frame::release(pa);
                    }
                }
                va += PTE_MAPPED_SIZE;
            }
        }
    }

    pub fn committed_pages(&self) -> usize {
        self.user_committed_pages
    }
}

fn round_up_page(len: u64) -> u64 {
    (len + PTE_MAPPED_SIZE - 1) & !(PTE_MAPPED_SIZE - 1)
}
