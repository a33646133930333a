//! Named shared-memory segments. A segment is a page-count-sized array of
//! physical frames, optionally left unallocated (`LAZILY_ALLOCATED`) so that
//! mapping it into a process installs "reserved, fault on access" entries
//! instead of real frames; the creator then services misses over IPC.

use alloc::vec::Vec;

use perception_abi::{Error, Message, SharedMemoryFlags};

use crate::arena::Id;
use crate::ipc::message;
use crate::mm::paging::{PhysAddr, VirtAddr, PTE_MAPPED_SIZE};
use crate::state::Kernel;
use crate::task::process::Pid;
use crate::task::scheduler::Scheduler;
use crate::task::thread::{ThreadFlags, Tid};
use crate::utils::idlist::{IdList, Links};

pub type SegId = Id<Segment>;
pub type MappingId = Id<SegmentMapping>;

pub struct Segment {
    pub page_count: u64,
    pub flags: SharedMemoryFlags,
    /// Physical frame backing each page, or `None` if not yet materialised.
    pub frames: Vec<Option<PhysAddr>>,
    pub creator: Pid,
    pub refcount: u32,
    pub mappings: IdList<MappingId>,
    /// Message id the creator registered to receive lazy-page misses on.
    pub lazy_message_id: Option<u64>,
    /// Threads currently blocked waiting for a specific page offset (in
    /// bytes) to be materialised.
    pub page_waiters: Vec<(u64, Tid)>,
}

impl Segment {
    fn is_lazy(&self) -> bool {
        self.flags.contains(SharedMemoryFlags::LAZILY_ALLOCATED)
    }
}

/// A single process's join of a single segment: the virtual base it chose,
/// how many times it joined (nested joins bump a refcount rather than
/// double-mapping), and the two list links threading it onto both the
/// owning process's and the segment's membership lists.
pub struct SegmentMapping {
    pub segment: SegId,
    pub process: Pid,
    pub base: VirtAddr,
    pub join_count: u32,
    pub process_links: Links<MappingId>,
    pub segment_links: Links<MappingId>,
}

/// Creates a segment of `page_count` pages with the given flags, owned by
/// `creator`. Non-lazy segments have every frame acquired up front; lazy
/// segments start out entirely unmaterialised.
pub fn create(kernel: &mut Kernel, creator: Pid, page_count: u64, flags: SharedMemoryFlags) -> Result<SegId, Error> {
    if page_count == 0 {
        return Err(Error::InvalidArgument);
    }
    let mut frames = alloc::vec![None; page_count as usize];
    if !flags.contains(SharedMemoryFlags::LAZILY_ALLOCATED) {
        for slot in frames.iter_mut() {
            *slot = Some(crate::mm::frame::acquire()?);
        }
    }
    let id = kernel.segments.insert(Segment {
        page_count,
        flags,
        frames,
        creator,
        refcount: 0,
        mappings: IdList::new(),
        lazy_message_id: None,
        page_waiters: Vec::new(),
    });
    Ok(id)
}

/// Registers the message id the creator wants to receive lazy-page-miss
/// notifications on. Separate from `create` since the original design
/// allows it to be set after the fact.
pub fn set_lazy_message_id(kernel: &mut Kernel, segment: SegId, message_id: u64) {
    if let Some(s) = kernel.segments.get_mut(segment) {
        s.lazy_message_id = Some(message_id);
    }
}

/// Joins `process` to `segment`. A process already joined simply bumps its
/// join refcount and returns the existing base; otherwise a free range is
/// reserved and every already-materialised page is mapped in (read-only,
/// unless `JOINERS_CAN_WRITE` or `process` is the creator).
pub fn join(kernel: &mut Kernel, process: Pid, segment: SegId) -> Result<VirtAddr, Error> {
    if !kernel.segments.contains(segment) {
        return Err(Error::InvalidArgument);
    }

    let existing = find_mapping(kernel, process, segment);
    if let Some(mapping_id) = existing {
        let mapping = kernel.mappings.get_mut(mapping_id).unwrap();
        mapping.join_count += 1;
        return Ok(mapping.base);
    }

    let (page_count, writable) = {
        let s = kernel.segments.get(segment).unwrap();
        let writable = s.flags.contains(SharedMemoryFlags::JOINERS_CAN_WRITE) || s.creator == process;
        (s.page_count, writable)
    };

    let base = kernel.processes.get_mut(process).unwrap().address_space.reserve(page_count * PTE_MAPPED_SIZE)?;

    let mapping_id = kernel.mappings.insert(SegmentMapping {
        segment,
        process,
        base,
        join_count: 1,
        process_links: Links::new(),
        segment_links: Links::new(),
    });

    {
        let mappings = &mut kernel.mappings;
        kernel.processes.get_mut(process).unwrap().joined_segments.push_back(mapping_id, |i| &mut mappings.get_mut(i).unwrap().process_links);
    }
    {
        let mappings = &mut kernel.mappings;
        kernel.segments.get_mut(segment).unwrap().mappings.push_back(mapping_id, |i| &mut mappings.get_mut(i).unwrap().segment_links);
    }
    kernel.segments.get_mut(segment).unwrap().refcount += 1;

    for page in 0..page_count {
        let va = base + page * PTE_MAPPED_SIZE;
        let frame = kernel.segments.get(segment).unwrap().frames[page as usize];
        let lazy = kernel.segments.get(segment).unwrap().is_lazy();
        let mut alloc_frame = || crate::mm::frame::acquire().ok();
        let space = &kernel.processes.get(process).unwrap().address_space;
        match frame {
            Some(pa) => unsafe {
                let _ = space.page_table.map(va, pa, false, writable, true, false, &mut alloc_frame);
            },
            None if lazy => unsafe {
                let _ = space.page_table.map(va, 0, false, writable, true, true, &mut alloc_frame);
            },
            None => {}
        }
    }

    Ok(base)
}

fn find_mapping(kernel: &Kernel, process: Pid, segment: SegId) -> Option<MappingId> {
    let mut cur = kernel.processes.get(process)?.joined_segments.head;
    while let Some(id) = cur {
        let m = kernel.mappings.get(id).unwrap();
        if m.segment == segment {
            return Some(id);
        }
        cur = m.process_links.next;
    }
    None
}

/// Leaves a joined segment, decrementing its per-process join count; at
/// zero the mapping is unlinked and unmapped, and if the segment's own
/// refcount then hits zero it and its frames are released entirely.
pub fn leave(kernel: &mut Kernel, process: Pid, segment: SegId) -> Result<(), Error> {
    let mapping_id = find_mapping(kernel, process, segment).ok_or(Error::InvalidArgument)?;
    let mapping = kernel.mappings.get_mut(mapping_id).unwrap();
    mapping.join_count -= 1;
    if mapping.join_count > 0 {
        return Ok(());
    }

    let base = mapping.base;
    let page_count = kernel.segments.get(segment).unwrap().page_count;
    for page in 0..page_count {
        let va = base + page * PTE_MAPPED_SIZE;
        kernel.processes.get(process).unwrap().address_space.page_table.unmap(va);
    }
    let _ = kernel.processes.get_mut(process).unwrap().address_space.release(base);

    {
        let mappings = &mut kernel.mappings;
        kernel.processes.get_mut(process).unwrap().joined_segments.remove(mapping_id, |i| &mut mappings.get_mut(i).unwrap().process_links);
    }
    {
        let mappings = &mut kernel.mappings;
        kernel.segments.get_mut(segment).unwrap().mappings.remove(mapping_id, |i| &mut mappings.get_mut(i).unwrap().segment_links);
    }
    kernel.mappings.remove(mapping_id);

    let seg = kernel.segments.get_mut(segment).unwrap();
    seg.refcount -= 1;
    if seg.refcount == 0 {
        let seg = kernel.segments.remove(segment);
        for frame in seg.frames.into_iter().flatten() {
            crate::mm::frame::release(frame);
        }
    }
    Ok(())
}

/// Locates the joined segment (if any) of `process` containing `va`,
/// returning its id and the byte offset within it.
fn find_containing(kernel: &Kernel, process: Pid, va: VirtAddr) -> Option<(SegId, u64)> {
    let mut cur = kernel.processes.get(process)?.joined_segments.head;
    while let Some(id) = cur {
        let m = kernel.mappings.get(id).unwrap();
        let len = kernel.segments.get(m.segment).unwrap().page_count * PTE_MAPPED_SIZE;
        if va >= m.base && va < m.base + len {
            return Some((m.segment, va - m.base));
        }
        cur = m.process_links.next;
    }
    None
}

/// The page-fault handler's core: routes a fault at `va` in `process` to
/// whichever joined lazy segment covers it. Returns `true` if the fault was
/// handled (and `va` is now mapped), `false` if `va` isn't covered by a lazy
/// segment at all (the caller should treat this as a fatal fault).
pub fn page_fault(kernel: &mut Kernel, process: Pid, tid: Tid, va: VirtAddr) -> bool {
    let (segment, offset) = match find_containing(kernel, process, va) {
        Some(found) => found,
        None => return false,
    };
    if !kernel.segments.get(segment).unwrap().is_lazy() {
        return false;
    }

    let creator = kernel.segments.get(segment).unwrap().creator;
    if creator == process || !kernel.processes.contains(creator) {
        materialise_page(kernel, segment, offset, None);
        return true;
    }

    kernel.threads.get_mut(tid).unwrap().flags.insert(ThreadFlags::WAITING_FOR_SHARED_PAGE);
    Scheduler::sleep(kernel, tid);
    kernel.segments.get_mut(segment).unwrap().page_waiters.push((offset, tid));

    if let Some(lazy_id) = kernel.segments.get(segment).unwrap().lazy_message_id {
        let mut msg = Message::new(lazy_id as usize, 0);
        msg.arg1 = offset;
        let _ = message::send(kernel, process, creator, msg);
    }
    true
}

/// Acquires a fresh zero frame and installs it at `offset` in `segment`,
/// replacing any previous frame there, then maps it into every joiner.
/// `explicit_frame` is used by `move_page_into_segment`, where the frame is
/// handed over already populated rather than freshly zeroed.
fn materialise_page(kernel: &mut Kernel, segment: SegId, offset: u64, explicit_frame: Option<PhysAddr>) -> Result<(), Error> {
    let page = offset / PTE_MAPPED_SIZE;
    let frame = match explicit_frame {
        Some(f) => f,
        None => crate::mm::frame::acquire()?,
    };

    let previous = kernel.segments.get_mut(segment).unwrap().frames[page as usize].replace(frame);
    if let Some(old) = previous {
        crate::mm::frame::release(old);
    }

    let mut cur = kernel.segments.get(segment).unwrap().mappings.head;
    while let Some(mapping_id) = cur {
        let mapping = kernel.mappings.get(mapping_id).unwrap();
        let va = mapping.base + page * PTE_MAPPED_SIZE;
        let proc = mapping.process;
        let writable = kernel.segments.get(segment).unwrap().flags.contains(SharedMemoryFlags::JOINERS_CAN_WRITE)
            || kernel.segments.get(segment).unwrap().creator == proc;
        let mut alloc_frame = || crate::mm::frame::acquire().ok();
        unsafe {
            let _ = kernel.processes.get(proc).unwrap().address_space.page_table.map(va, frame, false, writable, true, false, &mut alloc_frame);
        }
        cur = kernel.mappings.get(mapping_id).unwrap().segment_links.next;
    }

    wake_page_waiters(kernel, segment, offset);
    Ok(())
}

fn wake_page_waiters(kernel: &mut Kernel, segment: SegId, offset: u64) {
    let seg = kernel.segments.get_mut(segment).unwrap();
    let mut still_waiting = Vec::new();
    let woken: Vec<Tid> = seg
        .page_waiters
        .drain(..)
        .filter_map(|(o, tid)| {
            if o == offset {
                Some(tid)
            } else {
                still_waiting.push((o, tid));
                None
            }
        })
        .collect();
    seg.page_waiters = still_waiting;

    for tid in woken {
        kernel.threads.get_mut(tid).unwrap().flags.remove(ThreadFlags::WAITING_FOR_SHARED_PAGE);
        Scheduler::wake(kernel, tid);
    }
}

/// Flips `JOINERS_CAN_WRITE` and remaps every current joiner (other than the
/// creator, who is always writable) to match. Creator-only.
pub fn set_access(kernel: &mut Kernel, creator: Pid, segment: SegId, joiners_can_write: bool) -> Result<(), Error> {
    let seg = kernel.segments.get_mut(segment).ok_or(Error::InvalidArgument)?;
    if seg.creator != creator {
        return Err(Error::NotAllowed);
    }
    seg.flags.set(SharedMemoryFlags::JOINERS_CAN_WRITE, joiners_can_write);
    let page_count = seg.page_count;

    let mut cur = kernel.segments.get(segment).unwrap().mappings.head;
    while let Some(mapping_id) = cur {
        let mapping = kernel.mappings.get(mapping_id).unwrap();
        let (proc, base) = (mapping.process, mapping.base);
        let writable = joiners_can_write || proc == creator;
        for page in 0..page_count {
            let va = base + page * PTE_MAPPED_SIZE;
            if let Some(pa) = kernel.segments.get(segment).unwrap().frames[page as usize] {
                let mut alloc_frame = || crate::mm::frame::acquire().ok();
                unsafe {
                    let _ = kernel.processes.get(proc).unwrap().address_space.page_table.map(va, pa, false, writable, true, false, &mut alloc_frame);
                }
            }
        }
        cur = kernel.mappings.get(mapping_id).unwrap().segment_links.next;
    }
    Ok(())
}

/// Called by the segment's creator in response to a lazy-page-miss message:
/// installs the page the creator prepared at `creator_va` into the segment
/// at `offset`, extracting the owned frame out of the creator's own address
/// space first.
pub fn move_page_into_segment(kernel: &mut Kernel, creator: Pid, segment: SegId, offset: u64, creator_va: VirtAddr) -> Result<(), Error> {
    if kernel.segments.get(segment).ok_or(Error::InvalidArgument)?.creator != creator {
        return Err(Error::NotAllowed);
    }
    let (frame, owned) = kernel
        .processes
        .get(creator)
        .unwrap()
        .address_space
        .page_table
        .unmap(creator_va)
        .ok_or(Error::InvalidArgument)?;
    if !owned {
        return Err(Error::InvalidArgument);
    }
    materialise_page(kernel, segment, offset, Some(frame))
}
