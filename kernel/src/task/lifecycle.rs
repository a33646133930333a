//! Process and thread creation and destruction: the operations that don't
//! belong to any single data structure, since they touch the address-space
//! manager, the scheduler, the service directory, the timer queue, and
//! shared-memory joins all at once.

use alloc::vec::Vec;

use perception_abi::{Error, ProcessFlags};

use crate::ipc::message;
use crate::ipc::shared_memory;
use crate::mm::addrspace::AddressSpace;
use crate::mm::paging;
use crate::state::Kernel;
use crate::task::process::{Pid, Process};
use crate::task::scheduler::Scheduler;
use crate::task::thread::{RegisterFrame, Thread, Tid};

/// Default stack size granted to a freshly created thread: four pages,
/// growing down from the top of its reserved range.
const THREAD_STACK_PAGES: u64 = 4;

/// Creates a new, otherwise empty process (no threads yet) with a fresh
/// address space.
pub fn create_process(kernel: &mut Kernel, name: &[u8], flags: ProcessFlags) -> Result<Pid, Error> {
    let pml4 = crate::mm::frame::acquire()?;
    paging::new_address_space_pml4(pml4);
    let address_space = AddressSpace::new(pml4);
    let process = Process::new(name, flags, address_space);
    Ok(kernel.processes.insert(process))
}

/// Spawns a thread in `process` entering at `(rip, arg)`. The stack is
/// allocated from the process's own address space, multi-page and growing
/// down; general registers are zeroed except the argument word. Driver
/// processes get their thread's I/O-privilege flags set so they can issue
/// privileged port instructions.
pub fn create_thread(kernel: &mut Kernel, process: Pid, rip: u64, arg: u64) -> Result<Tid, Error> {
    let is_driver = kernel.processes.get(process).ok_or(Error::ProcessDoesNotExist)?.is_driver();
    let stack_base = kernel
        .processes
        .get_mut(process)
        .unwrap()
        .address_space
        .allocate(THREAD_STACK_PAGES * paging::PTE_MAPPED_SIZE, true)?;
    let stack_top = stack_base + THREAD_STACK_PAGES * paging::PTE_MAPPED_SIZE;

    let registers = RegisterFrame::for_new_thread(rip, stack_top, arg, true, is_driver);
    let thread = Thread::new(process, registers, stack_base, THREAD_STACK_PAGES, is_driver);
    let tid = kernel.threads.insert(thread);

    {
        let threads = &mut kernel.threads;
        kernel.processes.get_mut(process).unwrap().threads.push_back(tid, |i| &mut threads.get_mut(i).unwrap().process_links);
    }
    kernel.processes.get_mut(process).unwrap().thread_count += 1;

    Scheduler::wake(kernel, tid);
    Ok(tid)
}

/// Terminates a single thread: frees its stack, clears its robust-list
/// word if set, and removes it from whichever scheduling list it's on. If
/// it was the process's last thread, the process itself is destroyed.
pub fn terminate_thread(kernel: &mut Kernel, tid: Tid) {
    let (process, stack_base, clear_on_exit) = {
        let t = kernel.threads.get(tid).unwrap();
        (t.process, t.stack_base, t.clear_on_exit)
    };

    if clear_on_exit != 0 {
        if let Some(pa) = kernel.processes.get(process).unwrap().address_space.page_table.translate(clear_on_exit) {
            let ptr = paging::phys_to_virt(pa + (clear_on_exit % paging::PTE_MAPPED_SIZE)).cast::<u64>();
            unsafe { ptr.write_volatile(0) };
        }
    }

    let _ = kernel.processes.get_mut(process).unwrap().address_space.release(stack_base);

    if kernel.scheduler.current == Some(tid) {
        kernel.scheduler.current = None;
    } else {
        Scheduler::sleep(kernel, tid);
    }

    {
        let threads = &mut kernel.threads;
        kernel.processes.get_mut(process).unwrap().threads.remove(tid, |i| &mut threads.get_mut(i).unwrap().process_links);
    }
    kernel.threads.remove(tid);

    let remaining = {
        let p = kernel.processes.get_mut(process).unwrap();
        p.thread_count -= 1;
        p.thread_count
    };
    if remaining == 0 {
        terminate_process(kernel, process);
    }
}

/// Destroys a process entirely: cancels its timer events, its interrupt
/// subscriptions, its shared-memory joins, and its service registrations
/// and death subscriptions, discards queued messages, terminates every
/// remaining thread, and releases every frame still mapped in its address
/// space.
pub fn terminate_process(kernel: &mut Kernel, pid: Pid) {
    if !kernel.processes.contains(pid) {
        return;
    }

    for event in kernel.processes.get(pid).unwrap().timer_events.clone() {
        kernel.timers.cancel(event);
    }

    let joined: Vec<_> = {
        let mut cur = kernel.processes.get(pid).unwrap().joined_segments.head;
        let mappings = &kernel.mappings;
        let mut v = Vec::new();
        while let Some(id) = cur {
            let m = mappings.get(id).unwrap();
            v.push(m.segment);
            cur = m.process_links.next;
        }
        v
    };
    for segment in joined {
        let _ = shared_memory::leave(kernel, pid, segment);
    }

    for group in kernel.services.unregister_all_owned_by(pid) {
        for subscriber in group {
            notify_death_style(kernel, subscriber, pid, b"service disappeared");
        }
    }
    kernel.services.unsubscribe_all(pid);

    message::drain_queue(kernel, pid);

    for subscriber in kernel.processes.get(pid).unwrap().death_subscribers.clone() {
        notify_death_style(kernel, subscriber, pid, b"process died");
    }

    let threads: Vec<Tid> = {
        let mut v = Vec::new();
        let mut cur = kernel.processes.get(pid).unwrap().threads.head;
        while let Some(tid) = cur {
            v.push(tid);
            cur = kernel.threads.get(tid).unwrap().process_links.next;
        }
        v
    };
    for tid in threads {
        if kernel.scheduler.current == Some(tid) {
            kernel.scheduler.current = None;
        } else {
            Scheduler::sleep(kernel, tid);
        }
        kernel.threads.remove(tid);
    }

    kernel.processes.get_mut(pid).unwrap().address_space.destroy();
    kernel.processes.remove(pid);
}

/// Creates a child process in the *creating* state on behalf of `parent`:
/// a process exists in the arena and has an address space, but has no
/// threads and cannot receive messages until [`start_executing_child`]
/// runs. Used exclusively by the ELF loader service to assemble a child's
/// address space before it starts running. `parent.children_creating`
/// records membership, not process existence, so [`terminate_process`]
/// of the parent mid-construction doesn't silently orphan the child: callers
/// are expected to destroy or start every child they create.
pub fn create_child_process(kernel: &mut Kernel, parent: Pid, name: &[u8], flags: ProcessFlags) -> Result<Pid, Error> {
    if !kernel.processes.contains(parent) {
        return Err(Error::ProcessDoesNotExist);
    }
    let child = create_process(kernel, name, flags)?;
    kernel.processes.get_mut(parent).unwrap().children_creating.push(child);
    Ok(child)
}

/// Moves one page from `parent`'s address space at `src_va` into `child`'s
/// address space at `dst_va`, unmapping it in the parent. `child` must
/// still be in the parent's creating list. This is the primitive the ELF
/// loader uses to populate a child's writable segments and transfer
/// relocated pages before the child ever runs; unlike message-based page
/// transfer (see [`crate::ipc::message::send`]) the destination address is
/// caller-chosen rather than freshly reserved, since the loader has already
/// laid out the child's virtual address space to match the ELF file's
/// program headers.
pub fn set_child_memory_page(
    kernel: &mut Kernel,
    parent: Pid,
    child: Pid,
    src_va: u64,
    dst_va: u64,
    writable: bool,
) -> Result<(), Error> {
    if !kernel.processes.get(parent).ok_or(Error::ProcessDoesNotExist)?.children_creating.contains(&child) {
        return Err(Error::NotAllowed);
    }
    let (pa, _owned) = kernel
        .processes
        .get(parent)
        .unwrap()
        .address_space
        .page_table
        .unmap(src_va)
        .ok_or(Error::InvalidArgument)?;

    // The destination address may already have been carved out by an
    // earlier page of the same segment; either way it ends up used.
    let _ = kernel.processes.get_mut(child).unwrap().address_space.reserve_at(dst_va, paging::PTE_MAPPED_SIZE);
    let child_space = &kernel.processes.get(child).unwrap().address_space;
    let mut alloc_frame = || crate::mm::frame::acquire().ok();
    let result = unsafe { child_space.page_table.map(dst_va, pa, true, writable, true, false, &mut alloc_frame) };
    if result.is_err() {
        let mut alloc_frame = || crate::mm::frame::acquire().ok();
        unsafe {
            let _ = kernel.processes.get(parent).unwrap().address_space.page_table.map(
                src_va, pa, true, true, true, false, &mut alloc_frame,
            );
        }
        return Err(Error::OutOfMemory);
    }
    Ok(())
}

/// Spawns the child's first thread at `entry`, passing no argument (the
/// loader's init/fini table address is instead published at a well-known
/// symbol inside the loaded image), and removes it from the parent's
/// creating list. From this point the child is a normal, schedulable
/// process.
pub fn start_executing_child(kernel: &mut Kernel, parent: Pid, child: Pid, entry: u64) -> Result<Tid, Error> {
    let p = kernel.processes.get_mut(parent).ok_or(Error::ProcessDoesNotExist)?;
    let pos = p.children_creating.iter().position(|&c| c == child).ok_or(Error::NotAllowed)?;
    p.children_creating.remove(pos);
    create_thread(kernel, child, entry, 0)
}

/// Tears down a child still in the *creating* state, e.g. because the
/// loader failed partway through assembling it. Equivalent to
/// `terminate_process` but also unlinks the child from the parent's
/// creating list first, since the child has no threads to drive that path
/// itself.
pub fn destroy_child_process(kernel: &mut Kernel, parent: Pid, child: Pid) -> Result<(), Error> {
    let p = kernel.processes.get_mut(parent).ok_or(Error::ProcessDoesNotExist)?;
    let pos = p.children_creating.iter().position(|&c| c == child).ok_or(Error::NotAllowed)?;
    p.children_creating.remove(pos);
    terminate_process(kernel, child);
    Ok(())
}

/// Death/service-disappearance notifications both reduce, at this layer, to
/// "deliver a kernel-origin message naming the dead/unregistered pid"; the
/// exact message id convention is a userspace concern, so this only routes
/// the delivery and swallows a full outbound queue rather than failing
/// process teardown over it.
fn notify_death_style(kernel: &mut Kernel, subscriber: Pid, subject: Pid, _reason: &[u8]) {
    if !kernel.processes.contains(subscriber) {
        return;
    }
    let mut msg = perception_abi::Message::new(0, 0);
    msg.arg1 = subject.raw() as u64;
    let _ = message::send(kernel, subject, subscriber, msg);
}
