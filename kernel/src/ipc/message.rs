//! Synchronous message passing: a bounded per-process queue, blocking and
//! polling receive, and the page-transfer fast path triggered by
//! `Message::TRANSFERS_PAGES`.

use core::ptr::NonNull;

use perception_abi::{Error, Message, MESSAGE_QUEUE_CAPACITY, NO_MESSAGE};

use crate::mm::paging::PTE_MAPPED_SIZE;
use crate::mm::pool::Pool;
use crate::state::Kernel;
use crate::task::process::Pid;
use crate::task::scheduler::Scheduler;
use crate::task::thread::{ThreadFlags, Tid};
use crate::utils::idlist::Links;

struct MessageRecord {
    message: Message,
    links: Links<MessageSlot>,
}

/// A handle into the message object pool. Stable for the slot's lifetime,
/// so it doubles as the `Id` type for a process's `IdList<MessageSlot>`
/// queue.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MessageSlot(NonNull<MessageRecord>);

static MESSAGE_POOL: Pool<MessageRecord> = Pool::new();

/// Registers the message pool with the frame allocator's drain registry.
/// Called once during boot.
pub fn init() {
    crate::mm::pool::register(&MESSAGE_POOL);
}

fn links_mut(slot: MessageSlot) -> &'static mut Links<MessageSlot> {
    unsafe { &mut (*slot.0.as_ptr()).links }
}

impl MessageSlot {
    pub fn message(self) -> Message {
        unsafe { (*self.0.as_ptr()).message }
    }
}

fn alloc_slot(message: Message) -> Result<MessageSlot, Error> {
    let raw = MESSAGE_POOL.alloc()?;
    let record = unsafe { (*raw).write(MessageRecord { message, links: Links::new() }) };
    Ok(MessageSlot(NonNull::from(record)))
}

fn free_slot(slot: MessageSlot) {
    let raw = slot.0.as_ptr().cast();
    unsafe { MESSAGE_POOL.free(raw) };
}

/// Delivers `message` (already stamped with its true sender) to `target`.
///
/// If `target` has a thread parked in `receive_blocking`, the message is
/// written directly into that thread's register frame and it is woken;
/// otherwise it is queued, failing with `ReceiversQueueIsFull` at capacity.
/// When `message.transfers_pages()`, `arg4`/`arg5` describe a page range in
/// the sender that is moved - unmapped there, remapped owned in the
/// receiver - before the message becomes visible; any failure partway
/// through the page walk unwinds everything already moved.
pub fn send(kernel: &mut Kernel, sender: Pid, target: Pid, mut message: Message) -> Result<(), Error> {
    if !kernel.processes.contains(target) {
        return Err(Error::ProcessDoesNotExist);
    }

    if message.transfers_pages() && target != sender {
        move_pages(kernel, sender, target, &mut message)?;
    }

    let waiter = {
        let threads = &mut kernel.threads;
        kernel.processes.get_mut(target).unwrap().receive_waiters.pop_front(|id| &mut threads.get_mut(id).unwrap().owner_links)
    };
    if let Some(waiter) = waiter {
        deliver_to_register_frame(kernel, waiter, message);
        Scheduler::wake(kernel, waiter);
        return Ok(());
    }

    let process = kernel.processes.get_mut(target).unwrap();
    if process.messages_queued >= MESSAGE_QUEUE_CAPACITY {
        return Err(Error::ReceiversQueueIsFull);
    }

    let slot = alloc_slot(message)?;
    process.message_queue.push_back(slot, links_mut);
    process.messages_queued += 1;
    Ok(())
}

fn deliver_to_register_frame(kernel: &mut Kernel, tid: Tid, message: Message) {
    let thread = kernel.threads.get_mut(tid).unwrap();
    let regs = &mut thread.registers;
    regs.rax = message.id as u64;
    regs.rbx = message.sender;
    regs.rsi = message.arg1;
    regs.rdi = message.arg2;
    regs.r8 = message.arg3;
    regs.r9 = message.arg4;
    regs.r10 = message.arg5;
}

/// Moves `arg5` pages starting at `arg4` in `sender`'s address space into a
/// freshly reserved range in `target`, rewriting `arg4` to the receiver-side
/// base address once the move succeeds.
fn move_pages(kernel: &mut Kernel, sender: Pid, target: Pid, message: &mut Message) -> Result<(), Error> {
    let src_base = message.arg4;
    let page_count = message.arg5;
    if page_count == 0 {
        return Err(Error::InvalidArgument);
    }

    let dst_base = kernel.processes.get_mut(target).unwrap().address_space.reserve(page_count * PTE_MAPPED_SIZE)?;

    let mut moved = 0u64;
    let result: Result<(), Error> = (|| {
        for i in 0..page_count {
            let src_va = src_base + i * PTE_MAPPED_SIZE;
            let dst_va = dst_base + i * PTE_MAPPED_SIZE;
            let (pa, _owned) = kernel
                .processes
                .get(sender)
                .unwrap()
                .address_space
                .page_table
                .unmap(src_va)
                .ok_or(Error::InvalidArgument)?;
            let mut alloc_frame = || crate::mm::frame::acquire().ok();
            unsafe {
                kernel
                    .processes
                    .get(target)
                    .unwrap()
                    .address_space
                    .page_table
                    .map(dst_va, pa, true, true, true, false, &mut alloc_frame)
                    .map_err(|_| Error::OutOfMemory)?;
            }
            moved += 1;
        }
        Ok(())
    })();

    if let Err(e) = result {
        // Unwind: return every already-moved page to the sender, then
        // release the destination reservation entirely.
        for i in 0..moved {
            let dst_va = dst_base + i * PTE_MAPPED_SIZE;
            let src_va = src_base + i * PTE_MAPPED_SIZE;
            if let Some((pa, _)) = kernel.processes.get(target).unwrap().address_space.page_table.unmap(dst_va) {
                let mut alloc_frame = || crate::mm::frame::acquire().ok();
                unsafe {
                    let _ = kernel.processes.get(sender).unwrap().address_space.page_table.map(
                        src_va, pa, true, true, true, false, &mut alloc_frame,
                    );
                }
            }
        }
        let _ = kernel.processes.get_mut(target).unwrap().address_space.release(dst_base);
        return Err(e);
    }

    message.arg4 = dst_base;
    message.arg5 = page_count;
    Ok(())
}

/// `receive_blocking`: pops the head of `pid`'s queue into `tid`'s register
/// frame, or parks `tid` on the queue's waiter list until a `send` arrives.
pub fn receive_blocking(kernel: &mut Kernel, pid: Pid, tid: Tid) {
    if let Some(slot) = kernel.processes.get_mut(pid).unwrap().message_queue.pop_front(links_mut) {
        kernel.processes.get_mut(pid).unwrap().messages_queued -= 1;
        let message = slot.message();
        free_slot(slot);
        deliver_to_register_frame(kernel, tid, message);
        return;
    }

    kernel.threads.get_mut(tid).unwrap().flags.insert(ThreadFlags::WAITING_FOR_MESSAGE);
    Scheduler::sleep(kernel, tid);
    let threads = &mut kernel.threads;
    kernel.processes.get_mut(pid).unwrap().receive_waiters.push_back(tid, |i| &mut threads.get_mut(i).unwrap().owner_links);
}

/// `receive_polling`: same as blocking receive but returns `NO_MESSAGE`
/// (written into `rax`) instead of parking the thread when the queue is
/// empty.
pub fn receive_polling(kernel: &mut Kernel, pid: Pid, tid: Tid) {
    match kernel.processes.get_mut(pid).unwrap().message_queue.pop_front(links_mut) {
        Some(slot) => {
            kernel.processes.get_mut(pid).unwrap().messages_queued -= 1;
            let message = slot.message();
            free_slot(slot);
            deliver_to_register_frame(kernel, tid, message);
        }
        None => {
            kernel.threads.get_mut(tid).unwrap().registers.rax = NO_MESSAGE as u64;
        }
    }
}

/// Discards every message queued for `pid`, e.g. during process
/// destruction.
pub fn drain_queue(kernel: &mut Kernel, pid: Pid) {
    while let Some(slot) = kernel.processes.get_mut(pid).unwrap().message_queue.pop_front(links_mut) {
        kernel.processes.get_mut(pid).unwrap().messages_queued -= 1;
        free_slot(slot);
    }
}
