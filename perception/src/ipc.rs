//! Synchronous message passing wrappers, plus the tiny request/response
//! convention every RPC-style service in this tree (the loader, the
//! storage manager) builds its client calls out of: send a message whose
//! id names the operation, then block for a reply that reuses the payload
//! slots as return values.

use perception_abi::{Error, Message, Pid, Syscall, NO_MESSAGE};

use crate::syscall::call0;

/// Sends a plain (non-page-transferring) message.
pub fn send(target: Pid, id: u64, arg1: u64, arg2: u64, arg3: u64, arg4: u64, arg5: u64) -> Result<(), Error> {
    call0(Syscall::SendMessage, target, id, 0, arg1, arg2, arg3, arg4, arg5)
}

/// Sends a message that additionally transfers `page_count` pages starting
/// at `src_va` in the caller's address space into the receiver. The
/// receiver sees the chosen destination address in `arg4` of the delivered
/// message.
pub fn send_with_pages(
    target: Pid,
    id: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    src_va: u64,
    page_count: u64,
) -> Result<(), Error> {
    call0(Syscall::SendMessage, target, id, Message::TRANSFERS_PAGES, arg1, arg2, arg3, src_va, page_count)
}

/// Blocks until a message arrives, returning its id, sender, and five
/// payload words. The delivered frame carries more live registers than
/// [`crate::syscall::raw`] surfaces, so this call issues its own inline
/// asm rather than composing it.
pub fn receive_blocking() -> (u64, Pid, u64, u64, u64, u64, u64) {
    let id: u64;
    let sender: u64;
    let arg1: u64;
    let arg2: u64;
    let arg3: u64;
    let arg4: u64;
    let arg5: u64;
    unsafe {
        core::arch::asm!(
            "syscall",
            inlateout("rax") Syscall::SleepForMessage as u64 => id,
            lateout("rbx") sender,
            lateout("rcx") _,
            lateout("rdx") _,
            lateout("rsi") arg1,
            lateout("rdi") arg2,
            lateout("r8") arg3,
            lateout("r9") arg4,
            lateout("r10") arg5,
            lateout("r11") _,
            options(nostack),
        );
    }
    (id, sender, arg1, arg2, arg3, arg4, arg5)
}

/// Non-blocking receive: returns `None` if no message is queued, matching
/// the kernel's `NO_MESSAGE` sentinel.
pub fn receive_polling() -> Option<(u64, Pid, u64, u64, u64, u64, u64)> {
    let id: u64;
    let sender: u64;
    let arg1: u64;
    let arg2: u64;
    let arg3: u64;
    let arg4: u64;
    let arg5: u64;
    unsafe {
        core::arch::asm!(
            "syscall",
            inlateout("rax") Syscall::PollMessage as u64 => id,
            lateout("rbx") sender,
            lateout("rcx") _,
            lateout("rdx") _,
            lateout("rsi") arg1,
            lateout("rdi") arg2,
            lateout("r8") arg3,
            lateout("r9") arg4,
            lateout("r10") arg5,
            lateout("r11") _,
            options(nostack),
        );
    }
    if id as usize == NO_MESSAGE {
        None
    } else {
        Some((id, sender, arg1, arg2, arg3, arg4, arg5))
    }
}
