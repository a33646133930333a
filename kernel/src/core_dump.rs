//! Fatal-fault reporting: a register dump plus a best-effort stack walk
//! through saved frame pointers, grounded on
//! `original_source/Kernel/source/exceptions.cc`'s `PrintStackTrace`/
//! `PrintRegistersAndStackTrace`. The original reads the faulting
//! process's frames through a temporary physical mapping; this walks the
//! same `[rbp] -> next rbp`, `[rbp+8] -> return rip` chain through the
//! process's own page table instead, since every process here already has
//! one to translate through.

use crate::mm::addrspace::AddressSpace;
use crate::mm::paging;
use crate::println;
use crate::state::Kernel;
use crate::task::process::Pid;
use crate::task::thread::RegisterFrame;

/// Bound on how many frames to walk, matching the original's
/// `STACK_TRACE_DEPTH` guard against a corrupt or cyclic `rbp` chain.
const STACK_TRACE_DEPTH: usize = 16;

/// Prints `frame`'s general-purpose registers, then walks the stack from
/// `frame.rbp`. `process` need not still exist (a double-checked lookup
/// into `kernel.processes` - the process may already be gone by the time a
/// kernel-side fault is reported); the walk is simply skipped if so.
pub fn print_core_dump(kernel: &Kernel, process: Pid, frame: &RegisterFrame) {
    println!(
        "  rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
        frame.rax, frame.rbx, frame.rcx, frame.rdx
    );
    println!(
        "  rsi={:#018x} rdi={:#018x} rbp={:#018x} rsp={:#018x}",
        frame.rsi, frame.rdi, frame.rbp, frame.rsp
    );
    println!(
        "  r8 ={:#018x} r9 ={:#018x} r10={:#018x} r11={:#018x}",
        frame.r8, frame.r9, frame.r10, frame.r11
    );
    println!(
        "  r12={:#018x} r13={:#018x} r14={:#018x} r15={:#018x}",
        frame.r12, frame.r13, frame.r14, frame.r15
    );
    println!("stack trace:\n  {:#x}", frame.rip);

    let Some(process) = kernel.processes.get(process) else { return };
    walk_frames(&process.address_space, frame.rbp);
}

fn walk_frames(address_space: &AddressSpace, mut rbp: u64) {
    for _ in 0..STACK_TRACE_DEPTH {
        if rbp == 0 || rbp % 8 != 0 {
            return;
        }
        let Some(return_addr) = read_u64(address_space, rbp + 8) else { return };
        println!("  ^ {:#x}  (frame base {:#x})", return_addr, rbp);
        let Some(next_rbp) = read_u64(address_space, rbp) else { return };
        rbp = next_rbp;
    }
}

fn read_u64(address_space: &AddressSpace, va: u64) -> Option<u64> {
    let page = va - (va % paging::PTE_MAPPED_SIZE);
    let pa = address_space.page_table.translate(page)?;
    let offset = va % paging::PTE_MAPPED_SIZE;
    Some(unsafe { paging::phys_to_virt(pa).add(offset as usize).cast::<u64>().read_unaligned() })
}
