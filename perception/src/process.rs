//! Thread and process lifecycle wrappers: creating and terminating threads
//! and processes, and the four `CreateProcess`/`SetChildMemoryPage`/
//! `StartExecution`/`DestroyChildProcess` primitives the ELF loader uses to
//! assemble a child's address space before it runs.

use perception_abi::{Error, Pid, ProcessFlags, Syscall, Tid};

use crate::syscall::{call0, call1};

pub fn this_process_id() -> Pid {
    call1(Syscall::GetProcessId, 0, 0, 0, 0, 0, 0, 0, 0).unwrap_or(0)
}

pub fn create_thread(entry: u64, arg: u64) -> Result<Tid, Error> {
    call1(Syscall::CreateThread, entry, arg, 0, 0, 0, 0, 0, 0)
}

pub fn set_clear_on_exit_addr(addr: u64) {
    let _ = call0(Syscall::SetThreadClearOnExitAddr, addr, 0, 0, 0, 0, 0, 0, 0);
}

pub fn terminate_this_thread() -> ! {
    let _ = call0(Syscall::TerminateThisThread, 0, 0, 0, 0, 0, 0, 0, 0);
    unreachable!("a terminated thread does not resume")
}

pub fn terminate_this_process() -> ! {
    let _ = call0(Syscall::TerminateThisProcess, 0, 0, 0, 0, 0, 0, 0, 0);
    unreachable!("a terminated process does not resume")
}

pub fn terminate_process(pid: Pid) -> Result<(), Error> {
    call0(Syscall::TerminateProcess, pid, 0, 0, 0, 0, 0, 0, 0)
}

pub fn create_process_simple(name: &[u8], flags: ProcessFlags) -> Result<Pid, Error> {
    call1(Syscall::CreateProcessSimple, name.as_ptr() as u64, flags.bits() as u64, name.len() as u64, 0, 0, 0, 0, 0)
}

/// Creates a child process in the *creating* state. Only the ELF loader
/// (and anything else assembling a child address space page by page) has
/// any use for this; every other launcher wants [`create_process_simple`].
pub fn create_process(name: &[u8], flags: ProcessFlags) -> Result<Pid, Error> {
    call1(Syscall::CreateProcess, name.as_ptr() as u64, flags.bits() as u64, name.len() as u64, 0, 0, 0, 0, 0)
}

/// Moves one page from `src_va` in the caller's address space to `dst_va`
/// in `child`'s, unmapping it in the caller. `child` must still be in the
/// caller's creating list.
pub fn set_child_memory_page(child: Pid, src_va: u64, dst_va: u64, writable: bool) -> Result<(), Error> {
    call0(Syscall::SetChildMemoryPage, child, src_va, dst_va, writable as u64, 0, 0, 0, 0)
}

/// Spawns `child`'s first thread at `entry` and graduates it out of the
/// creating state, returning the new thread's id.
pub fn start_execution(child: Pid, entry: u64) -> Result<Tid, Error> {
    call1(Syscall::StartExecution, child, entry, 0, 0, 0, 0, 0, 0)
}

/// Tears down a child still in the creating state, e.g. because loading it
/// failed partway through.
pub fn destroy_child_process(child: Pid) -> Result<(), Error> {
    call0(Syscall::DestroyChildProcess, child, 0, 0, 0, 0, 0, 0, 0)
}

pub fn notify_upon_process_death(target: Pid) -> Result<(), Error> {
    call0(Syscall::NotifyUponProcessDeath, target, 0, 0, 0, 0, 0, 0, 0)
}

/// Writes `s` to the kernel console, the same path `println!` in the
/// kernel itself goes through. Used by this crate's services for their
/// panic handlers, where there is no heap-backed formatting machinery
/// worth depending on.
pub fn debug_print(s: &str) {
    let bytes = s.as_bytes();
    let _ = call0(Syscall::DebugPrint, bytes.as_ptr() as u64, bytes.len() as u64, 0, 0, 0, 0, 0, 0);
}
