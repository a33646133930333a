//! System-call entry and dispatch. The entry vector itself is installed via
//! the `STAR`/`LSTAR`/`SFMASK` MSRs during boot (see [`install`]); this
//! module's `dispatch` is what the assembly stub calls once it has saved
//! the caller's registers into a [`RegisterFrame`] on the kernel stack.
//!
//! Calling convention: syscall number in `rax`, up to eight arguments in
//! `rbx, r12, rdx, rsi, rdi, r8, r9, r10` (diverging from the SysV ABI,
//! and deliberately skipping `rcx`/`r11` - the `syscall` instruction
//! itself clobbers both with the return `rip`/`rflags` before this
//! module ever sees the frame), result in `rax` plus one out-of-band
//! result word in `rbx`.

use amd64::registers::{rdmsr, wrmsr};
use perception_abi::{Error, Message, ProcessFlags, Syscall};

use crate::ipc::{message, shared_memory};
use crate::state::{self, Kernel};
use crate::task::lifecycle;
use crate::task::process::Pid;
use crate::task::scheduler::Scheduler;
use crate::task::thread::{RegisterFrame, Tid};

const STAR_MSR: u64 = 0xC0000081;
const LSTAR_MSR: u64 = 0xC0000082;
const SFMASK_MSR: u64 = 0xC0000084;

/// Installs the `syscall`/`sysret` entry point. Must run once during boot
/// after the GDT carries the kernel/user code and stack selectors the
/// `STAR` layout expects.
///
/// # Safety
/// `entry` must be the address of a valid `syscall`-convention entry stub;
/// the GDT layout must match what `STAR` assumes (kernel CS/SS directly
/// below it, user CS32/SS/CS64 directly above).
pub unsafe fn install(entry: u64) {
    SYSCALL_STACK_TOP = SYSCALL_STACK.0.as_ptr() as u64 + SYSCALL_STACK.0.len() as u64;

    let star = (0x08u64) << 32 | (0x1bu64 - 8) << 48;
    wrmsr(STAR_MSR, star);
    wrmsr(LSTAR_MSR, entry);
    wrmsr(SFMASK_MSR, amd64::registers::RFLAGS::IF.bits());
}

const SYSCALL_STACK_SIZE: usize = 16 * 1024;

#[repr(align(16))]
struct SyscallStack([u8; SYSCALL_STACK_SIZE]);

/// The one dedicated kernel stack every `syscall` lands on - single-CPU, so
/// there's exactly one, never re-entered (interrupts stay off across the
/// stub, and the kernel itself never issues `syscall`).
static mut SYSCALL_STACK: SyscallStack = SyscallStack([0; SYSCALL_STACK_SIZE]);
static mut SYSCALL_STACK_TOP: u64 = 0;

/// Scratch slot for the caller's `rsp`, stashed before switching onto
/// [`SYSCALL_STACK`] - `syscall` doesn't touch `rsp` itself, unlike an
/// interrupt's automatic stack switch via the TSS.
static mut USER_RSP_SCRATCH: u64 = 0;

/// The `syscall` entry point programmed into `LSTAR` by [`install`]. Builds
/// a [`RegisterFrame`] on [`SYSCALL_STACK`] matching that struct's field
/// order exactly, hands it to [`syscall_trampoline`], then restores
/// whatever frame the trampoline leaves behind (not necessarily the one it
/// was given - [`Scheduler::schedule_next`] may have switched threads) and
/// returns with `iretq` rather than `sysretq`, since the frame it restores
/// may belong to the kernel's own idle loop rather than a ring-3 caller.
///
/// `rcx`/`r11` hold the return `rip`/`rflags` on entry (loaded there by
/// `syscall` itself) and are consumed into the frame's `rip`/`rflags`
/// fields; the frame's own `rcx`/`r11` slots are never meaningful and are
/// restored with whatever placeholder value was last written there.
#[naked]
pub unsafe extern "C" fn syscall_entry() -> ! {
    core::arch::asm!(
        "mov [{scratch}], rsp",
        "mov rsp, [{stack_top}]",
        "push 0x1b",
        "push qword ptr [{scratch}]",
        "push r11",
        "push 0x23",
        "push rcx",
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push 0",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rdi",
        "push rsi",
        "push rdx",
        "push 0",
        "push rbx",
        "push rax",
        "mov rdi, rsp",
        "call {trampoline}",
        "pop rax",
        "pop rbx",
        "pop rcx",
        "pop rdx",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "iretq",
        scratch = sym USER_RSP_SCRATCH,
        stack_top = sym SYSCALL_STACK_TOP,
        trampoline = sym syscall_trampoline,
        options(noreturn),
    );
}

/// The Rust side of the entry stub: looks up which thread is running,
/// dispatches the call, then asks the scheduler what should run next and
/// hands that frame back for the stub to restore. Always leaves `*frame`
/// in a state the stub can `iretq` into, whether that's the calling
/// thread resumed, a different thread round-robined in, or the idle loop.
extern "C" fn syscall_trampoline(frame: &mut RegisterFrame) {
    let (process, tid) = {
        let kernel = state::lock();
        let tid = kernel.scheduler.current.expect("syscall trap with no thread scheduled");
        let process = kernel.threads.get(tid).unwrap().process;
        (process, tid)
    };

    dispatch(process, tid, frame);

    let mut kernel = state::lock();
    *frame = Scheduler::schedule_next(&mut kernel);
}

/// Dispatches one system call on behalf of `process`/`tid`, whose saved
/// register frame is `frame`. Mutates `frame` in place with the result;
/// the entry stub is responsible for restoring it.
pub fn dispatch(process: Pid, tid: Tid, frame: &mut RegisterFrame) {
    let number = frame.rax;
    let Some(call) = Syscall::from_number(number) else {
        frame.rax = Error::Unimplemented.to_retval() as u64;
        return;
    };

    let mut kernel = state::lock();
    kernel.threads.get_mut(tid).unwrap().registers = *frame;

    let result = handle(&mut kernel, process, tid, call, frame);

    *frame = kernel.threads.get(tid).unwrap().registers;
    frame.rax = match result {
        Ok(()) => Error::Ok.to_retval() as u64,
        Err(e) => e.to_retval() as u64,
    };
}

fn handle(kernel: &mut Kernel, process: Pid, tid: Tid, call: Syscall, frame: &RegisterFrame) -> Result<(), Error> {
    match call {
        Syscall::TerminateThisThread => {
            lifecycle::terminate_thread(kernel, tid);
            Ok(())
        }
        Syscall::CreateThread => {
            let new_tid = lifecycle::create_thread(kernel, process, frame.rbx, frame.r12)?;
            set_ret(kernel, tid, new_tid.raw() as u64);
            Ok(())
        }
        Syscall::SetThreadClearOnExitAddr => {
            kernel.threads.get_mut(tid).unwrap().clear_on_exit = frame.rbx;
            Ok(())
        }
        Syscall::Yield => {
            let next = Scheduler::schedule_next(kernel);
            kernel.threads.get_mut(tid).unwrap().registers = next;
            Ok(())
        }
        Syscall::Sleep => {
            let wake_at = kernel.timers.now() + frame.rbx;
            let event = kernel.timers.schedule(process, wake_at, SLEEP_WAKE_SENTINEL);
            kernel.processes.get_mut(process).unwrap().timer_events.push(event);
            kernel.threads.get_mut(tid).unwrap().flags |= crate::task::thread::ThreadFlags::WAITING_FOR_TIMER;
            Scheduler::sleep(kernel, tid);
            Ok(())
        }
        Syscall::GetProcessId => {
            set_ret(kernel, tid, process.raw() as u64);
            Ok(())
        }
        Syscall::TerminateThisProcess => {
            lifecycle::terminate_process(kernel, process);
            Ok(())
        }
        Syscall::TerminateProcess => {
            let target = Pid::from_raw(frame.rbx as u32);
            lifecycle::terminate_process(kernel, target);
            Ok(())
        }
        Syscall::CreateProcessSimple => {
            let flags = ProcessFlags::from_bits_truncate(frame.r12 as u32);
            let name = read_name(kernel, process, frame.rbx, frame.rdx);
            let pid = lifecycle::create_process(kernel, &name, flags)?;
            set_ret(kernel, tid, pid.raw() as u64);
            Ok(())
        }
        Syscall::AllocateMemoryPages => {
            let pages = frame.rbx;
            let base = kernel.processes.get_mut(process).unwrap().address_space.allocate(pages * crate::mm::paging::PTE_MAPPED_SIZE, true)?;
            set_ret(kernel, tid, base);
            Ok(())
        }
        Syscall::ReleaseMemoryPages => {
            let base = frame.rbx;
            kernel.processes.get_mut(process).unwrap().address_space.release(base)
        }
        Syscall::GetFreeSystemMemory => {
            set_ret(kernel, tid, crate::mm::frame::free_frame_count() as u64);
            Ok(())
        }
        Syscall::SendMessage => {
            let target = Pid::from_raw(frame.rbx as u32);
            let mut msg = Message::new(frame.r12 as usize, process.raw() as u64);
            msg.metadata = frame.rdx;
            msg.arg1 = frame.rsi;
            msg.arg2 = frame.rdi;
            msg.arg3 = frame.r8;
            msg.arg4 = frame.r9;
            msg.arg5 = frame.r10;
            message::send(kernel, process, target, msg)
        }
        Syscall::PollMessage => {
            message::receive_polling(kernel, process, tid);
            Ok(())
        }
        Syscall::SleepForMessage => {
            message::receive_blocking(kernel, process, tid);
            Ok(())
        }
        Syscall::RegisterService => {
            let name = read_name(kernel, process, frame.rbx, frame.r12);
            let (_id, notify) = kernel.services.register(process, frame.rdx, &name);
            for (subscriber, notify_id) in notify {
                let mut msg = Message::new(notify_id as usize, 0);
                msg.arg1 = process.raw() as u64;
                let _ = message::send(kernel, process, subscriber, msg);
            }
            Ok(())
        }
        Syscall::NotifyUponServiceAppearance => {
            let name = read_name(kernel, process, frame.rbx, frame.r12);
            kernel.services.subscribe_appearance(&name, process, frame.rdx);
            Ok(())
        }
        Syscall::GetServiceOwner => {
            match kernel.services.find_by_message_id(frame.rbx) {
                Some(entry) => {
                    set_ret(kernel, tid, entry.owner.raw() as u64);
                    Ok(())
                }
                None => Err(Error::FileNotFound),
            }
        }
        Syscall::RegisterMessageToReceiveOnProcessDeath => {
            let target = Pid::from_raw(frame.rbx as u32);
            if kernel.processes.contains(target) {
                kernel.processes.get_mut(target).unwrap().death_subscribers.push(process);
                Ok(())
            } else {
                Err(Error::ProcessDoesNotExist)
            }
        }
        Syscall::CreateSharedMemory => {
            let flags = perception_abi::SharedMemoryFlags::from_bits_truncate(frame.r12);
            let id = shared_memory::create(kernel, process, frame.rbx, flags)?;
            if flags.contains(perception_abi::SharedMemoryFlags::LAZILY_ALLOCATED) {
                shared_memory::set_lazy_message_id(kernel, id, frame.rdx);
            }
            set_ret(kernel, tid, id.raw() as u64);
            Ok(())
        }
        Syscall::JoinSharedMemory => {
            let id = crate::arena::Id::from_raw(frame.rbx as u32);
            let base = shared_memory::join(kernel, process, id)?;
            set_ret(kernel, tid, base);
            Ok(())
        }
        Syscall::LeaveSharedMemory => {
            let id = crate::arena::Id::from_raw(frame.rbx as u32);
            shared_memory::leave(kernel, process, id)
        }
        Syscall::MovePageIntoSharedMemory => {
            let id = crate::arena::Id::from_raw(frame.rbx as u32);
            shared_memory::move_page_into_segment(kernel, process, id, frame.r12, frame.rdx)
        }
        Syscall::ScheduleEventAfterMicroseconds => {
            let at = kernel.timers.now() + frame.rbx;
            let event = kernel.timers.schedule(process, at, frame.r12);
            kernel.processes.get_mut(process).unwrap().timer_events.push(event);
            set_ret(kernel, tid, event.raw() as u64);
            Ok(())
        }
        Syscall::CancelEvent => {
            let event = crate::arena::Id::from_raw(frame.rbx as u32);
            kernel.timers.cancel(event);
            Ok(())
        }
        Syscall::DebugPrint => {
            let text = read_name(kernel, process, frame.rbx, frame.r12);
            if let Ok(s) = core::str::from_utf8(&text) {
                crate::println!("{}", s);
            }
            Ok(())
        }
        Syscall::UnregisterService => {
            let id = match kernel.services.find_id_by_message_id(frame.rbx) {
                Some(id) => id,
                None => return Err(Error::FileNotFound),
            };
            if let Some(subs) = kernel.services.unregister(id) {
                for (subscriber, notify_id) in subs {
                    let mut msg = Message::new(notify_id as usize, 0);
                    msg.arg1 = process.raw() as u64;
                    let _ = message::send(kernel, process, subscriber, msg);
                }
            }
            Ok(())
        }
        Syscall::NotifyUponServiceDisappearance => {
            let service = kernel.services.find_id_by_message_id(frame.rbx).ok_or(Error::FileNotFound)?;
            kernel.services.subscribe_disappearance(service, process, frame.r12);
            Ok(())
        }
        Syscall::NotifyUponProcessDeath => {
            let target = Pid::from_raw(frame.rbx as u32);
            if !kernel.processes.contains(target) {
                return Err(Error::ProcessDoesNotExist);
            }
            kernel.processes.get_mut(target).unwrap().death_subscribers.push(process);
            Ok(())
        }
        Syscall::SetAddressSpaceDestroyNotify => {
            kernel.processes.get_mut(process).unwrap().death_notify_message_id = frame.rbx;
            Ok(())
        }
        Syscall::GetProcessName => {
            let target = Pid::from_raw(frame.rbx as u32);
            let p = kernel.processes.get(target).ok_or(Error::ProcessDoesNotExist)?;
            write_name(kernel, process, frame.r12, p.name());
            Ok(())
        }
        Syscall::SetProcessName => {
            let name = read_name(kernel, process, frame.rbx, frame.r12);
            kernel.processes.get_mut(process).unwrap().set_name(&name);
            Ok(())
        }
        Syscall::GetProcesses => {
            let offset = frame.rbx as usize;
            let buf_ptr = frame.r12;
            let n = list_processes(kernel, process, offset, buf_ptr);
            set_ret(kernel, tid, n as u64);
            Ok(())
        }
        Syscall::GetThreadsOfProcess => {
            let target = Pid::from_raw(frame.rbx as u32);
            let count = kernel.processes.get(target).ok_or(Error::ProcessDoesNotExist)?.thread_count;
            set_ret(kernel, tid, count as u64);
            Ok(())
        }
        Syscall::GetChildProcessesStatus => {
            let count = kernel.processes.get(process).unwrap().children_creating.len();
            set_ret(kernel, tid, count as u64);
            Ok(())
        }
        Syscall::MapFreeMemoryAtAddress => {
            let va = frame.rbx;
            let pages = frame.r12;
            let space = &mut kernel.processes.get_mut(process).unwrap().address_space;
            space.reserve_at(va, pages * crate::mm::paging::PTE_MAPPED_SIZE)?;
            Ok(())
        }
        Syscall::MapPhysicalMemory => {
            let pa = frame.rbx;
            let pages = frame.r12;
            let base = {
                let space = &mut kernel.processes.get_mut(process).unwrap().address_space;
                let base = space.reserve(pages * crate::mm::paging::PTE_MAPPED_SIZE)?;
                let mut alloc_frame = || crate::mm::frame::acquire().ok();
                for i in 0..pages {
                    let va = base + i * crate::mm::paging::PTE_MAPPED_SIZE;
                    let page_pa = pa + i * crate::mm::paging::PTE_MAPPED_SIZE;
                    unsafe {
                        let _ = space.page_table.map(va, page_pa, false, true, true, false, &mut alloc_frame);
                    }
                }
                base
            };
            set_ret(kernel, tid, base);
            Ok(())
        }
        Syscall::SetSharedMemoryAccess => {
            let id = crate::arena::Id::from_raw(frame.rbx as u32);
            shared_memory::set_access(kernel, process, id, frame.r12 != 0)
        }
        Syscall::GetSharedMemorySize => {
            let id = crate::arena::Id::from_raw(frame.rbx as u32);
            let pages = kernel.segments.get(id).ok_or(Error::InvalidArgument)?.page_count;
            set_ret(kernel, tid, pages);
            Ok(())
        }
        Syscall::GetSharedMemoryFlags => {
            let id = crate::arena::Id::from_raw(frame.rbx as u32);
            let flags = kernel.segments.get(id).ok_or(Error::InvalidArgument)?.flags;
            set_ret(kernel, tid, flags.bits());
            Ok(())
        }
        Syscall::CreateProcess => {
            let flags = ProcessFlags::from_bits_truncate(frame.r12 as u32);
            let name = read_name(kernel, process, frame.rbx, frame.rdx);
            let child = lifecycle::create_child_process(kernel, process, &name, flags)?;
            set_ret(kernel, tid, child.raw() as u64);
            Ok(())
        }
        Syscall::SetChildMemoryPage => {
            let child = Pid::from_raw(frame.rbx as u32);
            let src_va = frame.r12;
            let dst_va = frame.rdx;
            let writable = frame.rsi != 0;
            lifecycle::set_child_memory_page(kernel, process, child, src_va, dst_va, writable)
        }
        Syscall::StartExecution => {
            let child = Pid::from_raw(frame.rbx as u32);
            let entry = frame.r12;
            let main_tid = lifecycle::start_executing_child(kernel, process, child, entry)?;
            set_ret(kernel, tid, main_tid.raw() as u64);
            Ok(())
        }
        Syscall::DestroyChildProcess => {
            let child = Pid::from_raw(frame.rbx as u32);
            lifecycle::destroy_child_process(kernel, process, child)
        }
        Syscall::EnableProfiling => {
            kernel.processes.get_mut(process).unwrap().profiling_started_at = Some(amd64::registers::rdtsc());
            Ok(())
        }
        Syscall::DisableAndOutputProfiling => {
            let started = kernel.processes.get_mut(process).unwrap().profiling_started_at.take();
            let elapsed = started.map_or(0, |start| amd64::registers::rdtsc().saturating_sub(start));
            set_ret(kernel, tid, elapsed);
            Ok(())
        }
        Syscall::SetEnvironmentAddr => {
            kernel.processes.get_mut(process).unwrap().environment_addr = frame.rbx;
            Ok(())
        }
        Syscall::RegisterInterruptMessage => {
            if !kernel.processes.get(process).unwrap().is_driver() {
                return Err(Error::NotAllowed);
            }
            let vector = frame.rbx as u8;
            kernel.processes.get_mut(process).unwrap().interrupt_subscriptions.push((vector, frame.r12));
            Ok(())
        }
        Syscall::UnregisterInterruptMessage => {
            let vector = frame.rbx as u8;
            kernel.processes.get_mut(process).unwrap().interrupt_subscriptions.retain(|&(v, _)| v != vector);
            Ok(())
        }
        Syscall::QueryServices => {
            let name = read_name(kernel, process, frame.rbx, frame.r12);
            match kernel.services.find_by_name(&name) {
                Some((_, entry)) => {
                    set_ret(kernel, tid, entry.owner.raw() as u64);
                    Ok(())
                }
                None => Err(Error::FileNotFound),
            }
        }
        Syscall::GetServicesOfProcess => {
            let count = kernel.processes.get(process).unwrap().service_subscriptions.len();
            set_ret(kernel, tid, count as u64);
            Ok(())
        }
        Syscall::GetRunningProcesses => {
            set_ret(kernel, tid, kernel.processes.iter().count() as u64);
            Ok(())
        }
        Syscall::GetProcessMemoryUsage => {
            let target = Pid::from_raw(frame.rbx as u32);
            let p = kernel.processes.get(target).ok_or(Error::ProcessDoesNotExist)?;
            set_ret(kernel, tid, p.address_space.committed_pages() as u64);
            Ok(())
        }
        Syscall::GetSystemMemoryUsage => {
            let total: usize = kernel.processes.iter().map(|(_, p)| p.address_space.committed_pages()).sum();
            set_ret(kernel, tid, total as u64);
            Ok(())
        }
        Syscall::CancelDeathNotification => {
            let target = Pid::from_raw(frame.rbx as u32);
            if let Some(p) = kernel.processes.get_mut(target) {
                p.death_subscribers.retain(|&pid| pid != process);
            }
            Ok(())
        }
        Syscall::RegisterInterruptHandler | Syscall::EnableInterrupts => {
            // Driver I/O privilege is granted at thread creation time
            // (`lifecycle::create_thread` sets IOPL from `ProcessFlags::DRIVER`);
            // these calls just assert the caller actually has it.
            if !kernel.processes.get(process).unwrap().is_driver() {
                return Err(Error::NotAllowed);
            }
            Ok(())
        }
        Syscall::SubscribeToInterrupt => {
            if !kernel.processes.get(process).unwrap().is_driver() {
                return Err(Error::NotAllowed);
            }
            let vector = frame.rbx as u8;
            kernel.processes.get_mut(process).unwrap().interrupt_subscriptions.push((vector, frame.r12));
            Ok(())
        }
        Syscall::UnsubscribeFromInterrupt => {
            let vector = frame.rbx as u8;
            kernel.processes.get_mut(process).unwrap().interrupt_subscriptions.retain(|&(v, _)| v != vector);
            Ok(())
        }
        Syscall::GetMultibootModule => {
            // BOOTBOOT has no module tag chain; the one payload a process
            // could ask for this way, the init ELF image, is already loaded
            // directly by `kernel::init` before any process exists to ask.
            Err(Error::Unimplemented)
        }
        Syscall::Reboot | Syscall::Shutdown => {
            // Handled by the platform-specific ACPI/keyboard-controller path
            // the interrupt layer installs; here we only validate the
            // caller's privilege.
            if !kernel.processes.get(process).unwrap().is_driver() {
                return Err(Error::NotAllowed);
            }
            Ok(())
        }
        _ => Err(Error::Unimplemented),
    }
}

/// Stashes a call's out-of-band return value in `rbx`. `rax` itself is set
/// uniformly by [`dispatch`] once `handle` returns, so callers only need to
/// record extra result words here.
fn set_ret(kernel: &mut Kernel, tid: Tid, value: u64) {
    kernel.threads.get_mut(tid).unwrap().registers.rbx = value;
}

/// Copies a length-prefixed name out of the caller's address space. Used by
/// the handful of calls that pass a process/service name by user pointer;
/// `len` is capped to the wire format's fixed name length.
/// Writes `bytes` into the caller's address space starting at `ptr`,
/// page-walking the destination the same way [`read_name`] walks the
/// source. Used by calls that hand small fixed records back to user space
/// (process names, directory pages) rather than returning them in
/// registers.
fn write_name(kernel: &Kernel, process: Pid, ptr: u64, bytes: &[u8]) {
    let space = &kernel.processes.get(process).unwrap().address_space;
    for (i, byte) in bytes.iter().enumerate() {
        let va = ptr + i as u64;
        let page = va - (va % crate::mm::paging::PTE_MAPPED_SIZE);
        if let Some(pa) = space.page_table.translate(page) {
            let offset = va % crate::mm::paging::PTE_MAPPED_SIZE;
            unsafe { crate::mm::paging::phys_to_virt(pa).add(offset as usize).write(*byte) };
        }
    }
}

/// `GetProcesses`: writes up to [`perception_abi::PROCESS_DIR_PAGE_SIZE`]
/// [`perception_abi::ProcessDirEntry`] records, covering the `offset`-th
/// live process onward in arena order, into the caller's buffer at
/// `buf_ptr`. Returns the number of entries actually written; the caller
/// re-queries with an advanced offset until it gets back fewer than a full
/// page.
fn list_processes(kernel: &Kernel, caller: Pid, offset: usize, buf_ptr: u64) -> usize {
    use perception_abi::{ProcessDirEntry, PROCESS_DIR_PAGE_SIZE};

    let entries: alloc::vec::Vec<ProcessDirEntry> = kernel
        .processes
        .iter()
        .skip(offset)
        .take(PROCESS_DIR_PAGE_SIZE)
        .map(|(pid, p)| {
            let mut name = [0u8; perception_abi::PROCESS_NAME_LEN];
            name[..p.name().len()].copy_from_slice(p.name());
            ProcessDirEntry { pid: pid.raw() as u64, name, name_len: p.name_len, flags: p.flags.bits() }
        })
        .collect();

    let bytes = entries.len() * core::mem::size_of::<ProcessDirEntry>();
    let src = entries.as_ptr().cast::<u8>();
    let slice = unsafe { core::slice::from_raw_parts(src, bytes) };
    write_name(kernel, caller, buf_ptr, slice);
    entries.len()
}

fn read_name(kernel: &Kernel, process: Pid, ptr: u64, len: u64) -> alloc::vec::Vec<u8> {
    let len = (len as usize).min(perception_abi::PROCESS_NAME_LEN);
    let mut out = alloc::vec![0u8; len];
    let space = &kernel.processes.get(process).unwrap().address_space;
    for (i, byte) in out.iter_mut().enumerate() {
        let va = ptr + i as u64;
        let page = va - (va % crate::mm::paging::PTE_MAPPED_SIZE);
        if let Some(pa) = space.page_table.translate(page) {
            let offset = va % crate::mm::paging::PTE_MAPPED_SIZE;
            *byte = unsafe { crate::mm::paging::phys_to_virt(pa).add(offset as usize).read() };
        }
    }
    out
}
