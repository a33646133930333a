//! Cooperative round-robin scheduling, preempted only by the timer tick.
//! `awake_threads` is the doubly-linked list of runnable threads; `current`
//! names the running one, or the kernel idles (`hlt`-loops in the shared
//! kernel address space) when it's empty.

use amd64::registers::CR3;

use crate::mm::paging::PhysAddr;
use crate::state::Kernel;
use crate::task::thread::{RegisterFrame, ThreadFlags, Tid};
use crate::utils::idlist::IdList;

pub struct Scheduler {
    awake: IdList<Tid>,
    pub current: Option<Tid>,
    idle_pml4: PhysAddr,
    current_pml4: PhysAddr,
    idle_frame: RegisterFrame,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            awake: IdList::new(),
            current: None,
            idle_pml4: 0,
            current_pml4: 0,
            idle_frame: RegisterFrame {
                rax: 0, rbx: 0, rcx: 0, rdx: 0, rsi: 0, rdi: 0, rbp: 0,
                r8: 0, r9: 0, r10: 0, r11: 0, r12: 0, r13: 0, r14: 0, r15: 0,
                rip: 0, cs: 0, rflags: 0, rsp: 0, ss: 0,
            },
        }
    }

    /// Called once during boot, after the kernel's own address space and
    /// idle loop entry point are known.
    pub fn init(&mut self, kernel_pml4: PhysAddr, idle_rip: u64, idle_rsp: u64) {
        self.idle_pml4 = kernel_pml4;
        self.current_pml4 = kernel_pml4;
        self.idle_frame = RegisterFrame::for_new_thread(idle_rip, idle_rsp, 0, false, false);
    }

    /// Enqueues `tid` onto the back of the run queue. The caller is
    /// responsible for having set `ThreadFlags::AWAKE` and cleared whichever
    /// wait flag applied.
    pub fn wake(kernel: &mut Kernel, tid: Tid) {
        kernel.threads.get_mut(tid).unwrap().flags.insert(ThreadFlags::AWAKE);
        let threads = &mut kernel.threads;
        kernel.scheduler.awake.push_back(tid, |i| &mut threads.get_mut(i).unwrap().owner_links);
    }

    /// Removes `tid` from the run queue without changing `current`. Used
    /// when a thread blocks on message receive, a shared page, or a timer.
    pub fn sleep(kernel: &mut Kernel, tid: Tid) {
        kernel.threads.get_mut(tid).unwrap().flags.remove(ThreadFlags::AWAKE);
        let threads = &mut kernel.threads;
        kernel.scheduler.awake.remove(tid, |i| &mut threads.get_mut(i).unwrap().owner_links);
    }

    /// Advances to the next runnable thread and switches to it. Called at
    /// every timer tick and by the `yield` system call. Never returns if it
    /// resumes a thread or the idle loop; the call site (interrupt/syscall
    /// return path) is expected to already be on the way out when this is
    /// invoked last.
    pub fn schedule_next(kernel: &mut Kernel) -> RegisterFrame {
        if let Some(cur) = kernel.scheduler.current {
            let touched_fpu = kernel.threads.get(cur).unwrap().flags.contains(ThreadFlags::TOUCHED_FPU);
            if touched_fpu {
                save_fpu(cur, kernel);
            }
            // Round-robin: move current to the tail if it's still awake
            // (i.e. it wasn't just put to sleep by the caller).
            if kernel.threads.get(cur).unwrap().flags.contains(ThreadFlags::AWAKE) {
                let threads = &mut kernel.threads;
                kernel.scheduler.awake.remove(cur, |i| &mut threads.get_mut(i).unwrap().owner_links);
                let threads = &mut kernel.threads;
                kernel.scheduler.awake.push_back(cur, |i| &mut threads.get_mut(i).unwrap().owner_links);
            }
        }

        let next = kernel.scheduler.awake.head;
        kernel.scheduler.current = next;

        match next {
            None => {
                if kernel.scheduler.current_pml4 != kernel.scheduler.idle_pml4 {
                    switch_address_space(kernel.scheduler.idle_pml4);
                    kernel.scheduler.current_pml4 = kernel.scheduler.idle_pml4;
                }
                kernel.scheduler.idle_frame
            }
            Some(tid) => {
                let pml4 = {
                    let thread = kernel.threads.get(tid).unwrap();
                    kernel.processes.get(thread.process).unwrap().address_space.page_table.pml4
                };
                if pml4 != kernel.scheduler.current_pml4 {
                    switch_address_space(pml4);
                    kernel.scheduler.current_pml4 = pml4;
                }
                restore_fpu_on_demand(tid, kernel);
                kernel.threads.get(tid).unwrap().registers
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn switch_address_space(pml4: PhysAddr) {
    unsafe { CR3::set_nflags(pml4 as usize) };
}

fn save_fpu(tid: Tid, kernel: &mut Kernel) {
    let thread = kernel.threads.get_mut(tid).unwrap();
    let ptr = thread.fpu.as_mut_ptr();
    unsafe { core::arch::asm!("fxsave [{}]", in(reg) ptr, options(nostack)) };
    thread.flags.remove(ThreadFlags::TOUCHED_FPU);
}

/// FPU state is restored lazily: the actual `fxrstor` happens on the first
/// device-not-available fault taken by the resumed thread, not here. This
/// hook only exists so `schedule_next` has a single place documenting that
/// choice.
fn restore_fpu_on_demand(_tid: Tid, _kernel: &mut Kernel) {}
