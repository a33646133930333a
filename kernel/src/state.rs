//! The kernel's central, single global lock. With one CPU and a
//! non-preemptible kernel, every subsystem's process-wide data - the process
//! and thread arenas, the scheduler's run queue, shared-memory segments, the
//! service directory, and the timer queue - can live behind exactly one
//! `Mutex`, entered once at syscall/interrupt dispatch and held for the
//! duration of that call. No finer-grained locking is needed or used.

use spin::{Mutex, MutexGuard};

use crate::arena::Arena;
use crate::ipc::shared_memory::{Segment, SegmentMapping};
use crate::svc::services::ServiceRegistry;
use crate::svc::timer::TimerQueue;
use crate::task::process::Process;
use crate::task::scheduler::Scheduler;
use crate::task::thread::Thread;

pub struct Kernel {
    pub processes: Arena<Process>,
    pub threads: Arena<Thread>,
    pub scheduler: Scheduler,
    pub segments: Arena<Segment>,
    pub mappings: Arena<SegmentMapping>,
    pub services: ServiceRegistry,
    pub timers: TimerQueue,
}

impl Kernel {
    const fn new() -> Self {
        Self {
            processes: Arena::new(),
            threads: Arena::new(),
            scheduler: Scheduler::new(),
            segments: Arena::new(),
            mappings: Arena::new(),
            services: ServiceRegistry::new(),
            timers: TimerQueue::new(),
        }
    }
}

static KERNEL: Mutex<Kernel> = Mutex::new(Kernel::new());

/// Locks and returns the single kernel state guard. Syscall entry takes this
/// once per call; nothing below this layer locks it again.
pub fn lock() -> MutexGuard<'static, Kernel> {
    KERNEL.lock()
}
