//! Threads: a saved register frame, a stack, lazily-saved FPU state, and the
//! scheduling flags that tell the scheduler which of the three blocking
//! lists (if any) the thread currently lives on.

use crate::arena::Id;
use crate::task::process::Pid;
use crate::utils::idlist::Links;

pub type Tid = Id<Thread>;

/// The general-purpose register file saved/restored across a context
/// switch, laid out to match what the syscall entry stub and the IRET frame
/// push, in that order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl RegisterFrame {
    /// A frame for a brand new thread: everything zeroed except the
    /// instruction pointer, stack pointer, the single argument word in
    /// `rdi`, and the flags/segment selectors appropriate for `user`.
    /// `driver` grants IOPL 3, letting a ring-3 driver thread execute `in`/
    /// `out`/`cli`/`sti` directly rather than trapping to the kernel for
    /// every port access.
    pub fn for_new_thread(rip: u64, rsp: u64, arg: u64, user: bool, driver: bool) -> Self {
        let (cs, ss) = if user { (USER_CS, USER_SS) } else { (KERNEL_CS, KERNEL_SS) };
        let mut rflags = amd64::registers::RFLAGS::IF;
        if driver {
            rflags |= amd64::registers::RFLAGS::IOPL_MASK;
        }
        Self { rip, rsp, rdi: arg, cs, ss, rflags: rflags.bits(), ..Default::default() }
    }
}

const KERNEL_CS: u64 = 0x08;
const KERNEL_SS: u64 = 0x10;
const USER_CS: u64 = 0x23;
const USER_SS: u64 = 0x1b;

/// A 512-byte, 16-byte aligned FXSAVE area. The scheduler only ever touches
/// this opaquely via `fxsave`/`fxrstor`.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FpuArea([u8; 512]);

impl FpuArea {
    pub const fn new() -> Self {
        Self([0u8; 512])
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct ThreadFlags: u32 {
        const AWAKE = 1 << 0;
        const WAITING_FOR_MESSAGE = 1 << 1;
        const WAITING_FOR_SHARED_PAGE = 1 << 2;
        const WAITING_FOR_TIMER = 1 << 3;
        const TOUCHED_FPU = 1 << 4;
        const IS_DRIVER = 1 << 5;
    }
}

pub struct Thread {
    pub process: Pid,
    pub registers: RegisterFrame,
    pub fpu: FpuArea,
    pub stack_base: u64,
    pub stack_pages: u64,
    pub flags: ThreadFlags,
    /// Address zeroed on thread exit, musl-style robust-list teardown for
    /// thread-local storage. `0` means unset.
    pub clear_on_exit: u64,
    /// Links for whichever single list currently owns this thread: the
    /// scheduler's awake list, a message-wait list, a shared-page waiter
    /// list, or a process's own thread list - exactly one at a time.
    pub owner_links: Links<Tid>,
    /// A thread also always belongs to its owning process's thread list,
    /// independent of which scheduling list it's on.
    pub process_links: Links<Tid>,
}

impl Thread {
    pub fn new(process: Pid, registers: RegisterFrame, stack_base: u64, stack_pages: u64, driver: bool) -> Self {
        let mut flags = ThreadFlags::AWAKE;
        if driver {
            flags |= ThreadFlags::IS_DRIVER;
        }
        Self {
            process,
            registers,
            fpu: FpuArea::new(),
            stack_base,
            stack_pages,
            flags,
            clear_on_exit: 0,
            owner_links: Links::new(),
            process_links: Links::new(),
        }
    }
}
