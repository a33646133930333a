//! Wire-format types shared between the kernel and every user-space process:
//! the syscall enumeration, the fixed-size IPC message record, and the
//! closed error enumeration returned in the primary result register.
//!
//! This crate is `no_std` and contains no logic of its own - just the
//! layouts and numbers both sides must agree on.

#![no_std]

/// Maximum length, in bytes, of a process's fixed-width name.
pub const PROCESS_NAME_LEN: usize = 88;

/// Per-process message queue capacity. A `Send` to a process already holding
/// this many queued messages fails with `Error::ReceiversQueueIsFull`.
pub const MESSAGE_QUEUE_CAPACITY: usize = 1024;

/// Sentinel message id returned by `PollMessage` when no message is queued.
pub const NO_MESSAGE: usize = usize::MAX;

/// A process id. Zero is never assigned to a live process.
pub type Pid = u64;
/// A thread id, unique within its owning process.
pub type Tid = u64;
/// A shared-memory segment id, unique kernel-wide.
pub type SegmentId = u64;
/// A registered service/message id. Chosen by convention by each service.
pub type MessageId = usize;

/// The fixed 56-byte message record exchanged between processes.
///
/// `metadata`'s low bit (`Message::TRANSFERS_PAGES`) indicates that `arg4`
/// and `arg5` describe a page range in the sender to transfer into the
/// receiver rather than plain payload words.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender: Pid,
    pub metadata: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
    pub arg5: u64,
}

impl Message {
    /// Bit of `metadata` that marks `arg4`/`arg5` as a page-transfer descriptor
    /// (`arg4` = source virtual address in the sender, `arg5` = page count).
    pub const TRANSFERS_PAGES: u64 = 1 << 0;

    pub const fn new(id: MessageId, sender: Pid) -> Self {
        Self { id, sender, metadata: 0, arg1: 0, arg2: 0, arg3: 0, arg4: 0, arg5: 0 }
    }

    pub const fn transfers_pages(&self) -> bool {
        self.metadata & Self::TRANSFERS_PAGES != 0
    }
}

bitflags::bitflags! {
    /// Flags attached to a shared-memory segment at creation time.
    pub struct SharedMemoryFlags: u64 {
        /// Pages are materialised on first touch rather than up-front; the
        /// creator is notified per miss via `lazy_message_id`.
        const LAZILY_ALLOCATED = 1 << 0;
        /// Joiners other than the creator may write to the segment.
        const JOINERS_CAN_WRITE = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Capability bits carried by a process.
    pub struct ProcessFlags: u32 {
        /// May request privileged I/O and interrupt subscriptions.
        const DRIVER = 1 << 0;
        /// May launch other processes (the ELF loader, the shell, ...).
        const LAUNCHER = 1 << 1;
    }
}

/// The closed error enumeration returned by every syscall and RPC.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Ok = 0,
    InvalidArgument = 1,
    OutOfMemory = 2,
    FileNotFound = 3,
    NotAllowed = 4,
    ProcessDoesNotExist = 5,
    ReceiversQueueIsFull = 6,
    Overflow = 7,
    InternalError = 8,
    Unimplemented = 9,
}

impl Error {
    pub const fn is_ok(self) -> bool {
        matches!(self, Error::Ok)
    }

    pub const fn to_retval(self) -> i64 {
        self as i64
    }

    pub const fn from_retval(v: i64) -> Self {
        match v {
            0 => Error::Ok,
            1 => Error::InvalidArgument,
            2 => Error::OutOfMemory,
            3 => Error::FileNotFound,
            4 => Error::NotAllowed,
            5 => Error::ProcessDoesNotExist,
            6 => Error::ReceiversQueueIsFull,
            7 => Error::Overflow,
            8 => Error::InternalError,
            _ => Error::Unimplemented,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// The closed catalogue of system calls, numbered `0..=61` as specified.
/// Only the entries named in the design are enumerated individually; the
/// remainder of the space is reserved.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    TerminateThisThread = 0,
    CreateThread = 1,
    SetThreadClearOnExitAddr = 2,
    Yield = 3,
    Sleep = 4,
    GetProcessId = 5,
    TerminateThisProcess = 6,
    TerminateProcess = 7,
    CreateProcessSimple = 8,
    GetChildProcessesStatus = 9,
    SetAddressSpaceDestroyNotify = 10,
    GetRunningProcesses = 11,
    AllocateMemoryPages = 12,
    ReleaseMemoryPages = 13,
    MapPhysicalMemory = 14,
    MapFreeMemoryAtAddress = 15,
    GetFreeSystemMemory = 16,
    SendMessage = 17,
    PollMessage = 18,
    SleepForMessage = 19,
    RegisterInterruptMessage = 20,
    UnregisterInterruptMessage = 21,
    GetProcesses = 22,
    GetProcessName = 23,
    GetThreadsOfProcess = 24,
    SetProcessName = 25,
    GetProcessMemoryUsage = 26,
    GetSystemMemoryUsage = 27,
    RegisterMessageToReceiveOnProcessDeath = 28,
    NotifyUponProcessDeath = 29,
    CancelDeathNotification = 30,
    RegisterInterruptHandler = 31,
    RegisterService = 32,
    UnregisterService = 33,
    QueryServices = 34,
    NotifyUponServiceAppearance = 35,
    NotifyUponServiceDisappearance = 36,
    GetServiceOwner = 37,
    GetServicesOfProcess = 38,
    SubscribeToInterrupt = 39,
    UnsubscribeFromInterrupt = 40,
    EnableInterrupts = 41,
    CreateSharedMemory = 42,
    JoinSharedMemory = 43,
    LeaveSharedMemory = 44,
    MovePageIntoSharedMemory = 45,
    SetSharedMemoryAccess = 46,
    GetSharedMemorySize = 47,
    GetSharedMemoryFlags = 48,
    ScheduleEventAfterMicroseconds = 49,
    CancelEvent = 50,
    CreateProcess = 51,
    SetChildMemoryPage = 52,
    StartExecution = 53,
    DestroyChildProcess = 54,
    EnableProfiling = 55,
    DisableAndOutputProfiling = 56,
    SetEnvironmentAddr = 57,
    GetMultibootModule = 58,
    Reboot = 59,
    Shutdown = 60,
    DebugPrint = 61,
}

impl Syscall {
    /// Total number of syscalls in the closed enumeration.
    pub const COUNT: u64 = 62;

    pub const fn from_number(n: u64) -> Option<Self> {
        if n >= Self::COUNT {
            return None;
        }
        // SAFETY: `Syscall` is `repr(u64)` and every value `0..COUNT` is a
        // defined variant, so this transmute is in-range.
        Some(unsafe { core::mem::transmute::<u64, Syscall>(n) })
    }
}

/// Directory query entry returned by `GetProcesses`, paginated twelve at a
/// time as specified for syscall 22.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProcessDirEntry {
    pub pid: Pid,
    pub name: [u8; PROCESS_NAME_LEN],
    pub name_len: u8,
    pub flags: u32,
}

/// Number of entries returned per page by `GetProcesses`.
pub const PROCESS_DIR_PAGE_SIZE: usize = 12;
