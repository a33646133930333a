//! Processes: a name, an address space, and the handful of linked lists
//! every other subsystem threads its per-process bookkeeping through.

use alloc::vec::Vec;

use crate::arena::Id;
use crate::ipc::message::MessageSlot;
use crate::ipc::shared_memory::SegmentMapping;
use crate::mm::addrspace::AddressSpace;
use crate::svc::timer::TimerEventId;
use crate::task::thread::Tid;
use crate::utils::idlist::IdList;
use perception_abi::ProcessFlags;

pub type Pid = Id<Process>;

pub const PROCESS_NAME_LEN: usize = perception_abi::PROCESS_NAME_LEN;

pub struct Process {
    pub name: [u8; PROCESS_NAME_LEN],
    pub name_len: u8,
    pub flags: ProcessFlags,
    pub address_space: AddressSpace,

    pub threads: IdList<Tid>,
    pub thread_count: usize,

    pub message_queue: IdList<MessageSlot>,
    pub messages_queued: usize,
    /// Threads of this process currently parked in `receive_blocking`,
    /// oldest first. A thread lives on exactly one of: the scheduler's
    /// awake list, this list, a shared-segment page-waiter list, or none
    /// (its own thread list membership is separate and permanent).
    pub receive_waiters: IdList<Tid>,

    pub joined_segments: IdList<SegmentMapping>,

    /// Children currently being constructed by the loader on this process's
    /// behalf; membership here, not process existence, is what makes a
    /// child "creating".
    pub children_creating: Vec<Pid>,

    /// Message ids this process has registered interest in receiving
    /// service-appearance/disappearance notifications for.
    pub service_subscriptions: Vec<u64>,
    /// Other processes that asked to be notified when this one dies.
    pub death_subscribers: Vec<Pid>,

    pub timer_events: Vec<TimerEventId>,

    /// Interrupt vectors this process (a driver) has registered a message
    /// for. Cleared wholesale on destruction.
    pub interrupt_subscriptions: Vec<(u8, u64)>,

    /// Message id this process wants used when it is named as the subject of
    /// a death or address-space-destroy notification. Set by
    /// `SetAddressSpaceDestroyNotify`; zero until then.
    pub death_notify_message_id: u64,

    /// Environment configuration pointer handed down via `SetEnvironmentAddr`,
    /// e.g. the BOOTBOOT env string address forwarded to the first process.
    pub environment_addr: u64,

    /// Timestamp-counter reading taken by `EnableProfiling`, or `None` if
    /// profiling isn't currently running for this process.
    pub profiling_started_at: Option<u64>,
}

impl Process {
    pub fn new(name: &[u8], flags: ProcessFlags, address_space: AddressSpace) -> Self {
        let mut stored = [0u8; PROCESS_NAME_LEN];
        let len = name.len().min(PROCESS_NAME_LEN);
        stored[..len].copy_from_slice(&name[..len]);
        Self {
            name: stored,
            name_len: len as u8,
            flags,
            address_space,
            threads: IdList::new(),
            thread_count: 0,
            message_queue: IdList::new(),
            messages_queued: 0,
            receive_waiters: IdList::new(),
            joined_segments: IdList::new(),
            children_creating: Vec::new(),
            service_subscriptions: Vec::new(),
            death_subscribers: Vec::new(),
            timer_events: Vec::new(),
            interrupt_subscriptions: Vec::new(),
            death_notify_message_id: 0,
            environment_addr: 0,
            profiling_started_at: None,
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }

    pub fn set_name(&mut self, name: &[u8]) {
        let len = name.len().min(PROCESS_NAME_LEN);
        self.name[..len].copy_from_slice(&name[..len]);
        self.name[len..].fill(0);
        self.name_len = len as u8;
    }

    pub fn is_driver(&self) -> bool {
        self.flags.contains(ProcessFlags::DRIVER)
    }

    pub fn is_launcher(&self) -> bool {
        self.flags.contains(ProcessFlags::LAUNCHER)
    }
}
