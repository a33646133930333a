//! The service directory: register a `(message id, name)` pair so other
//! processes can discover how to talk to you, or look up someone else's.
//!
//! Every RPC-style service in this tree (the storage manager, the loader)
//! registers exactly one message id under a well-known name at startup and
//! answers requests sent to that id via [`crate::ipc::receive_blocking`].

use perception_abi::{Error, Pid, Syscall};

use crate::syscall::{call0, call1};

/// Advertises that this process handles message id `message_id` as the
/// named service `name`. Appearance subscribers registered against `name`
/// are notified by the kernel as part of this call.
pub fn register(name: &[u8], message_id: u64) -> Result<(), Error> {
    call0(Syscall::RegisterService, name.as_ptr() as u64, name.len() as u64, message_id, 0, 0, 0, 0, 0)
}

/// Withdraws the service registered against `message_id`, notifying
/// disappearance subscribers.
pub fn unregister(message_id: u64) -> Result<(), Error> {
    call0(Syscall::UnregisterService, message_id, 0, 0, 0, 0, 0, 0, 0)
}

/// Looks up the owning process of the service named `name`.
pub fn query(name: &[u8]) -> Result<Pid, Error> {
    call1(Syscall::QueryServices, name.as_ptr() as u64, name.len() as u64, 0, 0, 0, 0, 0, 0)
}

/// Returns the owner of the service registered under `message_id`.
pub fn owner_of(message_id: u64) -> Result<Pid, Error> {
    call1(Syscall::GetServiceOwner, message_id, 0, 0, 0, 0, 0, 0, 0)
}

/// Asks to be sent `notify_message_id` the first time a service named
/// `name` appears (or immediately, if one already has).
pub fn notify_on_appearance(name: &[u8], notify_message_id: u64) -> Result<(), Error> {
    call0(Syscall::NotifyUponServiceAppearance, name.as_ptr() as u64, name.len() as u64, notify_message_id, 0, 0, 0, 0, 0)
}

/// Asks to be sent `notify_message_id` if the service registered under
/// `message_id` ever disappears (its owner dies or unregisters it).
pub fn notify_on_disappearance(message_id: u64, notify_message_id: u64) -> Result<(), Error> {
    call0(Syscall::NotifyUponServiceDisappearance, message_id, notify_message_id, 0, 0, 0, 0, 0, 0)
}
