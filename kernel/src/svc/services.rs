//! The service directory: a `(process, message id) -> name` map that lets
//! one process publish "send me message id N to talk to service NAME" and
//! lets others discover it, plus appearance/disappearance notifications.

use alloc::vec::Vec;

use crate::arena::{Arena, Id};
use crate::task::process::{Pid, PROCESS_NAME_LEN};

pub type ServiceId = Id<ServiceEntry>;

pub struct ServiceEntry {
    pub owner: Pid,
    pub message_id: u64,
    pub name: [u8; PROCESS_NAME_LEN],
    pub name_len: u8,
    /// `(subscriber, message id to deliver)` pairs, one per
    /// `NotifyUponServiceDisappearance` call against this service.
    pub disappearance_subscribers: Vec<(Pid, u64)>,
}

impl ServiceEntry {
    pub fn name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }
}

pub struct ServiceRegistry {
    services: Arena<ServiceEntry>,
    /// Kept sorted by message id so a lookup by message id is a binary
    /// search rather than a linear scan.
    by_message_id: Vec<(u64, ServiceId)>,
    /// Processes to notify (with the message id they asked for) whenever
    /// any service whose name matches appears.
    appearance_subscribers: Vec<(alloc::vec::Vec<u8>, Pid, u64)>,
}

impl ServiceRegistry {
    pub const fn new() -> Self {
        Self { services: Arena::new(), by_message_id: Vec::new(), appearance_subscribers: Vec::new() }
    }

    /// Registers `owner` as the handler of `message_id`, named `name`.
    /// Returns the new service id and the set of `(subscriber, notify_id)`
    /// pairs whose appearance subscription this satisfies, for the caller
    /// to deliver as kernel-origin messages.
    pub fn register(&mut self, owner: Pid, message_id: u64, name: &[u8]) -> (ServiceId, Vec<(Pid, u64)>) {
        let mut stored = [0u8; PROCESS_NAME_LEN];
        let len = name.len().min(PROCESS_NAME_LEN);
        stored[..len].copy_from_slice(&name[..len]);
        let id = self.services.insert(ServiceEntry {
            owner,
            message_id,
            name: stored,
            name_len: len as u8,
            disappearance_subscribers: Vec::new(),
        });
        let pos = self.by_message_id.partition_point(|&(m, _)| m <= message_id);
        self.by_message_id.insert(pos, (message_id, id));

        let matched = self
            .appearance_subscribers
            .iter()
            .filter(|(n, _, _)| n.as_slice() == &stored[..len])
            .map(|(_, pid, notify)| (*pid, *notify))
            .collect();
        (id, matched)
    }

    /// Removes a service, returning its disappearance subscribers (with the
    /// message id each registered) so the caller can notify each of them.
    pub fn unregister(&mut self, id: ServiceId) -> Option<Vec<(Pid, u64)>> {
        let entry = self.services.remove(id);
        if let Some(pos) = self.by_message_id.iter().position(|&(m, i)| m == entry.message_id && i == id) {
            self.by_message_id.remove(pos);
        }
        Some(entry.disappearance_subscribers)
    }

    /// Removes every service owned by `owner`, e.g. on process destruction,
    /// returning `(subscriber list)` per removed service for notification.
    pub fn unregister_all_owned_by(&mut self, owner: Pid) -> Vec<Vec<(Pid, u64)>> {
        let ids: Vec<ServiceId> = self
            .services
            .iter()
            .filter(|(_, s)| s.owner == owner)
            .map(|(id, _)| id)
            .collect();
        ids.into_iter().filter_map(|id| self.unregister(id)).collect()
    }

    pub fn find_by_message_id(&self, message_id: u64) -> Option<&ServiceEntry> {
        let pos = self.by_message_id.partition_point(|&(m, _)| m < message_id);
        let (m, id) = *self.by_message_id.get(pos)?;
        (m == message_id).then(|| self.services.get(id).unwrap())
    }

    /// Same lookup as [`find_by_message_id`](Self::find_by_message_id) but
    /// also returns the service's own id, for callers that need to mutate
    /// (unregister, subscribe) rather than just read.
    pub fn find_id_by_message_id(&self, message_id: u64) -> Option<ServiceId> {
        let pos = self.by_message_id.partition_point(|&(m, _)| m < message_id);
        let (m, id) = *self.by_message_id.get(pos)?;
        (m == message_id).then_some(id)
    }

    /// Linear scan by name; the directory is small and this call is rare
    /// compared to the message-id lookup used on every IPC-bound service.
    pub fn find_by_name(&self, name: &[u8]) -> Option<(ServiceId, &ServiceEntry)> {
        self.services.iter().find(|(_, s)| s.name() == name)
    }

    pub fn subscribe_disappearance(&mut self, service: ServiceId, subscriber: Pid, notify_message_id: u64) {
        if let Some(entry) = self.services.get_mut(service) {
            entry.disappearance_subscribers.push((subscriber, notify_message_id));
        }
    }

    pub fn subscribe_appearance(&mut self, name: &[u8], subscriber: Pid, notify_message_id: u64) {
        self.appearance_subscribers.push((name.to_vec(), subscriber, notify_message_id));
    }

    pub fn unsubscribe_all(&mut self, subscriber: Pid) {
        self.appearance_subscribers.retain(|(_, pid, _)| *pid != subscriber);
        for (_, entry) in self.services.iter_mut() {
            entry.disappearance_subscribers.retain(|(pid, _)| *pid != subscriber);
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
