//! A single ascending-timestamp queue of timer events. Each process also
//! keeps the ids of its own pending events so destruction can cancel them
//! without scanning the whole queue.

use alloc::vec::Vec;

use crate::arena::{Arena, Id};
use crate::task::process::Pid;

pub type TimerEventId = Id<TimerEvent>;

pub struct TimerEvent {
    pub process: Pid,
    pub trigger_at_micros: u64,
    pub message_id: u64,
}

/// The PIT tick counter, advanced by the timer interrupt handler. Microsecond
/// resolution is a property of the PIT's programmed divisor, not of this
/// counter's unit; callers treat it as an opaque monotonically increasing
/// clock.
pub struct TimerQueue {
    events: Arena<TimerEvent>,
    /// Ascending by `(trigger_at_micros, id)`; the id tiebreaker preserves
    /// insertion order for events sharing a timestamp.
    order: Vec<TimerEventId>,
    now_micros: u64,
}

impl TimerQueue {
    pub const fn new() -> Self {
        Self { events: Arena::new(), order: Vec::new(), now_micros: 0 }
    }

    pub fn now(&self) -> u64 {
        self.now_micros
    }

    /// Schedules `message_id` to be delivered to `process` once the clock
    /// reaches `trigger_at_micros` or later.
    pub fn schedule(&mut self, process: Pid, trigger_at_micros: u64, message_id: u64) -> TimerEventId {
        let id = self.events.insert(TimerEvent { process, trigger_at_micros, message_id });
        let pos = self
            .order
            .partition_point(|&other| self.events.get(other).unwrap().trigger_at_micros <= trigger_at_micros);
        self.order.insert(pos, id);
        id
    }

    /// Cancels a previously scheduled event, e.g. on process destruction.
    pub fn cancel(&mut self, id: TimerEventId) {
        if let Some(pos) = self.order.iter().position(|&e| e == id) {
            self.order.remove(pos);
        }
        if self.events.contains(id) {
            self.events.remove(id);
        }
    }

    /// Advances the clock to `now_micros` and drains every event whose
    /// trigger time has passed, returning `(process, message_id)` pairs in
    /// firing order for the caller to deliver as kernel-origin messages.
    pub fn advance(&mut self, now_micros: u64) -> Vec<(Pid, u64)> {
        self.now_micros = now_micros;
        let mut fired = Vec::new();
        while let Some(&first) = self.order.first() {
            let event = self.events.get(first).unwrap();
            if event.trigger_at_micros > now_micros {
                break;
            }
            fired.push((event.process, event.message_id));
            self.order.remove(0);
            self.events.remove(first);
        }
        fired
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}
