// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use rytra_common::ObjectId;

use crate::kernel::KernelContext;

/// How an event (or timer) returns to the non-signalled state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResetType {
    /// Consumed by the first thread that acquires it.
    OneShot = 0,
    /// Stays signalled until explicitly cleared.
    Sticky = 1,
    /// Releases all current waiters, then reverts on its own.
    Pulse = 2,
}

impl ResetType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::OneShot),
            1 => Some(Self::Sticky),
            2 => Some(Self::Pulse),
            _ => None,
        }
    }
}

pub struct Event {
    pub reset_type: ResetType,
    pub signaled: bool,
    pub waiters: Vec<ObjectId>,
    pub name: String,
}

impl Event {
    pub fn new(reset_type: ResetType, name: String) -> Self {
        Self {
            reset_type,
            signaled: false,
            waiters: Vec::new(),
            name,
        }
    }
}

impl KernelContext {
    pub(crate) fn event_signal(&mut self, event_id: ObjectId) {
        self.event_mut(event_id).signaled = true;
        self.wake_up_all_waiters(event_id);
        // A pulse releases whoever was already waiting and leaves nothing
        // behind.
        if self.event_ref(event_id).reset_type == ResetType::Pulse {
            self.event_mut(event_id).signaled = false;
        }
    }

    pub(crate) fn event_clear(&mut self, event_id: ObjectId) {
        self.event_mut(event_id).signaled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::{block_on_any, boot, spawn_thread};
    use crate::thread::ThreadStatus;

    #[test]
    fn test_sticky_event_stays_signalled() {
        let (mut kernel, _cpu, _process, main) = boot();
        let event = kernel.create_event(ResetType::Sticky, "ev".into());
        kernel.event_signal(event);
        assert!(!kernel.should_wait(event, main));
        kernel.wait_object_acquire(event, main);
        // Sticky events survive acquisition until cleared.
        assert!(!kernel.should_wait(event, main));
        kernel.event_clear(event);
        assert!(kernel.should_wait(event, main));
    }

    #[test]
    fn test_oneshot_event_consumed_by_first_acquirer() {
        let (mut kernel, _cpu, _process, main) = boot();
        let event = kernel.create_event(ResetType::OneShot, "ev".into());
        kernel.event_signal(event);
        kernel.wait_object_acquire(event, main);
        assert!(kernel.should_wait(event, main));
    }

    #[test]
    fn test_pulse_event_releases_current_waiters_only() {
        let (mut kernel, _cpu, process, _main) = boot();
        let waiter1 = spawn_thread(&mut kernel, process, 50);
        let waiter2 = spawn_thread(&mut kernel, process, 50);
        let event = kernel.create_event(ResetType::Pulse, "ev".into());

        block_on_any(&mut kernel, waiter1, &[event]);
        block_on_any(&mut kernel, waiter2, &[event]);
        kernel.event_signal(event);

        assert_eq!(kernel.thread_ref(waiter1).status, ThreadStatus::Ready);
        assert_eq!(kernel.thread_ref(waiter2).status, ThreadStatus::Ready);
        // Nothing sticks around for late arrivals.
        assert!(!kernel.event_ref(event).signaled);
    }

    #[test]
    fn test_signal_wakes_best_priority_first() {
        let (mut kernel, _cpu, process, _main) = boot();
        let low = spawn_thread(&mut kernel, process, 60);
        let high = spawn_thread(&mut kernel, process, 20);
        let event = kernel.create_event(ResetType::OneShot, "ev".into());

        block_on_any(&mut kernel, low, &[event]);
        block_on_any(&mut kernel, high, &[event]);
        kernel.event_signal(event);

        // One-shot: only the best-priority waiter is released.
        assert_eq!(kernel.thread_ref(high).status, ThreadStatus::Ready);
        assert_eq!(kernel.thread_ref(low).status, ThreadStatus::WaitSynchAny);
    }
}
