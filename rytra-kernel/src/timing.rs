// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Cycle-keyed event queue driving timed wakeups.
//!
//! The kernel schedules wakeups in guest cycles; the CPU loop advances guest
//! time in slices and delivers the events that became due. Events carry a
//! small sum type instead of callbacks so the queue stays free of borrows
//! into the kernel context.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rytra_common::ThreadId;

/// Kernel-side timing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelEvent {
    /// Timed wakeup for a sleeping or waiting thread.
    ThreadWakeup { thread_id: ThreadId },
    /// A timer object's due time elapsed.
    TimerSignal { callback_id: u64 },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct ScheduledEvent {
    fire_tick: u64,
    /// Monotonic sequence number; keeps delivery stable for events scheduled
    /// for the same tick.
    order: u64,
    event: KernelEvent,
}

// BinaryHeap is a max-heap; invert the ordering to pop the earliest event.
impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.fire_tick, other.order).cmp(&(self.fire_tick, self.order))
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The core timing wheel.
pub struct CoreTiming {
    ticks: u64,
    next_order: u64,
    queue: BinaryHeap<ScheduledEvent>,
}

impl CoreTiming {
    pub fn new() -> Self {
        Self {
            ticks: 0,
            next_order: 0,
            queue: BinaryHeap::new(),
        }
    }

    /// Current guest time in ARM11 cycles.
    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Advance guest time without delivering events (GetSystemTick skew).
    pub fn add_ticks(&mut self, cycles: u64) {
        self.ticks += cycles;
    }

    /// Schedule an event `cycles_into_future` from now.
    pub fn schedule_event(&mut self, cycles_into_future: u64, event: KernelEvent) {
        let order = self.next_order;
        self.next_order += 1;
        self.queue.push(ScheduledEvent {
            fire_tick: self.ticks + cycles_into_future,
            order,
            event,
        });
    }

    /// Drop any pending wakeup for the given thread.
    pub fn unschedule_thread_wakeup(&mut self, thread_id: ThreadId) {
        self.unschedule(|ev| matches!(ev, KernelEvent::ThreadWakeup { thread_id: t } if *t == thread_id));
    }

    /// Drop any pending signal for the given timer callback id.
    pub fn unschedule_timer(&mut self, callback_id: u64) {
        self.unschedule(|ev| matches!(ev, KernelEvent::TimerSignal { callback_id: c } if *c == callback_id));
    }

    fn unschedule(&mut self, matches: impl Fn(&KernelEvent) -> bool) {
        let events: Vec<_> = self
            .queue
            .drain()
            .filter(|scheduled| !matches(&scheduled.event))
            .collect();
        self.queue = events.into();
    }

    /// Advance guest time by `cycles` and return the events that became due,
    /// in firing order, each paired with how many cycles late it fired.
    pub fn advance(&mut self, cycles: u64) -> Vec<(KernelEvent, i64)> {
        self.ticks += cycles;
        let mut fired = Vec::new();
        while let Some(head) = self.queue.peek() {
            if head.fire_tick > self.ticks {
                break;
            }
            let scheduled = self.queue.pop().unwrap();
            fired.push((scheduled.event, (self.ticks - scheduled.fire_tick) as i64));
        }
        fired
    }
}

impl Default for CoreTiming {
    fn default() -> Self {
        Self::new()
    }
}
