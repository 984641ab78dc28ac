// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use rytra_common::{ns_to_cycles, ObjectId};

use crate::event::ResetType;
use crate::kernel::KernelContext;
use crate::timing::KernelEvent;

pub struct Timer {
    pub reset_type: ResetType,
    pub signaled: bool,
    /// Delay before the first signal, in nanoseconds.
    pub initial_delay: u64,
    /// Rearm interval in nanoseconds; 0 = one-shot.
    pub interval_delay: u64,
    /// Key into the kernel's timer callback table, used by the timing wheel.
    pub callback_id: u64,
    pub waiters: Vec<ObjectId>,
    pub name: String,
}

impl Timer {
    pub fn new(reset_type: ResetType, callback_id: u64, name: String) -> Self {
        Self {
            reset_type,
            signaled: false,
            initial_delay: 0,
            interval_delay: 0,
            callback_id,
            waiters: Vec::new(),
            name,
        }
    }
}

impl KernelContext {
    /// Arm the timer. An initial delay of zero signals immediately.
    pub(crate) fn timer_set(&mut self, timer_id: ObjectId, initial_ns: u64, interval_ns: u64) {
        let callback_id = {
            let timer = self.timer_mut(timer_id);
            timer.initial_delay = initial_ns;
            timer.interval_delay = interval_ns;
            timer.callback_id
        };
        self.timing.unschedule_timer(callback_id);

        if initial_ns == 0 {
            self.timer_signal_fired(callback_id, 0);
        } else {
            self.timing
                .schedule_event(ns_to_cycles(initial_ns), KernelEvent::TimerSignal { callback_id });
        }
    }

    /// Disarm the timer without touching its signalled state.
    pub(crate) fn timer_cancel(&mut self, timer_id: ObjectId) {
        let callback_id = self.timer_ref(timer_id).callback_id;
        self.timing.unschedule_timer(callback_id);
    }

    /// Reset the signalled state.
    pub(crate) fn timer_clear(&mut self, timer_id: ObjectId) {
        self.timer_mut(timer_id).signaled = false;
    }

    /// Timing-wheel delivery: signal the timer and rearm if periodic.
    pub(crate) fn timer_signal_fired(&mut self, callback_id: u64, cycles_late: i64) {
        let Some(&timer_id) = self.timer_callback_table.get(&callback_id) else {
            log::error!("timer callback fired for stale callback id {callback_id}");
            return;
        };
        log::trace!("timer {timer_id} fired, {cycles_late} cycles late");

        self.timer_mut(timer_id).signaled = true;
        self.wake_up_all_waiters(timer_id);
        if self.timer_ref(timer_id).reset_type == ResetType::Pulse {
            self.timer_mut(timer_id).signaled = false;
        }

        let interval = self.timer_ref(timer_id).interval_delay;
        if interval != 0 {
            let cycles = ns_to_cycles(interval).saturating_sub(cycles_late.max(0) as u64);
            self.timing
                .schedule_event(cycles, KernelEvent::TimerSignal { callback_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::event::ResetType;
    use crate::kernel::test_support::boot;
    use rytra_common::ns_to_cycles;
    use rytra_cpu::CpuState;

    #[test]
    fn test_one_shot_timer_signals_once() {
        let (mut kernel, mut cpu, _process, main) = boot();
        let timer = kernel.create_timer(ResetType::Sticky, "timer".into());
        kernel.timer_set(timer, 1_000_000, 0);

        assert!(kernel.should_wait(timer, main));
        kernel.advance_ticks(&mut cpu, ns_to_cycles(1_000_000) + 1);
        assert!(!kernel.should_wait(timer, main));

        // No interval: nothing rearms.
        kernel.timer_clear(timer);
        kernel.advance_ticks(&mut cpu, ns_to_cycles(10_000_000));
        assert!(kernel.should_wait(timer, main));
    }

    #[test]
    fn test_interval_timer_rearms() {
        let (mut kernel, mut cpu, _process, _main) = boot();
        let timer = kernel.create_timer(ResetType::Sticky, "timer".into());
        kernel.timer_set(timer, 1_000_000, 2_000_000);

        kernel.advance_ticks(&mut cpu, ns_to_cycles(1_000_000) + 1);
        assert!(kernel.timer_ref(timer).signaled);

        kernel.timer_clear(timer);
        kernel.advance_ticks(&mut cpu, ns_to_cycles(2_000_000) + 1);
        assert!(kernel.timer_ref(timer).signaled);
    }

    #[test]
    fn test_zero_initial_signals_immediately() {
        let (mut kernel, _cpu, _process, _main) = boot();
        let timer = kernel.create_timer(ResetType::OneShot, "timer".into());
        kernel.timer_set(timer, 0, 0);
        assert!(kernel.timer_ref(timer).signaled);
    }

    #[test]
    fn test_cancel_disarms() {
        let (mut kernel, _cpu, _process, _main) = boot();
        let timer = kernel.create_timer(ResetType::Sticky, "timer".into());
        kernel.timer_set(timer, 1_000_000, 0);
        kernel.timer_cancel(timer);

        let mut cpu = CpuState::new();
        kernel.advance_ticks(&mut cpu, ns_to_cycles(10_000_000));
        assert!(!kernel.timer_ref(timer).signaled);
    }
}
