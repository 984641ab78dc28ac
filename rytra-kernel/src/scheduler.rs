// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Thread scheduling and context switching.
//!
//! Cooperative, single core: a reschedule only happens at SVC boundaries and
//! timing-wheel delivery points. Selection is strict priority with FIFO
//! inside a level; an optional starvation booster temporarily raises threads
//! that sat Ready for too long.

use rytra_cpu::CpuState;

use rytra_common::ObjectId;

use crate::kernel::KernelContext;
use crate::thread::ThreadStatus;

/// A Ready thread older than this many ticks gets a temporary boost.
const BOOST_TIMEOUT_TICKS: u64 = 2_000_000;

/// Boosted threads never get a priority better than this.
const BOOST_PRIORITY_FLOOR: u32 = 40;

impl KernelContext {
    /// Pick the next thread and switch to it. Called at the dispatcher
    /// boundary after a handler requested a reschedule.
    pub fn reschedule(&mut self, cpu: &mut CpuState) {
        self.reschedule_pending = false;
        if self.settings.priority_boost {
            self.priority_boost_starved_threads();
        }
        let current = self.current_thread;
        let next = self.pop_next_ready_thread();
        match (current, next) {
            (Some(c), Some(n)) => log::trace!("context switch {c} -> {n}"),
            (Some(c), None) => log::trace!("context switch {c} -> idle"),
            (None, Some(n)) => log::trace!("context switch idle -> {n}"),
            (None, None) => {}
        }
        self.switch_context(cpu, next);
    }

    /// Whether any thread is queued to run.
    pub fn have_ready_threads(&self) -> bool {
        self.ready_queue.get_first().is_some()
    }

    /// Put the running thread to sleep (SleepThread).
    pub(crate) fn wait_current_thread_sleep(&mut self) {
        if let Some(thread_id) = self.current_thread {
            self.thread_mut(thread_id).status = ThreadStatus::WaitSleep;
        }
    }

    fn pop_next_ready_thread(&mut self) -> Option<ObjectId> {
        if let Some(current) = self.current_thread {
            if self
                .try_thread_ref(current)
                .map_or(false, |t| t.status == ThreadStatus::Running)
            {
                // The running thread keeps the core unless somebody strictly
                // better is queued.
                let priority = self.thread_ref(current).current_priority;
                return self.ready_queue.pop_first_better(priority).or(Some(current));
            }
        }
        self.ready_queue.pop_first()
    }

    fn switch_context(&mut self, cpu: &mut CpuState, new_thread: Option<ObjectId>) {
        // Save the outgoing thread. It may already be gone when it exited.
        if let Some(previous) = self.current_thread {
            if self.try_thread_ref(previous).is_some() {
                let ticks = self.timing.ticks();
                let requeue = {
                    let thread = self.thread_mut(previous);
                    thread.last_running_ticks = ticks;
                    thread.context = cpu.clone();
                    if thread.status == ThreadStatus::Running {
                        // Preempted without yielding; it goes back to the
                        // front of its bucket.
                        thread.status = ThreadStatus::Ready;
                        Some(thread.current_priority)
                    } else {
                        None
                    }
                };
                if let Some(priority) = requeue {
                    self.ready_queue.push_front(priority, previous);
                }
            }
        }

        let Some(new_id) = new_thread else {
            // Idle. The current process and page table stay; the threads are
            // merely paused.
            self.current_thread = None;
            return;
        };

        assert!(
            self.thread_ref(new_id).status == ThreadStatus::Ready,
            "thread must be ready to become running"
        );
        self.timing
            .unschedule_thread_wakeup(self.thread_ref(new_id).thread_id);

        self.current_thread = Some(new_id);
        let priority = self.thread_ref(new_id).current_priority;
        self.ready_queue.remove(priority, new_id);
        self.thread_mut(new_id).status = ThreadStatus::Running;
        if self.settings.priority_boost {
            let thread = self.thread_mut(new_id);
            thread.current_priority = thread.nominal_priority;
        }

        let owner = self.thread_ref(new_id).owner_process;
        if self.current_process != Some(owner) {
            // Page-table switch: guest accesses resolve through the current
            // process's VM map from here on.
            self.current_process = Some(owner);
        }

        *cpu = self.thread_ref(new_id).context.clone();
        cpu.cp15_thread_uro = self.thread_ref(new_id).tls_address;
    }

    /// Temporarily boost Ready threads that have been starved of the core.
    fn priority_boost_starved_threads(&mut self) {
        let current_ticks = self.timing.ticks();
        let Some(head) = self.ready_queue.get_first() else {
            return;
        };
        let head_priority = self.thread_ref(head).current_priority;

        for thread_id in self.thread_list.clone() {
            let thread = self.thread_ref(thread_id);
            if thread.status != ThreadStatus::Ready {
                continue;
            }
            let delta = current_ticks.saturating_sub(thread.last_running_ticks);
            if delta > BOOST_TIMEOUT_TICKS {
                let priority = head_priority.saturating_sub(1).max(BOOST_PRIORITY_FLOOR);
                self.boost_thread_priority(thread_id, priority);
            }
        }
    }

    // -- Priority management ------------------------------------------------

    /// Set a thread's nominal (and current) priority, repositioning it in
    /// the ready queue if needed.
    pub fn set_thread_priority(&mut self, thread_id: ObjectId, priority: u32) {
        let (status, current) = {
            let thread = self.thread_ref(thread_id);
            (thread.status, thread.current_priority)
        };
        if status == ThreadStatus::Ready {
            self.ready_queue.move_thread(thread_id, current, priority);
        } else {
            self.ready_queue.prepare(priority);
        }
        let thread = self.thread_mut(thread_id);
        thread.nominal_priority = priority;
        thread.current_priority = priority;
    }

    /// Recompute a thread's effective priority from its nominal priority and
    /// the mutexes it holds.
    pub(crate) fn update_thread_priority(&mut self, thread_id: ObjectId) {
        let mut best = self.thread_ref(thread_id).nominal_priority;
        for mutex_id in self.thread_ref(thread_id).held_mutexes.clone() {
            let inherited = self.mutex_ref(mutex_id).priority;
            if inherited < best {
                best = inherited;
            }
        }
        self.boost_thread_priority(thread_id, best);
    }

    /// Change a thread's effective priority, repositioning it in the ready
    /// queue if needed.
    pub(crate) fn boost_thread_priority(&mut self, thread_id: ObjectId, priority: u32) {
        let (status, current) = {
            let thread = self.thread_ref(thread_id);
            (thread.status, thread.current_priority)
        };
        if status == ThreadStatus::Ready {
            self.ready_queue.move_thread(thread_id, current, priority);
        } else {
            self.ready_queue.prepare(priority);
        }
        self.thread_mut(thread_id).current_priority = priority;
    }
}
