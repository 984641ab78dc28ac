// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The wait-object protocol.
//!
//! Every waitable object answers `should_wait` (is acquisition blocked for
//! this thread right now?) and `acquire` (perform the acquisition side
//! effect; only legal when `should_wait` is false). Signalling an object
//! resumes eligible waiters: best priority first, arrival order on ties,
//! re-checking eligibility per thread so wait-all threads only leave when
//! every object they observe is ready at once.

use rytra_common::ObjectId;

use crate::kernel::KernelContext;
use crate::object::KernelObject;
use crate::thread::{ThreadStatus, WakeupReason, THREAD_PRIO_LOWEST};

impl KernelContext {
    /// Whether acquisition of `object` is currently blocked for `thread`.
    pub fn should_wait(&self, object: ObjectId, thread: ObjectId) -> bool {
        match self.arena.get(object) {
            Some(KernelObject::Thread(t)) => t.status != ThreadStatus::Dead,
            Some(KernelObject::Mutex(m)) => {
                m.lock_count > 0 && m.holding_thread != Some(thread)
            }
            Some(KernelObject::Semaphore(s)) => s.available_count <= 0,
            Some(KernelObject::Event(e)) => !e.signaled,
            Some(KernelObject::Timer(t)) => !t.signaled,
            Some(KernelObject::ServerPort(p)) => p.pending_sessions.is_empty(),
            Some(KernelObject::ServerSession(s)) => {
                // A dead client means the session never blocks again; the
                // waiter observes the closure on acquire.
                if self.session_ref(s.session).client.is_none() {
                    return false;
                }
                s.pending_requesting_threads.is_empty() || s.currently_handling.is_some()
            }
            Some(other) => panic!("{} is not a wait object", other.type_name()),
            None => panic!("should_wait on dead object {object}"),
        }
    }

    /// Perform the acquisition side effect of `object` for `thread`.
    pub(crate) fn wait_object_acquire(&mut self, object: ObjectId, thread: ObjectId) {
        debug_assert!(!self.should_wait(object, thread), "object unavailable!");
        // Pre-read the session liveness; the client may have hung up while
        // the waiter was eligible.
        let session_client_alive = self
            .arena
            .try_server_session_ref(object)
            .map(|s| self.session_ref(s.session).client.is_some());

        let mutex_first_lock = match self.arena.get_mut(object) {
            Some(KernelObject::Thread(_)) => false,
            Some(KernelObject::Mutex(m)) => {
                if m.lock_count == 0 {
                    m.holding_thread = Some(thread);
                    m.lock_count = 1;
                    true
                } else {
                    m.lock_count += 1;
                    false
                }
            }
            Some(KernelObject::Semaphore(s)) => {
                s.available_count -= 1;
                false
            }
            Some(KernelObject::Event(e)) => {
                if e.reset_type == crate::event::ResetType::OneShot {
                    e.signaled = false;
                }
                false
            }
            Some(KernelObject::Timer(t)) => {
                if t.reset_type == crate::event::ResetType::OneShot {
                    t.signaled = false;
                }
                false
            }
            Some(KernelObject::ServerPort(_)) => false,
            Some(KernelObject::ServerSession(s)) => {
                // With the client gone this session is inert; the closure is
                // reported by the receive path.
                if session_client_alive == Some(true) {
                    s.currently_handling = s.pending_requesting_threads.pop_front();
                }
                false
            }
            Some(other) => panic!("{} is not a wait object", other.type_name()),
            None => panic!("acquire on dead object {object}"),
        };

        if mutex_first_lock {
            self.thread_mut(thread).held_mutexes.push(object);
            self.update_thread_priority(thread);
        }
    }

    /// Append `thread` to the object's waiter set.
    pub(crate) fn wait_object_add_waiter(&mut self, object: ObjectId, thread: ObjectId) {
        match self.arena.get_mut(object) {
            Some(o) => match o.waiters_mut() {
                Some(waiters) => waiters.push(thread),
                None => panic!("{} is not a wait object", o.type_name()),
            },
            None => panic!("add_waiter on dead object {object}"),
        }
        // Blocking on a mutex feeds the holder's priority inheritance.
        if self.arena.try_mutex_ref(object).is_some() {
            self.thread_mut(thread).pending_mutexes.push(object);
            self.mutex_update_priority(object);
        }
    }

    /// Remove `thread` from the object's waiter set.
    pub(crate) fn wait_object_remove_waiter(&mut self, object: ObjectId, thread: ObjectId) {
        if let Some(o) = self.arena.get_mut(object) {
            if let Some(waiters) = o.waiters_mut() {
                if let Some(pos) = waiters.iter().position(|&t| t == thread) {
                    waiters.remove(pos);
                }
            }
        }
        if self.arena.try_mutex_ref(object).is_some() {
            self.thread_mut(thread).pending_mutexes.retain(|&m| m != object);
            self.mutex_update_priority(object);
        }
    }

    /// Resume every waiter that can complete its wait now that `object`
    /// signalled.
    pub(crate) fn wake_up_all_waiters(&mut self, object: ObjectId) {
        while let Some(thread_id) = self.best_eligible_waiter(object) {
            let wait_all = self.thread_ref(thread_id).status == ThreadStatus::WaitSynchAll;
            if !wait_all {
                self.wait_object_acquire(object, thread_id);
            } else {
                // Wait-all: every observed object is ready; acquire them all
                // in list order.
                let objects = self.thread_ref(thread_id).wait_objects.clone();
                for o in objects {
                    self.wait_object_acquire(o, thread_id);
                }
            }

            // Deliver the wakeup before detaching from the wait objects so
            // the callback can still compute the output index.
            self.invoke_wakeup_callback(thread_id, WakeupReason::Signal, Some(object));

            let objects = std::mem::take(&mut self.thread_mut(thread_id).wait_objects);
            for o in objects {
                self.wait_object_remove_waiter(o, thread_id);
            }
            self.resume_thread_from_wait(thread_id);
        }
    }

    /// Best-priority waiter whose wait can complete right now; arrival order
    /// breaks priority ties.
    fn best_eligible_waiter(&self, object: ObjectId) -> Option<ObjectId> {
        let waiters = self.arena.get(object)?.waiters()?;
        let mut candidate = None;
        let mut candidate_priority = THREAD_PRIO_LOWEST + 1;

        for &thread_id in waiters {
            let thread = self.thread_ref(thread_id);
            debug_assert!(
                matches!(
                    thread.status,
                    ThreadStatus::WaitSynchAny | ThreadStatus::WaitSynchAll
                ),
                "inconsistent thread status in waiter set"
            );
            if thread.current_priority >= candidate_priority {
                continue;
            }
            if self.should_wait(object, thread_id) {
                continue;
            }
            let ready_to_run = if thread.status == ThreadStatus::WaitSynchAll {
                thread
                    .wait_objects
                    .iter()
                    .all(|&o| !self.should_wait(o, thread_id))
            } else {
                true
            };
            if ready_to_run {
                candidate = Some(thread_id);
                candidate_priority = thread.current_priority;
            }
        }
        candidate
    }
}
