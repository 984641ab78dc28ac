// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Reentrant guest mutexes with priority inheritance.
//!
//! A mutex tracks the best (numerically lowest) priority among its pending
//! waiters in `priority`; the holder folds that value into its own effective
//! priority via `update_thread_priority`, so a boost propagates through
//! chains of held mutexes.

use rytra_common::{error, ObjectId, ResultCode};

use crate::kernel::KernelContext;
use crate::thread::THREAD_PRIO_LOWEST;

pub struct Mutex {
    /// Number of times the holder has acquired the mutex.
    pub lock_count: u32,
    /// Best priority among pending waiters; LOWEST when uncontended.
    pub priority: u32,
    /// Current holder, if locked.
    pub holding_thread: Option<ObjectId>,
    /// Threads blocked on this mutex, arrival order.
    pub waiters: Vec<ObjectId>,
    pub name: String,
}

impl Mutex {
    pub fn new(name: String) -> Self {
        Self {
            lock_count: 0,
            priority: THREAD_PRIO_LOWEST,
            holding_thread: None,
            waiters: Vec::new(),
            name,
        }
    }
}

impl KernelContext {
    /// Recompute a mutex's inherited priority from its pending waiters and
    /// push the change into the holder.
    pub(crate) fn mutex_update_priority(&mut self, mutex_id: ObjectId) {
        let (holder, waiters) = {
            let mutex = self.mutex_ref(mutex_id);
            (mutex.holding_thread, mutex.waiters.clone())
        };
        let Some(holder) = holder else {
            return;
        };

        let mut best_priority = THREAD_PRIO_LOWEST;
        for waiter in waiters {
            let priority = self.thread_ref(waiter).current_priority;
            if priority < best_priority {
                best_priority = priority;
            }
        }

        if best_priority != self.mutex_ref(mutex_id).priority {
            self.mutex_mut(mutex_id).priority = best_priority;
            self.update_thread_priority(holder);
        }
    }

    /// Release a mutex held by `thread`. Ownership transfers to the best
    /// pending waiter once the lock count reaches zero.
    pub(crate) fn mutex_release(
        &mut self,
        mutex_id: ObjectId,
        thread_id: ObjectId,
    ) -> ResultCode {
        let mutex = self.mutex_ref(mutex_id);
        if mutex.holding_thread != Some(thread_id) {
            if let Some(holder) = mutex.holding_thread {
                log::error!(
                    "thread {} tried to release a mutex held by thread {}",
                    self.thread_ref(thread_id).thread_id,
                    self.thread_ref(holder).thread_id,
                );
            }
            return error::WRONG_LOCKING_THREAD;
        }

        self.mutex_mut(mutex_id).lock_count -= 1;

        // Yield the mutex only once it is fully released.
        if self.mutex_ref(mutex_id).lock_count == 0 {
            self.thread_mut(thread_id)
                .held_mutexes
                .retain(|&m| m != mutex_id);
            self.update_thread_priority(thread_id);
            self.mutex_mut(mutex_id).holding_thread = None;
            self.wake_up_all_waiters(mutex_id);
        }
        ResultCode::SUCCESS
    }

    /// Force-release every mutex a dying thread still holds.
    pub(crate) fn release_thread_mutexes(&mut self, thread_id: ObjectId) {
        let held = std::mem::take(&mut self.thread_mut(thread_id).held_mutexes);
        for mutex_id in held {
            {
                let mutex = self.mutex_mut(mutex_id);
                mutex.lock_count = 0;
                mutex.holding_thread = None;
            }
            self.wake_up_all_waiters(mutex_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::test_support::{block_on_any, boot, check_invariants, spawn_thread};
    use crate::thread::ThreadStatus;
    use rytra_common::error;

    #[test]
    fn test_reentrant_lock_and_release() {
        let (mut kernel, _cpu, _process, main) = boot();
        let mutex = kernel.create_mutex(true, "m".into());
        assert_eq!(kernel.mutex_ref(mutex).holding_thread, Some(main));
        assert_eq!(kernel.mutex_ref(mutex).lock_count, 1);

        // Re-acquiring from the holder just bumps the count.
        assert!(!kernel.should_wait(mutex, main));
        kernel.wait_object_acquire(mutex, main);
        assert_eq!(kernel.mutex_ref(mutex).lock_count, 2);

        assert!(kernel.mutex_release(mutex, main).is_success());
        assert_eq!(kernel.mutex_ref(mutex).holding_thread, Some(main));
        assert!(kernel.mutex_release(mutex, main).is_success());
        assert_eq!(kernel.mutex_ref(mutex).holding_thread, None);
        assert!(!kernel.should_wait(mutex, main));
    }

    #[test]
    fn test_release_by_non_holder_fails() {
        let (mut kernel, _cpu, process, main) = boot();
        let other = spawn_thread(&mut kernel, process, 50);
        let mutex = kernel.create_mutex(true, "m".into());
        assert_eq!(kernel.mutex_release(mutex, other), error::WRONG_LOCKING_THREAD);
        assert_eq!(kernel.mutex_ref(mutex).holding_thread, Some(main));
    }

    // Threads A(20), B(40), C(60); C holds the mutex and A blocks on it. C
    // runs at A's priority until it releases, then ownership moves to A and
    // C's priority is restored.
    #[test]
    fn test_priority_inheritance_chain() {
        let (mut kernel, _cpu, process, _main) = boot();
        let thread_a = spawn_thread(&mut kernel, process, 20);
        let _thread_b = spawn_thread(&mut kernel, process, 40);
        let thread_c = spawn_thread(&mut kernel, process, 60);

        let mutex = kernel.create_mutex(false, "m".into());
        kernel.wait_object_acquire(mutex, thread_c);
        assert_eq!(kernel.thread_ref(thread_c).current_priority, 60);

        block_on_any(&mut kernel, thread_a, &[mutex]);
        assert_eq!(kernel.thread_ref(thread_c).current_priority, 20);
        assert_eq!(kernel.mutex_ref(mutex).priority, 20);
        check_invariants(&kernel);

        assert!(kernel.mutex_release(mutex, thread_c).is_success());
        assert_eq!(kernel.mutex_ref(mutex).holding_thread, Some(thread_a));
        assert_eq!(kernel.thread_ref(thread_c).current_priority, 60);
        assert_eq!(kernel.thread_ref(thread_a).status, ThreadStatus::Ready);
        assert!(kernel.thread_ref(thread_a).held_mutexes.contains(&mutex));
        assert!(kernel.thread_ref(thread_a).pending_mutexes.is_empty());
        check_invariants(&kernel);
    }

    // Equal-priority waiters are served in arrival order.
    #[test]
    fn test_transfer_is_fifo_at_equal_priority() {
        let (mut kernel, _cpu, process, _main) = boot();
        let holder = spawn_thread(&mut kernel, process, 50);
        let waiter1 = spawn_thread(&mut kernel, process, 50);
        let waiter2 = spawn_thread(&mut kernel, process, 50);

        let mutex = kernel.create_mutex(false, "m".into());
        kernel.wait_object_acquire(mutex, holder);
        block_on_any(&mut kernel, waiter1, &[mutex]);
        block_on_any(&mut kernel, waiter2, &[mutex]);

        assert!(kernel.mutex_release(mutex, holder).is_success());
        assert_eq!(kernel.mutex_ref(mutex).holding_thread, Some(waiter1));
        assert_eq!(kernel.thread_ref(waiter2).status, ThreadStatus::WaitSynchAny);

        assert!(kernel.mutex_release(mutex, waiter1).is_success());
        assert_eq!(kernel.mutex_ref(mutex).holding_thread, Some(waiter2));
    }

    // A dying holder hands its mutexes over instead of leaking them.
    #[test]
    fn test_exit_releases_held_mutexes() {
        let (mut kernel, _cpu, process, _main) = boot();
        let holder = spawn_thread(&mut kernel, process, 50);
        let waiter = spawn_thread(&mut kernel, process, 50);

        let mutex = kernel.create_mutex(false, "m".into());
        kernel.wait_object_acquire(mutex, holder);
        block_on_any(&mut kernel, waiter, &[mutex]);

        kernel.stop_thread(holder);
        assert_eq!(kernel.mutex_ref(mutex).holding_thread, Some(waiter));
        assert_eq!(kernel.thread_ref(waiter).status, ThreadStatus::Ready);
        check_invariants(&kernel);
    }
}
