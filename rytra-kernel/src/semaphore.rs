// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use rytra_common::{error, ObjectId, ResultCode};

use crate::kernel::KernelContext;

pub struct Semaphore {
    pub max_count: i32,
    pub available_count: i32,
    pub waiters: Vec<ObjectId>,
    pub name: String,
}

impl Semaphore {
    pub fn new(initial_count: i32, max_count: i32, name: String) -> Self {
        Self {
            max_count,
            available_count: initial_count,
            waiters: Vec::new(),
            name,
        }
    }
}

impl KernelContext {
    /// Add `release_count` slots, waking as many waiters as the new count
    /// allows. Returns the count before the release.
    pub(crate) fn semaphore_release(
        &mut self,
        semaphore_id: ObjectId,
        release_count: i32,
    ) -> Result<i32, ResultCode> {
        let semaphore = self.semaphore_ref(semaphore_id);
        if semaphore.max_count < semaphore.available_count + release_count {
            return Err(error::OUT_OF_RANGE_KERNEL);
        }
        let previous = semaphore.available_count;
        self.semaphore_mut(semaphore_id).available_count += release_count;
        self.wake_up_all_waiters(semaphore_id);
        Ok(previous)
    }
}
