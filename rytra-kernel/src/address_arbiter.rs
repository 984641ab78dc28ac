// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Address arbiters: address-keyed thread parking.
//!
//! Threads park on a (arbiter, address) pair and are released either by an
//! explicit Signal on that address (arrival order) or by their timeout.

use rytra_common::{error, ns_to_cycles, ObjectId, ResultCode, VAddr};

use crate::kernel::KernelContext;
use crate::thread::ThreadStatus;
use crate::timing::KernelEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ArbitrationType {
    Signal = 0,
    WaitIfLessThan = 1,
    DecrementAndWaitIfLessThan = 2,
    WaitIfLessThanWithTimeout = 3,
    DecrementAndWaitIfLessThanWithTimeout = 4,
}

impl ArbitrationType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Signal),
            1 => Some(Self::WaitIfLessThan),
            2 => Some(Self::DecrementAndWaitIfLessThan),
            3 => Some(Self::WaitIfLessThanWithTimeout),
            4 => Some(Self::DecrementAndWaitIfLessThanWithTimeout),
            _ => None,
        }
    }
}

pub struct AddressArbiter {
    /// Parked threads in arrival order. Entries whose thread has left
    /// WaitArb by other means (timeout, exit) are pruned lazily.
    pub waiting_threads: Vec<ObjectId>,
    pub name: String,
}

impl AddressArbiter {
    pub fn new(name: String) -> Self {
        Self {
            waiting_threads: Vec::new(),
            name,
        }
    }
}

impl KernelContext {
    pub(crate) fn arbitrate_address(
        &mut self,
        arbiter_id: ObjectId,
        thread_id: ObjectId,
        arbitration_type: ArbitrationType,
        address: VAddr,
        value: i32,
        nanoseconds: i64,
    ) -> ResultCode {
        let process_id = self.thread_ref(thread_id).owner_process;
        match arbitration_type {
            ArbitrationType::Signal => {
                self.arbiter_signal(arbiter_id, address, value);
            }
            ArbitrationType::WaitIfLessThan | ArbitrationType::WaitIfLessThanWithTimeout => {
                let memory_value = match self.guest_read_u32(process_id, address) {
                    Ok(v) => v as i32,
                    Err(_) => return error::INVALID_ADDRESS,
                };
                if memory_value < value {
                    self.arbiter_park(arbiter_id, thread_id, address);
                    if arbitration_type == ArbitrationType::WaitIfLessThanWithTimeout {
                        self.wake_thread_after_delay(thread_id, nanoseconds);
                    }
                }
            }
            ArbitrationType::DecrementAndWaitIfLessThan
            | ArbitrationType::DecrementAndWaitIfLessThanWithTimeout => {
                let memory_value = match self.guest_read_u32(process_id, address) {
                    Ok(v) => v as i32,
                    Err(_) => return error::INVALID_ADDRESS,
                };
                if memory_value < value {
                    // The memory value is only mutated when the thread parks.
                    if self
                        .guest_write_u32(process_id, address, (memory_value - 1) as u32)
                        .is_err()
                    {
                        return error::INVALID_ADDRESS;
                    }
                    self.arbiter_park(arbiter_id, thread_id, address);
                    if arbitration_type
                        == ArbitrationType::DecrementAndWaitIfLessThanWithTimeout
                    {
                        self.wake_thread_after_delay(thread_id, nanoseconds);
                    }
                }
            }
        }
        // The timeout variants report a timeout even when the thread never
        // went to sleep.
        if matches!(
            arbitration_type,
            ArbitrationType::WaitIfLessThanWithTimeout
                | ArbitrationType::DecrementAndWaitIfLessThanWithTimeout
        ) {
            return error::TIMEOUT;
        }
        ResultCode::SUCCESS
    }

    fn arbiter_park(&mut self, arbiter_id: ObjectId, thread_id: ObjectId, address: VAddr) {
        {
            let thread = self.thread_mut(thread_id);
            thread.wait_address = address;
            thread.status = ThreadStatus::WaitArb;
        }
        self.arbiter_mut(arbiter_id).waiting_threads.push(thread_id);
    }

    /// Wake up to `value` threads parked on `address`; a negative value
    /// releases them all.
    fn arbiter_signal(&mut self, arbiter_id: ObjectId, address: VAddr, value: i32) {
        let parked = std::mem::take(&mut self.arbiter_mut(arbiter_id).waiting_threads);
        let mut kept = Vec::new();
        let mut woken = 0i32;

        for thread_id in parked {
            // Prune entries that already left WaitArb (timed out or died).
            let Some(thread) = self.try_thread_ref(thread_id) else {
                continue;
            };
            if thread.status != ThreadStatus::WaitArb {
                continue;
            }
            if thread.wait_address != address || (value >= 0 && woken >= value) {
                kept.push(thread_id);
                continue;
            }
            woken += 1;
            self.thread_mut(thread_id).wait_address = 0;
            self.resume_thread_from_wait(thread_id);
        }
        self.arbiter_mut(arbiter_id).waiting_threads = kept;
    }

    /// Schedule a timed wakeup for a parked thread. A timeout of -1 never
    /// fires.
    pub(crate) fn wake_thread_after_delay(&mut self, thread_id: ObjectId, nanoseconds: i64) {
        if nanoseconds == -1 {
            return;
        }
        let numeric_id = self.thread_ref(thread_id).thread_id;
        self.timing.schedule_event(
            ns_to_cycles(nanoseconds as u64),
            KernelEvent::ThreadWakeup {
                thread_id: numeric_id,
            },
        );
    }
}
