// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use rytra_common::{ObjectId, ThreadId, VAddr};
use rytra_cpu::CpuState;

/// Highest thread priority (numerically lowest).
pub const THREAD_PRIO_HIGHEST: u32 = 0;

/// Lowest thread priority.
pub const THREAD_PRIO_LOWEST: u32 = 63;

/// Default priority for application main threads.
pub const THREAD_PRIO_DEFAULT: u32 = 48;

/// Processor the thread is created on.
pub const THREAD_PROCESSOR_ID_DEFAULT: i32 = -2;
pub const THREAD_PROCESSOR_ID_ALL: i32 = -1;
pub const THREAD_PROCESSOR_ID0: i32 = 0;
pub const THREAD_PROCESSOR_ID1: i32 = 1;
pub const THREAD_PROCESSOR_ID_MAX: i32 = 3;

/// Thread states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created but not yet scheduled.
    Dormant,
    /// In the ready queue, waiting for a slice.
    Ready,
    /// Currently executing on the (single) emulated core.
    Running,
    /// Sleeping via SleepThread.
    WaitSleep,
    /// Blocked until any of its wait objects signals.
    WaitSynchAny,
    /// Blocked until all of its wait objects signal at once.
    WaitSynchAll,
    /// Parked on an address arbiter.
    WaitArb,
    /// Blocked on an HLE service event.
    WaitHleEvent,
    /// Client side of a synchronous IPC request in flight.
    WaitIpc,
    /// Terminated.
    Dead,
}

impl ThreadStatus {
    /// Whether the thread is in any waiting state.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Self::WaitSleep
                | Self::WaitSynchAny
                | Self::WaitSynchAll
                | Self::WaitArb
                | Self::WaitHleEvent
                | Self::WaitIpc
        )
    }
}

/// Why a suspended thread was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupReason {
    /// A wait object the thread was waiting on signalled.
    Signal,
    /// The scheduled timeout elapsed first.
    Timeout,
}

/// What to do when a suspended thread resumes. Carried on the thread record
/// instead of a closure so resumption state stays inspectable and copyable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupCallback {
    /// WaitSynchronization1/N in wait-any mode: write the result, and on
    /// signal optionally the index of the waking object.
    WaitSynchAny { with_index: bool },
    /// WaitSynchronizationN in wait-all mode: write the result only.
    WaitSynchAll,
    /// ReplyAndReceive: run the receive-side command translation, then write
    /// result and index.
    IpcReceive,
}

/// HLE kernel thread.
pub struct Thread {
    pub thread_id: ThreadId,
    /// Owning process (non-owning arena id; the process list keeps it alive).
    pub owner_process: ObjectId,
    /// Saved register file, live only while the thread is not Running.
    pub context: CpuState,
    pub entry_point: VAddr,
    pub stack_top: VAddr,
    pub tls_address: VAddr,
    /// Priority requested by the guest.
    pub nominal_priority: u32,
    /// Effective priority after inheritance/starvation boosts. Never
    /// numerically above `nominal_priority`.
    pub current_priority: u32,
    pub status: ThreadStatus,
    /// Wait objects this thread currently observes (WaitSynchAny/All).
    pub wait_objects: Vec<ObjectId>,
    /// Mutexes this thread holds.
    pub held_mutexes: Vec<ObjectId>,
    /// Mutexes this thread is queued on.
    pub pending_mutexes: Vec<ObjectId>,
    /// Pending resumption action, cleared on resume.
    pub wakeup_callback: Option<WakeupCallback>,
    /// Tick the thread last left the core; input to starvation boosting.
    pub last_running_ticks: u64,
    /// Address the thread is parked on while in WaitArb.
    pub wait_address: VAddr,
    pub processor_id: i32,
    /// Threads waiting for this thread to die.
    pub waiters: Vec<ObjectId>,
    pub name: String,
}

impl Thread {
    pub fn new(thread_id: ThreadId, owner_process: ObjectId, name: String) -> Self {
        Self {
            thread_id,
            owner_process,
            context: CpuState::new(),
            entry_point: 0,
            stack_top: 0,
            tls_address: 0,
            nominal_priority: THREAD_PRIO_DEFAULT,
            current_priority: THREAD_PRIO_DEFAULT,
            status: ThreadStatus::Dormant,
            wait_objects: Vec::new(),
            held_mutexes: Vec::new(),
            pending_mutexes: Vec::new(),
            wakeup_callback: None,
            last_running_ticks: 0,
            wait_address: 0,
            processor_id: THREAD_PROCESSOR_ID0,
            waiters: Vec::new(),
            name,
        }
    }

    /// Index of `object` in the wait list, as reported to the guest by the
    /// wait-any SVCs. Matches the original lookup: last occurrence wins.
    pub fn wait_object_index(&self, object: ObjectId) -> i32 {
        debug_assert!(!self.wait_objects.is_empty(), "thread isn't waiting for anything");
        self.wait_objects
            .iter()
            .rposition(|&o| o == object)
            .map(|i| i as i32)
            .unwrap_or(-1)
    }

    /// Guest address of this thread's IPC command buffer.
    pub fn command_buffer_address(&self) -> VAddr {
        self.tls_address + rytra_common::COMMAND_BUFFER_OFFSET
    }
}
