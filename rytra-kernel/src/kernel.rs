// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The kernel context.
//!
//! `KernelContext` owns the object arena, the scheduler state, the timing
//! wheel, the FCRAM backing and the named port registry. It is the explicit
//! form of the global HLE lock: the embedder wraps it in a mutex
//! ([`SharedKernel`]) and the SVC dispatcher borrows it mutably for the full
//! duration of a handler, as do timing-wheel deliveries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as HostMutex;

use rytra_common::{
    error, Handle, ObjectId, ProcessId, ResultCode, Settings, ThreadId, VAddr,
    CURRENT_PROCESS_HANDLE, CURRENT_THREAD_HANDLE, PAGE_SIZE, PAGE_SIZE_U32, TLS_AREA_VADDR,
    TLS_ENTRY_SIZE,
};
use rytra_cpu::state::{FPSCR_DEFAULT_NAN, FPSCR_FLUSH_TO_ZERO, FPSCR_IXC, FPSCR_ROUND_TOZERO};
use rytra_cpu::CpuState;

use crate::address_arbiter::AddressArbiter;
use crate::event::{Event, ResetType};
use crate::memory::{MemoryRegionName, MemoryResult, MemorySystem};
use crate::mutex::Mutex;
use crate::object::{KernelObject, ObjectArena};
use crate::process::Process;
use crate::ready_queue::ReadyQueue;
use crate::resource_limit::ResourceLimit;
use crate::semaphore::Semaphore;
use crate::thread::{
    Thread, ThreadStatus, WakeupCallback, WakeupReason, THREAD_PRIO_LOWEST,
    THREAD_PROCESSOR_ID_MAX,
};
use crate::timer::Timer;
use crate::timing::{CoreTiming, KernelEvent};
use crate::vm_manager::MemoryState;

/// The kernel behind the global HLE lock.
pub type SharedKernel = Arc<HostMutex<KernelContext>>;

pub struct KernelContext {
    pub settings: Settings,
    pub(crate) arena: ObjectArena,
    pub timing: CoreTiming,
    pub memory: MemorySystem,
    pub(crate) ready_queue: ReadyQueue,
    /// Every live thread, in creation order.
    pub(crate) thread_list: Vec<ObjectId>,
    /// Numeric thread id -> thread object, for timing-wheel deliveries.
    pub(crate) wakeup_callback_table: HashMap<ThreadId, ObjectId>,
    /// Timer callback id -> timer object.
    pub(crate) timer_callback_table: HashMap<u64, ObjectId>,
    /// Ports reachable by name through ConnectToPort.
    pub(crate) named_ports: HashMap<String, ObjectId>,
    pub(crate) process_list: Vec<ObjectId>,
    pub(crate) current_thread: Option<ObjectId>,
    pub(crate) current_process: Option<ObjectId>,
    next_thread_id: ThreadId,
    next_process_id: ProcessId,
    next_timer_callback_id: u64,
    pub(crate) reschedule_pending: bool,
}

impl KernelContext {
    pub fn new(settings: Settings) -> std::io::Result<Self> {
        Ok(Self {
            settings,
            arena: ObjectArena::new(),
            timing: CoreTiming::new(),
            memory: MemorySystem::new()?,
            ready_queue: ReadyQueue::new(),
            thread_list: Vec::new(),
            wakeup_callback_table: HashMap::new(),
            timer_callback_table: HashMap::new(),
            named_ports: HashMap::new(),
            process_list: Vec::new(),
            current_thread: None,
            current_process: None,
            next_thread_id: 1,
            next_process_id: 1,
            next_timer_callback_id: 1,
            reschedule_pending: false,
        })
    }

    // -- Current execution state --------------------------------------------

    pub fn current_thread(&self) -> Option<ObjectId> {
        self.current_thread
    }

    pub fn current_process(&self) -> Option<ObjectId> {
        self.current_process
    }

    /// Request a reschedule at the next dispatcher boundary.
    pub fn prepare_reschedule(&mut self) {
        self.reschedule_pending = true;
    }

    /// Advance guest time, delivering any timing events that became due, and
    /// reschedule if a delivery asked for it.
    pub fn advance_ticks(&mut self, cpu: &mut CpuState, cycles: u64) {
        for (event, cycles_late) in self.timing.advance(cycles) {
            match event {
                KernelEvent::ThreadWakeup { thread_id } => self.thread_wakeup_fired(thread_id),
                KernelEvent::TimerSignal { callback_id } => {
                    self.timer_signal_fired(callback_id, cycles_late)
                }
            }
        }
        if self.reschedule_pending {
            self.reschedule(cpu);
        }
    }

    // -- Object creation ----------------------------------------------------

    /// Create a process with a fresh application resource limit.
    pub fn create_process(&mut self, name: &str, region: MemoryRegionName) -> ObjectId {
        let limit_id = self
            .arena
            .insert(KernelObject::ResourceLimit(ResourceLimit::application()));
        let process_id_num = self.next_process_id;
        self.next_process_id += 1;

        let process = Process::new(process_id_num, name.to_string(), region, limit_id);
        let id = self.arena.insert(KernelObject::Process(process));
        self.process_list.push(id);
        if self.current_process.is_none() {
            self.current_process = Some(id);
        }
        log::info!("created process {process_id_num} ({name})");
        id
    }

    /// Create a thread inside `process_id` and queue it as Ready.
    pub fn create_thread(
        &mut self,
        process_id: ObjectId,
        name: String,
        entry_point: VAddr,
        priority: u32,
        arg: u32,
        processor_id: i32,
        stack_top: VAddr,
    ) -> Result<ObjectId, ResultCode> {
        if priority > THREAD_PRIO_LOWEST {
            log::error!("invalid thread priority {priority}");
            return Err(error::OUT_OF_RANGE);
        }
        if processor_id > THREAD_PROCESSOR_ID_MAX {
            log::error!("invalid processor id {processor_id}");
            return Err(error::OUT_OF_RANGE_KERNEL);
        }
        if self
            .process_ref(process_id)
            .vm_manager
            .backing_offset(entry_point)
            .is_none()
        {
            log::error!("({name}): invalid entry {entry_point:08x}");
            return Err(ResultCode::new(
                error::description::INVALID_ADDRESS,
                error::module::KERNEL,
                error::summary::INVALID_ARGUMENT,
                error::level::PERMANENT,
            ));
        }

        let tls_address = self.allocate_tls_slot(process_id)?;

        let numeric_id = self.next_thread_id;
        self.next_thread_id += 1;

        let mut thread = Thread::new(numeric_id, process_id, name);
        thread.entry_point = entry_point;
        thread.stack_top = stack_top;
        thread.nominal_priority = priority;
        thread.current_priority = priority;
        thread.last_running_ticks = self.timing.ticks();
        thread.processor_id = processor_id;
        thread.tls_address = tls_address;
        thread.context.reset_thread(stack_top, entry_point, arg);
        thread.context.fpscr = FPSCR_DEFAULT_NAN | FPSCR_FLUSH_TO_ZERO | FPSCR_ROUND_TOZERO;
        thread.context.cp15_thread_uro = tls_address;
        thread.status = ThreadStatus::Ready;

        let id = self.arena.insert(KernelObject::Thread(thread));
        self.thread_list.push(id);
        self.wakeup_callback_table.insert(numeric_id, id);
        self.ready_queue.prepare(priority);
        self.ready_queue.push_back(priority, id);
        Ok(id)
    }

    /// Find (or map) a TLS slot for a new thread, returning its address.
    fn allocate_tls_slot(&mut self, process_id: ObjectId) -> Result<VAddr, ResultCode> {
        let (mut page, mut slot, needs_allocation) =
            self.process_ref(process_id).find_free_tls_slot();

        if needs_allocation {
            // All pages are full; TLS pages come from the end of the Base
            // region.
            let offset = self
                .memory
                .region(MemoryRegionName::Base)
                .linear_allocate(PAGE_SIZE)
                .ok_or_else(|| {
                    log::error!("out of memory allocating a new TLS page");
                    error::OUT_OF_MEMORY
                })?;

            page = self.process_ref(process_id).tls_slots.len();
            slot = 0;
            let page_address = TLS_AREA_VADDR + (page * PAGE_SIZE) as u32;
            let process = self.arena.process_mut(process_id);
            process
                .vm_manager
                .map_backing_memory(page_address, offset, PAGE_SIZE_U32, MemoryState::Locked)
                .map_err(|e| {
                    log::error!("failed to map TLS page: {e}");
                    error::OUT_OF_MEMORY
                })?;
            process.tls_slots.push(0);
            process.memory_used += PAGE_SIZE_U32;
        }

        self.process_mut(process_id).set_tls_slot(page, slot);
        let tls_address = TLS_AREA_VADDR + (page * PAGE_SIZE + slot * TLS_ENTRY_SIZE) as u32;

        let Self { memory, arena, .. } = self;
        let _ = memory.zero_block(
            &arena.process_ref(process_id).vm_manager,
            tls_address,
            TLS_ENTRY_SIZE,
        );
        Ok(tls_address)
    }

    /// Create and start the main thread of a process. The stack grows down
    /// from the end of the heap region.
    pub fn setup_main_thread(
        &mut self,
        process_id: ObjectId,
        entry_point: VAddr,
        priority: u32,
    ) -> Result<ObjectId, ResultCode> {
        let ideal = self.process_ref(process_id).ideal_processor;
        let thread = self.create_thread(
            process_id,
            "main".to_string(),
            entry_point,
            priority,
            0,
            ideal,
            rytra_common::HEAP_VADDR_END,
        )?;
        self.thread_mut(thread).context.fpscr =
            FPSCR_DEFAULT_NAN | FPSCR_FLUSH_TO_ZERO | FPSCR_ROUND_TOZERO | FPSCR_IXC;
        Ok(thread)
    }

    /// Borrow a process together with its FCRAM region allocator.
    pub(crate) fn with_process_and_region<R>(
        &mut self,
        process_id: ObjectId,
        f: impl FnOnce(&mut Process, &mut crate::memory::MemoryRegionInfo) -> R,
    ) -> R {
        let region_name = self.arena.process_ref(process_id).memory_region;
        let Self { arena, memory, .. } = self;
        f(arena.process_mut(process_id), memory.region(region_name))
    }

    /// Mark the current process exited and stop all of its threads, the
    /// invoking thread last.
    pub fn exit_current_process(&mut self) {
        let Some(process_id) = self.current_process else {
            log::error!("ExitProcess with no current process");
            return;
        };
        log::info!(
            "process {} exiting",
            self.process_ref(process_id).process_id
        );
        if self.process_ref(process_id).status != crate::process::ProcessStatus::Running {
            log::error!("process has already exited");
            return;
        }
        self.process_mut(process_id).status = crate::process::ProcessStatus::Exited;

        let current = self.current_thread;
        let mut stopped = Vec::new();
        for thread_id in self.thread_list.clone() {
            if self.thread_ref(thread_id).owner_process != process_id {
                continue;
            }
            if Some(thread_id) == current {
                continue;
            }
            if !self.thread_ref(thread_id).status.is_waiting() {
                log::error!("stopping a non-waiting thread on process exit");
            }
            self.stop_thread(thread_id);
            stopped.push(thread_id);
        }
        if let Some(thread_id) = current {
            self.stop_thread(thread_id);
            stopped.push(thread_id);
        }
        for thread_id in stopped {
            self.thread_list.retain(|&t| t != thread_id);
            self.release_object(thread_id);
        }
        self.prepare_reschedule();
    }

    pub fn create_event(&mut self, reset_type: ResetType, name: String) -> ObjectId {
        self.arena
            .insert(KernelObject::Event(Event::new(reset_type, name)))
    }

    pub fn create_timer(&mut self, reset_type: ResetType, name: String) -> ObjectId {
        let callback_id = self.next_timer_callback_id;
        self.next_timer_callback_id += 1;
        let id = self
            .arena
            .insert(KernelObject::Timer(Timer::new(reset_type, callback_id, name)));
        self.timer_callback_table.insert(callback_id, id);
        id
    }

    pub fn create_mutex(&mut self, initial_locked: bool, name: String) -> ObjectId {
        let id = self.arena.insert(KernelObject::Mutex(Mutex::new(name)));
        if initial_locked {
            if let Some(thread) = self.current_thread {
                self.wait_object_acquire(id, thread);
            }
        }
        id
    }

    pub fn create_semaphore(
        &mut self,
        initial_count: i32,
        max_count: i32,
        name: String,
    ) -> Result<ObjectId, ResultCode> {
        if initial_count > max_count {
            return Err(error::INVALID_COMBINATION_KERNEL);
        }
        Ok(self.arena.insert(KernelObject::Semaphore(Semaphore::new(
            initial_count,
            max_count,
            name,
        ))))
    }

    pub fn create_address_arbiter(&mut self, name: String) -> ObjectId {
        self.arena
            .insert(KernelObject::AddressArbiter(AddressArbiter::new(name)))
    }

    /// Register a client port under a name so guests can ConnectToPort it.
    pub fn register_named_port(&mut self, name: &str, client_port: ObjectId) {
        self.arena.retain(client_port);
        if let Some(previous) = self.named_ports.insert(name.to_string(), client_port) {
            self.release_object(previous);
        }
    }

    pub fn named_port(&self, name: &str) -> Option<ObjectId> {
        self.named_ports.get(name).copied()
    }

    // -- Handle plumbing ----------------------------------------------------

    /// Install a new handle for an already-referenced object.
    pub fn create_handle(
        &mut self,
        process_id: ObjectId,
        object: ObjectId,
    ) -> Result<Handle, ResultCode> {
        let handle = self.process_mut(process_id).handle_table.create(object)?;
        self.arena.retain(object);
        Ok(handle)
    }

    /// Install a handle for a freshly created object, transferring the
    /// creation reference to the table. On failure the object is released.
    pub fn create_handle_consuming(
        &mut self,
        process_id: ObjectId,
        object: ObjectId,
    ) -> Result<Handle, ResultCode> {
        match self.process_mut(process_id).handle_table.create(object) {
            Ok(handle) => Ok(handle),
            Err(rc) => {
                self.release_object(object);
                Err(rc)
            }
        }
    }

    pub fn close_handle(&mut self, process_id: ObjectId, handle: Handle) -> ResultCode {
        match self.process_mut(process_id).handle_table.close(handle) {
            Ok(object) => {
                self.release_object(object);
                ResultCode::SUCCESS
            }
            Err(rc) => rc,
        }
    }

    pub fn duplicate_handle(
        &mut self,
        process_id: ObjectId,
        handle: Handle,
    ) -> Result<Handle, ResultCode> {
        let object = self
            .object_for_handle(process_id, handle)
            .ok_or(error::INVALID_HANDLE)?;
        self.create_handle(process_id, object)
    }

    /// Resolve a handle, honouring the CurrentThread/CurrentProcess
    /// pseudo-handles.
    pub fn object_for_handle(&self, process_id: ObjectId, handle: Handle) -> Option<ObjectId> {
        match handle {
            CURRENT_THREAD_HANDLE => self.current_thread,
            CURRENT_PROCESS_HANDLE => self.current_process,
            _ => self.process_ref(process_id).handle_table.get(handle),
        }
    }

    /// Resolve a handle to a wait object id.
    pub fn wait_object_for_handle(
        &self,
        process_id: ObjectId,
        handle: Handle,
    ) -> Option<ObjectId> {
        let id = self.object_for_handle(process_id, handle)?;
        self.arena.get(id).filter(|o| o.is_wait_object())?;
        Some(id)
    }

    // -- Reference counting and finalization --------------------------------

    /// Drop one strong reference; runs the object's teardown when it was the
    /// last one.
    pub fn release_object(&mut self, id: ObjectId) {
        if self.arena.strong_count(id) == 1 {
            // Teardown that needs the object still reachable in the arena.
            self.pre_finalize(id);
        }
        if let Some(object) = self.arena.release(id) {
            self.post_finalize(id, object);
        }
    }

    fn pre_finalize(&mut self, id: ObjectId) {
        // Detach the dying object from any thread still waiting on it.
        let waiters = self
            .arena
            .get(id)
            .and_then(|o| o.waiters())
            .cloned()
            .unwrap_or_default();
        for waiter in waiters {
            if let Some(KernelObject::Thread(thread)) = self.arena.get_mut(waiter) {
                thread.wait_objects.retain(|&o| o != id);
            }
        }

        enum Teardown {
            None,
            StopThread,
            ClientSession,
            ServerSession,
            Timer(u64),
        }
        let teardown = match self.arena.get(id) {
            Some(KernelObject::Thread(thread)) if thread.status != ThreadStatus::Dead => {
                Teardown::StopThread
            }
            Some(KernelObject::ClientSession(_)) => Teardown::ClientSession,
            Some(KernelObject::ServerSession(_)) => Teardown::ServerSession,
            Some(KernelObject::Timer(timer)) => Teardown::Timer(timer.callback_id),
            _ => Teardown::None,
        };
        match teardown {
            Teardown::None => {}
            Teardown::StopThread => self.stop_thread(id),
            Teardown::ClientSession => self.client_session_closed(id),
            Teardown::ServerSession => self.server_session_closed(id),
            Teardown::Timer(callback_id) => {
                self.timing.unschedule_timer(callback_id);
                self.timer_callback_table.remove(&callback_id);
            }
        }
    }

    fn post_finalize(&mut self, _id: ObjectId, object: KernelObject) {
        match object {
            KernelObject::ClientSession(session) => self.release_object(session.session),
            KernelObject::ServerSession(session) => {
                for context in &session.mapped_buffer_context {
                    self.memory
                        .region(MemoryRegionName::Base)
                        .free(context.backing_offset, context.num_pages * PAGE_SIZE);
                }
                self.release_object(session.session);
            }
            KernelObject::Session(session) => {
                if let Some(port) = session.port {
                    self.release_object(port);
                }
            }
            KernelObject::ClientPort(port) => self.release_object(port.server_port),
            KernelObject::ServerPort(port) => {
                for pending in port.pending_sessions {
                    self.release_object(pending);
                }
            }
            KernelObject::SharedMemory(block) => {
                if block.owns_backing {
                    self.memory
                        .region(block.backing_region)
                        .free(block.backing_offset, block.size as usize);
                }
            }
            KernelObject::Process(process) => {
                self.release_object(process.resource_limit);
                for (_, object) in process.handle_table.iter() {
                    self.release_object(object);
                }
            }
            _ => {}
        }
    }

    /// Client endpoint of a session is going away.
    fn client_session_closed(&mut self, client_session: ObjectId) {
        let session_id = self.client_session_ref(client_session).session;
        let server = self.session_ref(session_id).server;
        let port = self.session_ref(session_id).port;

        self.session_mut(session_id).client = None;
        if let Some(server_id) = server {
            // Fail the requests that will never be answered, then let any
            // server thread blocked on the session observe the closure.
            self.session_abort_pending_requests(server_id);
            self.wake_up_all_waiters(server_id);
        }
        if let Some(port_id) = port {
            self.client_port_connection_closed(port_id);
        }
    }

    /// Server endpoint of a session is going away.
    fn server_session_closed(&mut self, server_session: ObjectId) {
        let session_id = self.server_session_ref(server_session).session;
        self.session_mut(session_id).server = None;
        self.session_abort_pending_requests(server_session);
    }

    // -- Thread lifecycle ---------------------------------------------------

    /// Tear a thread down: cancel wakeups, leave every queue, hand held
    /// mutexes over and free the TLS slot.
    pub fn stop_thread(&mut self, thread_id: ObjectId) {
        let (numeric_id, status, priority, tls_address, owner) = {
            let thread = self.thread_ref(thread_id);
            (
                thread.thread_id,
                thread.status,
                thread.current_priority,
                thread.tls_address,
                thread.owner_process,
            )
        };

        self.timing.unschedule_thread_wakeup(numeric_id);
        self.wakeup_callback_table.remove(&numeric_id);
        if status == ThreadStatus::Ready {
            self.ready_queue.remove(priority, thread_id);
        }
        self.thread_mut(thread_id).status = ThreadStatus::Dead;
        self.wake_up_all_waiters(thread_id);

        let wait_objects = std::mem::take(&mut self.thread_mut(thread_id).wait_objects);
        for object in wait_objects {
            self.wait_object_remove_waiter(object, thread_id);
        }
        self.release_thread_mutexes(thread_id);

        // Give the TLS slot back to the owning process.
        if tls_address != 0 {
            let offset = (tls_address - TLS_AREA_VADDR) as usize;
            let page = offset / PAGE_SIZE;
            let slot = (offset % PAGE_SIZE) / TLS_ENTRY_SIZE;
            self.process_mut(owner).clear_tls_slot(page, slot);
        }
    }

    /// Stop the running thread and drop it from the thread list.
    pub fn exit_current_thread(&mut self) {
        let Some(thread_id) = self.current_thread else {
            log::error!("ExitThread with no current thread");
            return;
        };
        self.stop_thread(thread_id);
        self.thread_list.retain(|&t| t != thread_id);
        self.release_object(thread_id);
    }

    /// Timing-wheel delivery of a thread's scheduled wakeup.
    pub(crate) fn thread_wakeup_fired(&mut self, numeric_thread_id: ThreadId) {
        let Some(&thread_id) = self.wakeup_callback_table.get(&numeric_thread_id) else {
            log::error!("wakeup fired for unknown thread {numeric_thread_id:08X}");
            return;
        };
        let status = self.thread_ref(thread_id).status;
        if matches!(
            status,
            ThreadStatus::WaitSynchAny
                | ThreadStatus::WaitSynchAll
                | ThreadStatus::WaitArb
                | ThreadStatus::WaitHleEvent
        ) {
            // Deliver the timeout before detaching from the wait objects so
            // the callback can still inspect them.
            self.invoke_wakeup_callback(thread_id, WakeupReason::Timeout, None);
            let wait_objects = std::mem::take(&mut self.thread_mut(thread_id).wait_objects);
            for object in wait_objects {
                self.wait_object_remove_waiter(object, thread_id);
            }
        }
        self.resume_thread_from_wait(thread_id);
    }

    /// Move a suspended thread back to Ready. Spurious resumes (the thread
    /// already woke up for another reason) are ignored.
    pub(crate) fn resume_thread_from_wait(&mut self, thread_id: ObjectId) {
        debug_assert!(
            self.thread_ref(thread_id).wait_objects.is_empty(),
            "thread is waking up while still waiting for objects"
        );
        match self.thread_ref(thread_id).status {
            ThreadStatus::WaitSynchAll
            | ThreadStatus::WaitSynchAny
            | ThreadStatus::WaitHleEvent
            | ThreadStatus::WaitArb
            | ThreadStatus::WaitSleep
            | ThreadStatus::WaitIpc
            | ThreadStatus::Dormant => {}
            ThreadStatus::Ready => {
                // A thread waiting on several objects can be woken more than
                // once before it actually runs; later wakeups are no-ops.
                return;
            }
            ThreadStatus::Running => {
                log::debug!("thread {thread_id} has already resumed");
                return;
            }
            ThreadStatus::Dead => {
                log::error!("thread {thread_id} can't be resumed: it is dead");
                return;
            }
        }

        let priority = {
            let thread = self.thread_mut(thread_id);
            thread.wakeup_callback = None;
            thread.status = ThreadStatus::Ready;
            thread.current_priority
        };
        self.ready_queue.push_back(priority, thread_id);
        self.prepare_reschedule();
    }

    /// Run a thread's pending wakeup action.
    pub(crate) fn invoke_wakeup_callback(
        &mut self,
        thread_id: ObjectId,
        reason: WakeupReason,
        object: Option<ObjectId>,
    ) {
        let Some(callback) = self.thread_ref(thread_id).wakeup_callback else {
            return;
        };
        match callback {
            WakeupCallback::WaitSynchAny { with_index } => match reason {
                WakeupReason::Timeout => {
                    self.set_wait_synchronization_result(thread_id, error::TIMEOUT);
                }
                WakeupReason::Signal => {
                    self.set_wait_synchronization_result(thread_id, ResultCode::SUCCESS);
                    if with_index {
                        if let Some(object) = object {
                            let index = self.thread_ref(thread_id).wait_object_index(object);
                            self.set_wait_synchronization_output(thread_id, index);
                        }
                    }
                }
            },
            WakeupCallback::WaitSynchAll => {
                let result = match reason {
                    WakeupReason::Timeout => error::TIMEOUT,
                    WakeupReason::Signal => ResultCode::SUCCESS,
                };
                self.set_wait_synchronization_result(thread_id, result);
            }
            WakeupCallback::IpcReceive => {
                let Some(object) = object else {
                    log::error!("IPC receive wakeup without a signalling object");
                    return;
                };
                debug_assert!(reason == WakeupReason::Signal);
                let result = if self.arena.try_server_session_ref(object).is_some() {
                    self.receive_ipc_request(object, thread_id)
                } else {
                    ResultCode::SUCCESS
                };
                let index = self.thread_ref(thread_id).wait_object_index(object);
                self.set_wait_synchronization_result(thread_id, result);
                self.set_wait_synchronization_output(thread_id, index);
            }
        }
    }

    /// Write the result a suspended thread will see in r0 when it resumes.
    pub(crate) fn set_wait_synchronization_result(
        &mut self,
        thread_id: ObjectId,
        result: ResultCode,
    ) {
        self.thread_mut(thread_id).context.regs[0] = result.raw();
    }

    /// Write the output index a suspended thread will see in r1.
    pub(crate) fn set_wait_synchronization_output(&mut self, thread_id: ObjectId, output: i32) {
        self.thread_mut(thread_id).context.regs[1] = output as u32;
    }

    // -- Guest memory -------------------------------------------------------

    pub fn guest_read_u8(&self, process_id: ObjectId, addr: VAddr) -> MemoryResult<u8> {
        self.memory
            .read_u8(&self.process_ref(process_id).vm_manager, addr)
    }

    pub fn guest_read_u32(&self, process_id: ObjectId, addr: VAddr) -> MemoryResult<u32> {
        self.memory
            .read_u32(&self.process_ref(process_id).vm_manager, addr)
    }

    pub fn guest_write_u8(
        &mut self,
        process_id: ObjectId,
        addr: VAddr,
        value: u8,
    ) -> MemoryResult<()> {
        let Self { memory, arena, .. } = self;
        memory.write_u8(&arena.process_ref(process_id).vm_manager, addr, value)
    }

    pub fn guest_write_u32(
        &mut self,
        process_id: ObjectId,
        addr: VAddr,
        value: u32,
    ) -> MemoryResult<()> {
        let Self { memory, arena, .. } = self;
        memory.write_u32(&arena.process_ref(process_id).vm_manager, addr, value)
    }

    pub fn guest_read_block(
        &self,
        process_id: ObjectId,
        addr: VAddr,
        out: &mut [u8],
    ) -> MemoryResult<()> {
        self.memory
            .read_block(&self.process_ref(process_id).vm_manager, addr, out)
    }

    pub fn guest_write_block(
        &mut self,
        process_id: ObjectId,
        addr: VAddr,
        data: &[u8],
    ) -> MemoryResult<()> {
        let Self { memory, arena, .. } = self;
        memory.write_block(&arena.process_ref(process_id).vm_manager, addr, data)
    }

    pub fn guest_write_u64(
        &mut self,
        process_id: ObjectId,
        addr: VAddr,
        value: u64,
    ) -> MemoryResult<()> {
        let Self { memory, arena, .. } = self;
        memory.write_block(
            &arena.process_ref(process_id).vm_manager,
            addr,
            &value.to_le_bytes(),
        )
    }

    pub fn guest_read_cstring(
        &self,
        process_id: ObjectId,
        addr: VAddr,
        max_len: usize,
    ) -> MemoryResult<String> {
        self.memory
            .read_cstring(&self.process_ref(process_id).vm_manager, addr, max_len)
    }
}

/// Typed accessor delegates into the arena.
macro_rules! context_accessors {
    ($($ref_name:ident, $mut_name:ident, $try_ref_name:ident, $ty:ty;)*) => {
        impl KernelContext {
            $(
                pub fn $ref_name(&self, id: ObjectId) -> &$ty {
                    self.arena.$ref_name(id)
                }

                pub fn $mut_name(&mut self, id: ObjectId) -> &mut $ty {
                    self.arena.$mut_name(id)
                }

                pub fn $try_ref_name(&self, id: ObjectId) -> Option<&$ty> {
                    self.arena.$try_ref_name(id)
                }
            )*
        }
    };
}


context_accessors! {
    thread_ref, thread_mut, try_thread_ref, Thread;
    mutex_ref, mutex_mut, try_mutex_ref, Mutex;
    semaphore_ref, semaphore_mut, try_semaphore_ref, Semaphore;
    event_ref, event_mut, try_event_ref, Event;
    timer_ref, timer_mut, try_timer_ref, Timer;
    shared_memory_ref, shared_memory_mut, try_shared_memory_ref, crate::shared_memory::SharedMemory;
    arbiter_ref, arbiter_mut, try_arbiter_ref, AddressArbiter;
    client_port_ref, client_port_mut, try_client_port_ref, crate::session::ClientPort;
    server_port_ref, server_port_mut, try_server_port_ref, crate::session::ServerPort;
    client_session_ref, client_session_mut, try_client_session_ref, crate::session::ClientSession;
    server_session_ref, server_session_mut, try_server_session_ref, crate::session::ServerSession;
    session_ref, session_mut, try_session_ref, crate::session::Session;
    process_ref, process_mut, try_process_ref, Process;
    resource_limit_ref, resource_limit_mut, try_resource_limit_ref, ResourceLimit;
}

#[cfg(test)]
mod tests {
    use super::test_support::{boot, check_invariants, spawn_thread};
    use super::*;
    use crate::event::ResetType;

    #[test]
    fn test_handle_keeps_object_alive() {
        let (mut kernel, _cpu, process, _main) = boot();
        let event = kernel.create_event(ResetType::OneShot, "ev".into());
        let handle = kernel.create_handle_consuming(process, event).unwrap();

        assert_eq!(kernel.object_for_handle(process, handle), Some(event));
        assert!(kernel.close_handle(process, handle).is_success());
        // Last handle gone: the object finalized.
        assert!(!kernel.arena.contains(event));
        assert_eq!(kernel.close_handle(process, handle), error::INVALID_HANDLE);
    }

    #[test]
    fn test_duplicate_outlives_original() {
        let (mut kernel, _cpu, process, _main) = boot();
        let event = kernel.create_event(ResetType::OneShot, "ev".into());
        let handle = kernel.create_handle_consuming(process, event).unwrap();
        let duplicate = kernel.duplicate_handle(process, handle).unwrap();
        assert_ne!(handle, duplicate);

        assert!(kernel.close_handle(process, handle).is_success());
        // The duplicate still refers to the live object.
        assert_eq!(kernel.object_for_handle(process, duplicate), Some(event));
        assert!(kernel.arena.contains(event));
    }

    #[test]
    fn test_pseudo_handles_resolve() {
        let (kernel, _cpu, process, main) = boot();
        assert_eq!(
            kernel.object_for_handle(process, CURRENT_PROCESS_HANDLE),
            Some(process)
        );
        assert_eq!(
            kernel.object_for_handle(process, CURRENT_THREAD_HANDLE),
            Some(main)
        );
    }

    #[test]
    fn test_tls_slot_reused_after_thread_exit() {
        let (mut kernel, _cpu, process, _main) = boot();
        let worker = spawn_thread(&mut kernel, process, 50);
        let tls = kernel.thread_ref(worker).tls_address;

        kernel.stop_thread(worker);
        let replacement = spawn_thread(&mut kernel, process, 50);
        assert_eq!(kernel.thread_ref(replacement).tls_address, tls);
    }

    #[test]
    fn test_exit_current_thread_schedules_next() {
        let (mut kernel, mut cpu, process, main) = boot();
        let worker = spawn_thread(&mut kernel, process, 50);

        assert_eq!(kernel.current_thread(), Some(main));
        kernel.exit_current_thread();
        kernel.prepare_reschedule();
        kernel.reschedule(&mut cpu);
        assert_eq!(kernel.current_thread(), Some(worker));
        check_invariants(&kernel);
    }

    #[test]
    fn test_exit_current_process_stops_all_threads() {
        let (mut kernel, mut cpu, process, _main) = boot();
        let worker = spawn_thread(&mut kernel, process, 50);
        let event = kernel.create_event(ResetType::OneShot, "ev".into());
        crate::kernel::test_support::block_on_any(&mut kernel, worker, &[event]);

        kernel.exit_current_process();
        kernel.reschedule(&mut cpu);
        assert_eq!(kernel.current_thread(), None);
        assert_eq!(
            kernel.process_ref(process).status,
            crate::process::ProcessStatus::Exited
        );
        assert!(kernel.thread_list.is_empty());
    }

    #[test]
    fn test_named_port_registry() {
        let (mut kernel, _cpu, _process, _main) = boot();
        let (_server_port, client_port) = kernel.create_port_pair(8, "srv:".into());
        kernel.register_named_port("srv:", client_port);
        assert_eq!(kernel.named_port("srv:"), Some(client_port));
        assert_eq!(kernel.named_port("other:"), None);
    }

    #[test]
    fn test_starved_threads_get_boosted() {
        let (mut kernel, mut cpu, process, main) = boot();
        kernel.settings.priority_boost = true;
        let worker = spawn_thread(&mut kernel, process, 44);
        let starved = spawn_thread(&mut kernel, process, 60);

        // Let a lot of guest time pass while the main thread hogs the core.
        kernel.timing.add_ticks(2_000_001);
        kernel.prepare_reschedule();
        kernel.reschedule(&mut cpu);

        // Both Ready threads were pulled up to just above the queue head;
        // the worker preempted main.
        assert_eq!(kernel.current_thread(), Some(worker));
        assert_eq!(kernel.thread_ref(starved).current_priority, 43);
        assert_eq!(kernel.thread_ref(main).status, ThreadStatus::Ready);
    }
}
