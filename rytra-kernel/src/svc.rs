// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! SVC dispatch.
//!
//! A 126-entry table keyed by the SVC immediate. Each wrapper marshals
//! arguments out of the guest register file (r0-r3, with r4/r5 carrying
//! 64-bit halves and overflow arguments), calls the handler and writes the
//! results back: r0 is the result code, r1+ the secondary outputs. The whole
//! dispatch runs under the HLE lock; a handler that suspended the current
//! thread gets its reschedule at the end of the call.

use log::{debug, warn};

use rytra_common::{
    error, Handle, ObjectId, ResultCode, VAddr, CURRENT_PROCESS_HANDLE, HEAP_VADDR,
    HEAP_VADDR_END, LINEAR_HEAP_VADDR, PAGE_MASK, PROCESS_IMAGE_VADDR, SHARED_MEMORY_VADDR_END,
};
use rytra_cpu::CpuState;

use crate::address_arbiter::ArbitrationType;
use crate::event::ResetType;
use crate::ipc::Header;
use crate::kernel::KernelContext;
use crate::memory::MemoryRegionName;
use crate::resource_limit::ResourceType;
use crate::thread::{
    ThreadStatus, WakeupCallback, THREAD_PRIO_LOWEST, THREAD_PROCESSOR_ID_ALL,
    THREAD_PROCESSOR_ID_DEFAULT, THREAD_PROCESSOR_ID0, THREAD_PROCESSOR_ID1,
};
use crate::vm_manager::VMAPermission;

// ControlMemory operation encoding.
const MEMOP_FREE: u32 = 1;
const MEMOP_COMMIT: u32 = 3;
const MEMOP_MAP: u32 = 4;
const MEMOP_UNMAP: u32 = 5;
const MEMOP_PROTECT: u32 = 6;
const MEMOP_OPERATION_MASK: u32 = 0xFF;
const MEMOP_REGION_MASK: u32 = 0xF00;
const MEMOP_LINEAR: u32 = 0x10000;

/// Longest allowed port name, excluding the terminator.
const PORT_NAME_MAX_LENGTH: usize = 11;

/// Dispatch context borrowed for the duration of one SVC.
pub struct Svc<'a> {
    pub kernel: &'a mut KernelContext,
    pub cpu: &'a mut CpuState,
}

struct SvcDef {
    name: &'static str,
    handler: Option<fn(&mut Svc<'_>)>,
}

/// Entry point from the CPU: dispatch the SVC with the given immediate.
/// The caller holds the HLE lock around this.
pub fn call_svc(kernel: &mut KernelContext, cpu: &mut CpuState, immediate: u32) {
    match SVC_TABLE.get(immediate as usize) {
        Some(def) => match def.handler {
            Some(handler) => {
                debug!("SVC 0x{immediate:02X} {} (pc={:#010X})", def.name, cpu.pc());
                handler(&mut Svc { kernel, cpu });
            }
            None => {
                warn!("unimplemented SVC function {}", def.name);
                cpu.regs[0] = ResultCode::SUCCESS.raw();
                cpu.regs[1] = 0;
                cpu.regs[2] = 0;
                cpu.regs[3] = 0;
            }
        },
        None => {
            log::error!("unknown svc 0x{immediate:02X}");
            cpu.regs[0] = ResultCode::SUCCESS.raw();
            cpu.regs[1] = 0;
            cpu.regs[2] = 0;
            cpu.regs[3] = 0;
        }
    }
    if kernel.reschedule_pending {
        kernel.reschedule(cpu);
    }
}

impl Svc<'_> {
    #[inline]
    fn reg(&self, index: usize) -> u32 {
        self.cpu.regs[index]
    }

    #[inline]
    fn set_reg(&mut self, index: usize, value: u32) {
        self.cpu.regs[index] = value;
    }

    #[inline]
    fn ns_from(&self, low: usize, high: usize) -> i64 {
        (((self.reg(high) as u64) << 32) | self.reg(low) as u64) as i64
    }

    fn current_process(&self) -> ObjectId {
        self.kernel
            .current_process()
            .expect("SVC dispatched without a current process")
    }

    fn current_thread(&self) -> ObjectId {
        self.kernel
            .current_thread()
            .expect("SVC dispatched without a running thread")
    }

    // -- Memory management --------------------------------------------------

    /// SVC 0x01: ControlMemory. Maps, commits, frees or reprotects guest
    /// memory.
    fn control_memory(
        &mut self,
        operation: u32,
        addr0: VAddr,
        addr1: VAddr,
        size: u32,
        permissions: u32,
    ) -> Result<VAddr, ResultCode> {
        debug!(
            "ControlMemory: operation={operation:#010X}, addr0={addr0:#010X}, \
             addr1={addr1:#010X}, size={size:#X}, permissions={permissions:#010X}"
        );
        if addr0 & PAGE_MASK != 0 || addr1 & PAGE_MASK != 0 {
            return Err(error::MISALIGNED_ADDRESS);
        }
        if size & PAGE_MASK != 0 {
            return Err(error::MISALIGNED_SIZE);
        }

        let region = operation & MEMOP_REGION_MASK;
        if region != 0 {
            warn!("ControlMemory with a specified region is not supported, region={region:#X}");
        }
        if permissions & !VMAPermission::READ_WRITE.bits() != 0 {
            return Err(error::INVALID_COMBINATION);
        }
        let vma_permissions = VMAPermission::from_bits_truncate(permissions);
        let process_id = self.current_process();

        let out_addr = match operation & MEMOP_OPERATION_MASK {
            MEMOP_FREE => {
                let linear_base = LINEAR_HEAP_VADDR;
                let rc = if (HEAP_VADDR..HEAP_VADDR_END).contains(&addr0) {
                    self.kernel
                        .with_process_and_region(process_id, |p, r| p.heap_free(r, addr0, size))
                } else if addr0 >= linear_base {
                    self.kernel
                        .with_process_and_region(process_id, |p, r| p.linear_free(r, addr0, size))
                } else {
                    return Err(error::INVALID_ADDRESS);
                };
                if rc.is_error() {
                    return Err(rc);
                }
                addr0
            }
            MEMOP_COMMIT => {
                if operation & MEMOP_LINEAR != 0 {
                    self.kernel.with_process_and_region(process_id, |p, r| {
                        p.linear_allocate(r, addr0, size, vma_permissions)
                    })?
                } else {
                    self.kernel.with_process_and_region(process_id, |p, r| {
                        p.heap_allocate(r, addr0, size, vma_permissions)
                    })?
                }
            }
            MEMOP_MAP => {
                let rc = self.kernel.with_process_and_region(process_id, |p, _| {
                    p.map(addr0, addr1, size, vma_permissions)
                });
                if rc.is_error() {
                    return Err(rc);
                }
                addr0
            }
            MEMOP_UNMAP => {
                let rc = self.kernel.with_process_and_region(process_id, |p, _| {
                    p.unmap(addr0, addr1, size, vma_permissions)
                });
                if rc.is_error() {
                    return Err(rc);
                }
                addr0
            }
            MEMOP_PROTECT => {
                self.kernel
                    .process_mut(process_id)
                    .vm_manager
                    .reprotect_range(addr0, size, vma_permissions)
                    .map_err(|_| error::INVALID_ADDRESS)?;
                addr0
            }
            _ => {
                log::error!("unknown ControlMemory operation={operation:#010X}");
                return Err(error::INVALID_COMBINATION);
            }
        };
        self.kernel.process_ref(process_id).vm_manager.log_layout();
        Ok(out_addr)
    }

    /// SVC 0x02/0x7D: QueryMemory / QueryProcessMemory.
    fn query_process_memory(
        &mut self,
        process_handle: Handle,
        addr: VAddr,
    ) -> Result<(VAddr, u32, u32, u32), ResultCode> {
        let current = self.current_process();
        let process_id = self
            .kernel
            .object_for_handle(current, process_handle)
            .filter(|&id| self.kernel.try_process_ref(id).is_some())
            .ok_or(error::INVALID_HANDLE)?;
        let info = self
            .kernel
            .process_ref(process_id)
            .vm_manager
            .query(addr)
            .ok_or(error::INVALID_ADDRESS)?;
        debug!("QueryProcessMemory: process={process_handle:#010X}, addr={addr:#010X}");
        Ok((
            info.base,
            info.size,
            info.permissions.bits(),
            info.state as u32,
        ))
    }

    /// SVC 0x1E: CreateMemoryBlock.
    fn create_memory_block(
        &mut self,
        addr: VAddr,
        size: u32,
        my_permission: u32,
        other_permission: u32,
    ) -> Result<Handle, ResultCode> {
        if size & PAGE_MASK != 0 {
            return Err(error::MISALIGNED_SIZE);
        }
        let verify = |permission: u32| {
            let perm = VMAPermission::from_bits_truncate(permission);
            perm == VMAPermission::NONE
                || perm == VMAPermission::READ
                || perm == VMAPermission::WRITE
                || perm == VMAPermission::READ_WRITE
                || perm == VMAPermission::DONT_CARE
        };
        // Shared memory blocks can not be created with Execute permissions.
        if !verify(my_permission) || !verify(other_permission) {
            return Err(error::INVALID_COMBINATION);
        }
        if (addr < PROCESS_IMAGE_VADDR || addr + size > SHARED_MEMORY_VADDR_END) && addr != 0 {
            return Err(error::INVALID_ADDRESS);
        }

        let process_id = self.current_process();
        let my_perm = VMAPermission::from_bits_truncate(my_permission);
        let other_perm = VMAPermission::from_bits_truncate(other_permission);
        let block = if addr == 0 {
            self.kernel.create_shared_memory(
                Some(process_id),
                size,
                my_perm,
                other_perm,
                MemoryRegionName::Base,
                format!("memblock-{:08x}", self.cpu.lr()),
            )?
        } else {
            self.kernel.create_shared_memory_at(
                process_id,
                addr,
                size,
                my_perm,
                other_perm,
                format!("memblock-{:08x}", self.cpu.lr()),
            )?
        };
        self.kernel.create_handle_consuming(process_id, block)
    }

    /// SVC 0x1F: MapMemoryBlock.
    fn map_memory_block(
        &mut self,
        handle: Handle,
        addr: VAddr,
        permissions: u32,
        other_permissions: u32,
    ) -> ResultCode {
        log::trace!(
            "MapMemoryBlock: memblock={handle:#010X}, addr={addr:#010X}, \
             mypermissions={permissions:#010X}, otherpermission={other_permissions}"
        );
        let process_id = self.current_process();
        let Some(block) = self
            .kernel
            .object_for_handle(process_id, handle)
            .filter(|&id| self.kernel.try_shared_memory_ref(id).is_some())
        else {
            return error::INVALID_HANDLE;
        };
        let perm = VMAPermission::from_bits_truncate(permissions);
        if perm == VMAPermission::NONE || permissions != perm.bits() {
            log::error!("unknown permissions={permissions:#010X}");
            return error::INVALID_COMBINATION;
        }
        self.kernel.shared_memory_map(block, process_id, addr, perm)
    }

    /// SVC 0x20: UnmapMemoryBlock.
    fn unmap_memory_block(&mut self, handle: Handle, addr: VAddr) -> ResultCode {
        log::trace!("UnmapMemoryBlock: memblock={handle:#010X}, addr={addr:#010X}");
        let process_id = self.current_process();
        let Some(block) = self
            .kernel
            .object_for_handle(process_id, handle)
            .filter(|&id| self.kernel.try_shared_memory_ref(id).is_some())
        else {
            return error::INVALID_HANDLE;
        };
        self.kernel.shared_memory_unmap(block, process_id, addr)
    }

    // -- Processes and threads ----------------------------------------------

    /// SVC 0x03: ExitProcess.
    fn exit_process(&mut self) {
        self.kernel.exit_current_process();
    }

    /// SVC 0x08: CreateThread.
    fn create_thread(
        &mut self,
        priority: u32,
        entry_point: VAddr,
        arg: u32,
        stack_top: VAddr,
        processor_id: i32,
    ) -> Result<Handle, ResultCode> {
        let name = format!("thread-{entry_point:08X}");
        if priority > THREAD_PRIO_LOWEST {
            return Err(error::OUT_OF_RANGE);
        }
        let process_id = self.current_process();
        let limit = self.kernel.process_ref(process_id).resource_limit;
        if self
            .kernel
            .resource_limit_ref(limit)
            .max_resource_value(ResourceType::Priority as u32)
            > priority as i32
        {
            return Err(error::NOT_AUTHORIZED);
        }

        let mut processor_id = processor_id;
        if processor_id == THREAD_PROCESSOR_ID_DEFAULT {
            processor_id = self.kernel.process_ref(process_id).ideal_processor;
        }
        match processor_id {
            THREAD_PROCESSOR_ID0 => {}
            THREAD_PROCESSOR_ID_ALL => {
                log::info!("newly created thread is allowed to run on any core, unimplemented")
            }
            THREAD_PROCESSOR_ID1 => {
                log::error!("newly created thread must run on the system core, unimplemented")
            }
            _ => log::warn!("unsupported thread processor id {processor_id}"),
        }

        let thread = self.kernel.create_thread(
            process_id,
            name,
            entry_point,
            priority,
            arg,
            processor_id,
            stack_top,
        )?;
        let handle = self.kernel.create_handle(process_id, thread)?;
        self.kernel.prepare_reschedule();
        log::trace!(
            "CreateThread: entry={entry_point:#010X}, arg={arg:#010X}, \
             stacktop={stack_top:#010X}, priority={priority:#010X}: created handle={handle:#010X}"
        );
        Ok(handle)
    }

    /// SVC 0x09: ExitThread.
    fn exit_thread(&mut self) {
        log::trace!("ExitThread: pc={:#010X}", self.cpu.pc());
        self.kernel.exit_current_thread();
        self.kernel.prepare_reschedule();
    }

    /// SVC 0x0A: SleepThread.
    fn sleep_thread(&mut self, nanoseconds: i64) {
        log::trace!("SleepThread: nanoseconds={nanoseconds}");
        // Don't bother yielding when nobody else can run.
        if nanoseconds == 0 && !self.kernel.have_ready_threads() {
            return;
        }
        let thread = self.current_thread();
        self.kernel.wait_current_thread_sleep();
        self.kernel.wake_thread_after_delay(thread, nanoseconds);
        self.kernel.prepare_reschedule();
    }

    /// SVC 0x0B: GetThreadPriority.
    fn get_thread_priority(&mut self, handle: Handle) -> Result<u32, ResultCode> {
        let process_id = self.current_process();
        let thread = self
            .kernel
            .object_for_handle(process_id, handle)
            .filter(|&id| self.kernel.try_thread_ref(id).is_some())
            .ok_or(error::INVALID_HANDLE)?;
        Ok(self.kernel.thread_ref(thread).current_priority)
    }

    /// SVC 0x0C: SetThreadPriority.
    fn set_thread_priority(&mut self, handle: Handle, priority: u32) -> ResultCode {
        if priority > THREAD_PRIO_LOWEST {
            return error::OUT_OF_RANGE;
        }
        let process_id = self.current_process();
        let Some(thread) = self
            .kernel
            .object_for_handle(process_id, handle)
            .filter(|&id| self.kernel.try_thread_ref(id).is_some())
        else {
            return error::INVALID_HANDLE;
        };
        // The kernel uses the current process's resource limit, not the
        // thread owner's.
        let limit = self.kernel.process_ref(process_id).resource_limit;
        if self
            .kernel
            .resource_limit_ref(limit)
            .max_resource_value(ResourceType::Priority as u32)
            > priority as i32
        {
            return error::NOT_AUTHORIZED;
        }

        self.kernel.set_thread_priority(thread, priority);
        self.kernel.update_thread_priority(thread);
        // The mutexes this thread is waiting on see its new priority.
        for mutex in self.kernel.thread_ref(thread).pending_mutexes.clone() {
            self.kernel.mutex_update_priority(mutex);
        }
        self.kernel.prepare_reschedule();
        ResultCode::SUCCESS
    }

    // -- Synchronization objects --------------------------------------------

    /// SVC 0x13: CreateMutex.
    fn create_mutex(&mut self, initial_locked: u32) -> Result<Handle, ResultCode> {
        let name = format!("mutex-{:08x}", self.cpu.lr());
        let mutex = self.kernel.create_mutex(initial_locked != 0, name);
        let process_id = self.current_process();
        let handle = self.kernel.create_handle_consuming(process_id, mutex)?;
        log::trace!(
            "CreateMutex: initial_locked={}, created handle={handle:#010X}",
            initial_locked != 0
        );
        Ok(handle)
    }

    /// SVC 0x14: ReleaseMutex.
    fn release_mutex(&mut self, handle: Handle) -> ResultCode {
        log::trace!("ReleaseMutex: handle={handle:#010X}");
        let process_id = self.current_process();
        let Some(mutex) = self
            .kernel
            .object_for_handle(process_id, handle)
            .filter(|&id| self.kernel.try_mutex_ref(id).is_some())
        else {
            return error::INVALID_HANDLE;
        };
        let thread = self.current_thread();
        self.kernel.mutex_release(mutex, thread)
    }

    /// SVC 0x15: CreateSemaphore.
    fn create_semaphore(
        &mut self,
        initial_count: i32,
        max_count: i32,
    ) -> Result<Handle, ResultCode> {
        let name = format!("semaphore-{:08x}", self.cpu.lr());
        let semaphore = self.kernel.create_semaphore(initial_count, max_count, name)?;
        let process_id = self.current_process();
        let handle = self.kernel.create_handle_consuming(process_id, semaphore)?;
        log::trace!(
            "CreateSemaphore: initial_count={initial_count}, max_count={max_count}, \
             created handle={handle:#010X}"
        );
        Ok(handle)
    }

    /// SVC 0x16: ReleaseSemaphore.
    fn release_semaphore(
        &mut self,
        handle: Handle,
        release_count: i32,
    ) -> Result<i32, ResultCode> {
        log::trace!("ReleaseSemaphore: release_count={release_count}, handle={handle:#010X}");
        let process_id = self.current_process();
        let semaphore = self
            .kernel
            .object_for_handle(process_id, handle)
            .filter(|&id| self.kernel.try_semaphore_ref(id).is_some())
            .ok_or(error::INVALID_HANDLE)?;
        self.kernel.semaphore_release(semaphore, release_count)
    }

    /// SVC 0x17: CreateEvent.
    fn create_event(&mut self, reset_type: u32) -> Result<Handle, ResultCode> {
        let reset_type = ResetType::from_u32(reset_type).ok_or(error::INVALID_ENUM_VALUE)?;
        let name = format!("event-{:08x}", self.cpu.lr());
        let event = self.kernel.create_event(reset_type, name);
        let process_id = self.current_process();
        let handle = self.kernel.create_handle_consuming(process_id, event)?;
        log::trace!("CreateEvent: reset_type={reset_type:?}, created handle={handle:#010X}");
        Ok(handle)
    }

    /// SVC 0x18: SignalEvent.
    fn signal_event(&mut self, handle: Handle) -> ResultCode {
        log::trace!("SignalEvent: event={handle:#010X}");
        let process_id = self.current_process();
        let Some(event) = self
            .kernel
            .object_for_handle(process_id, handle)
            .filter(|&id| self.kernel.try_event_ref(id).is_some())
        else {
            return error::INVALID_HANDLE;
        };
        self.kernel.event_signal(event);
        ResultCode::SUCCESS
    }

    /// SVC 0x19: ClearEvent.
    fn clear_event(&mut self, handle: Handle) -> ResultCode {
        log::trace!("ClearEvent: event={handle:#010X}");
        let process_id = self.current_process();
        let Some(event) = self
            .kernel
            .object_for_handle(process_id, handle)
            .filter(|&id| self.kernel.try_event_ref(id).is_some())
        else {
            return error::INVALID_HANDLE;
        };
        self.kernel.event_clear(event);
        ResultCode::SUCCESS
    }

    /// SVC 0x1A: CreateTimer.
    fn create_timer(&mut self, reset_type: u32) -> Result<Handle, ResultCode> {
        let reset_type = ResetType::from_u32(reset_type).ok_or(error::INVALID_ENUM_VALUE)?;
        let name = format!("timer-{:08x}", self.cpu.lr());
        let timer = self.kernel.create_timer(reset_type, name);
        let process_id = self.current_process();
        let handle = self.kernel.create_handle_consuming(process_id, timer)?;
        log::trace!("CreateTimer: reset_type={reset_type:?}, created handle={handle:#010X}");
        Ok(handle)
    }

    /// SVC 0x1B: SetTimer.
    fn set_timer(&mut self, handle: Handle, initial: i64, interval: i64) -> ResultCode {
        log::trace!("SetTimer: timer={handle:#010X}");
        if initial < 0 || interval < 0 {
            return error::OUT_OF_RANGE_KERNEL;
        }
        let process_id = self.current_process();
        let Some(timer) = self
            .kernel
            .object_for_handle(process_id, handle)
            .filter(|&id| self.kernel.try_timer_ref(id).is_some())
        else {
            return error::INVALID_HANDLE;
        };
        self.kernel.timer_set(timer, initial as u64, interval as u64);
        ResultCode::SUCCESS
    }

    /// SVC 0x1C: CancelTimer.
    fn cancel_timer(&mut self, handle: Handle) -> ResultCode {
        log::trace!("CancelTimer: timer={handle:#010X}");
        let process_id = self.current_process();
        let Some(timer) = self
            .kernel
            .object_for_handle(process_id, handle)
            .filter(|&id| self.kernel.try_timer_ref(id).is_some())
        else {
            return error::INVALID_HANDLE;
        };
        self.kernel.timer_cancel(timer);
        ResultCode::SUCCESS
    }

    /// SVC 0x1D: ClearTimer.
    fn clear_timer(&mut self, handle: Handle) -> ResultCode {
        log::trace!("ClearTimer: timer={handle:#010X}");
        let process_id = self.current_process();
        let Some(timer) = self
            .kernel
            .object_for_handle(process_id, handle)
            .filter(|&id| self.kernel.try_timer_ref(id).is_some())
        else {
            return error::INVALID_HANDLE;
        };
        self.kernel.timer_clear(timer);
        ResultCode::SUCCESS
    }

    // -- Address arbitration ------------------------------------------------

    /// SVC 0x21: CreateAddressArbiter.
    fn create_address_arbiter(&mut self) -> Result<Handle, ResultCode> {
        let arbiter = self
            .kernel
            .create_address_arbiter(format!("arbiter-{:08x}", self.cpu.lr()));
        let process_id = self.current_process();
        let handle = self.kernel.create_handle_consuming(process_id, arbiter)?;
        log::trace!("CreateAddressArbiter: returned handle={handle:#010X}");
        Ok(handle)
    }

    /// SVC 0x22: ArbitrateAddress.
    fn arbitrate_address(
        &mut self,
        handle: Handle,
        address: VAddr,
        arbitration_type: u32,
        value: u32,
        nanoseconds: i64,
    ) -> ResultCode {
        log::trace!(
            "ArbitrateAddress: handle={handle:#010X}, address={address:#010X}, \
             type={arbitration_type:#010X}, value={value:#010X}"
        );
        let process_id = self.current_process();
        let Some(arbiter) = self
            .kernel
            .object_for_handle(process_id, handle)
            .filter(|&id| self.kernel.try_arbiter_ref(id).is_some())
        else {
            return error::INVALID_HANDLE;
        };
        let Some(arbitration_type) = ArbitrationType::from_u32(arbitration_type) else {
            return error::INVALID_ENUM_VALUE;
        };
        let thread = self.current_thread();
        let result = self.kernel.arbitrate_address(
            arbiter,
            thread,
            arbitration_type,
            address,
            value as i32,
            nanoseconds,
        );
        self.kernel.prepare_reschedule();
        result
    }

    // -- Handles and waiting ------------------------------------------------

    /// SVC 0x23: CloseHandle.
    fn close_handle(&mut self, handle: Handle) -> ResultCode {
        log::trace!("CloseHandle: handle={handle:#010X}");
        let process_id = self.current_process();
        self.kernel.close_handle(process_id, handle)
    }

    /// SVC 0x24: WaitSynchronization1.
    fn wait_synchronization1(&mut self, handle: Handle, nano_seconds: i64) -> ResultCode {
        let process_id = self.current_process();
        let thread = self.current_thread();
        let Some(object) = self.kernel.wait_object_for_handle(process_id, handle) else {
            return error::INVALID_HANDLE;
        };
        log::trace!("WaitSynchronization1: handle={handle:#010X}, nanoseconds={nano_seconds}");

        if self.kernel.should_wait(object, thread) {
            if nano_seconds == 0 {
                return error::TIMEOUT;
            }
            {
                let t = self.kernel.thread_mut(thread);
                t.wait_objects = vec![object];
                t.status = ThreadStatus::WaitSynchAny;
                t.wakeup_callback = Some(WakeupCallback::WaitSynchAny { with_index: false });
            }
            self.kernel.wait_object_add_waiter(object, thread);
            self.kernel.wake_thread_after_delay(thread, nano_seconds);
            self.kernel.prepare_reschedule();
            // The real result is delivered by the wakeup callback; until
            // then the SVC reports a timeout.
            return error::TIMEOUT;
        }
        self.kernel.wait_object_acquire(object, thread);
        ResultCode::SUCCESS
    }

    /// SVC 0x25: WaitSynchronizationN.
    fn wait_synchronization_n(
        &mut self,
        out_index: &mut i32,
        handles_address: VAddr,
        handle_count: i32,
        wait_all: bool,
        nano_seconds: i64,
    ) -> ResultCode {
        let process_id = self.current_process();
        let thread = self.current_thread();

        if handle_count < 0 {
            return error::OUT_OF_RANGE;
        }
        let mut objects = Vec::with_capacity(handle_count as usize);
        for i in 0..handle_count as u32 {
            let handle = match self.kernel.guest_read_u32(process_id, handles_address + i * 4) {
                Ok(handle) => handle,
                Err(_) => return error::INVALID_POINTER,
            };
            match self.kernel.wait_object_for_handle(process_id, handle) {
                Some(object) => objects.push(object),
                None => return error::INVALID_HANDLE,
            }
        }

        if wait_all {
            if objects
                .iter()
                .all(|&object| !self.kernel.should_wait(object, thread))
            {
                // Everything is ready; acquire the lot. The out parameter is
                // not touched in this case.
                for &object in &objects {
                    self.kernel.wait_object_acquire(object, thread);
                }
                return ResultCode::SUCCESS;
            }
            if nano_seconds == 0 {
                return error::TIMEOUT;
            }
            {
                let t = self.kernel.thread_mut(thread);
                t.status = ThreadStatus::WaitSynchAll;
                t.wakeup_callback = Some(WakeupCallback::WaitSynchAll);
            }
            for &object in &objects {
                self.kernel.wait_object_add_waiter(object, thread);
            }
            self.kernel.thread_mut(thread).wait_objects = objects;
            self.kernel.wake_thread_after_delay(thread, nano_seconds);
            self.kernel.prepare_reschedule();
            *out_index = -1;
            return error::TIMEOUT;
        }

        // Wait-any: take the first ready object if there is one.
        if let Some(index) = objects
            .iter()
            .position(|&object| !self.kernel.should_wait(object, thread))
        {
            self.kernel.wait_object_acquire(objects[index], thread);
            *out_index = index as i32;
            return ResultCode::SUCCESS;
        }
        if nano_seconds == 0 {
            return error::TIMEOUT;
        }
        // With no handles and no timeout the thread deadlocks, matching
        // hardware.
        {
            let t = self.kernel.thread_mut(thread);
            t.status = ThreadStatus::WaitSynchAny;
            t.wakeup_callback = Some(WakeupCallback::WaitSynchAny { with_index: true });
        }
        for &object in &objects {
            self.kernel.wait_object_add_waiter(object, thread);
        }
        self.kernel.thread_mut(thread).wait_objects = objects;
        self.kernel.wake_thread_after_delay(thread, nano_seconds);
        self.kernel.prepare_reschedule();
        *out_index = -1;
        error::TIMEOUT
    }

    /// SVC 0x27: DuplicateHandle.
    fn duplicate_handle(&mut self, handle: Handle) -> Result<Handle, ResultCode> {
        let process_id = self.current_process();
        let out = self.kernel.duplicate_handle(process_id, handle)?;
        log::trace!("DuplicateHandle: duplicated {handle:#010X} to {out:#010X}");
        Ok(out)
    }

    // -- Time and information -----------------------------------------------

    /// SVC 0x28: GetSystemTick.
    fn get_system_tick(&mut self) -> u64 {
        let ticks = self.kernel.timing.ticks();
        // Advance time to defeat busy-wait loops that spin on the tick
        // counter waiting for the frame to end.
        self.kernel.timing.add_ticks(150);
        ticks
    }

    /// SVC 0x2A: GetSystemInfo.
    fn get_system_info(&mut self, info_type: u32, param: i32) -> i64 {
        log::trace!("GetSystemInfo: type={info_type} param={param}");
        match info_type {
            // Memory usage per region.
            0 => match param {
                0 => {
                    (self.kernel.memory.region_used(MemoryRegionName::Application)
                        + self.kernel.memory.region_used(MemoryRegionName::System)
                        + self.kernel.memory.region_used(MemoryRegionName::Base))
                        as i64
                }
                1 => self.kernel.memory.region_used(MemoryRegionName::Application) as i64,
                2 => self.kernel.memory.region_used(MemoryRegionName::System) as i64,
                3 => self.kernel.memory.region_used(MemoryRegionName::Base) as i64,
                _ => {
                    log::error!("unknown GetSystemInfo type 0 (param={param})");
                    0
                }
            },
            2 => {
                log::error!("unimplemented GetSystemInfo type 2 (param={param})");
                0
            }
            26 => self.kernel.process_list.len() as i64,
            _ => {
                log::error!("unknown GetSystemInfo type={info_type} param={param}");
                0
            }
        }
        // This SVC never fails, even for invalid parameters.
    }

    /// SVC 0x2B: GetProcessInfo.
    fn get_process_info(
        &mut self,
        process_handle: Handle,
        info_type: u32,
    ) -> Result<i64, ResultCode> {
        log::trace!("GetProcessInfo: process={process_handle:#010X} type={info_type}");
        let current = self.current_process();
        let process_id = self
            .kernel
            .object_for_handle(current, process_handle)
            .filter(|&id| self.kernel.try_process_ref(id).is_some())
            .ok_or(error::INVALID_HANDLE)?;
        match info_type {
            0 | 2 => {
                let used = self.kernel.process_ref(process_id).memory_used as i64;
                if used % rytra_common::PAGE_SIZE as i64 != 0 {
                    log::error!("memory size not page-aligned");
                    return Err(error::MISALIGNED_SIZE);
                }
                Ok(used)
            }
            1 | 3..=8 => {
                log::error!("unimplemented GetProcessInfo type={info_type}");
                Ok(0)
            }
            20 => Ok((rytra_common::FCRAM_PADDR - LINEAR_HEAP_VADDR) as i64),
            21..=23 => Err(error::NOT_IMPLEMENTED),
            _ => {
                log::error!("unknown GetProcessInfo type={info_type}");
                Err(error::INVALID_ENUM_VALUE)
            }
        }
    }

    /// SVC 0x35: GetProcessId.
    fn get_process_id(&mut self, process_handle: Handle) -> Result<u32, ResultCode> {
        log::trace!("GetProcessId: process={process_handle:#010X}");
        let current = self.current_process();
        let process_id = self
            .kernel
            .object_for_handle(current, process_handle)
            .filter(|&id| self.kernel.try_process_ref(id).is_some())
            .ok_or(error::INVALID_HANDLE)?;
        Ok(self.kernel.process_ref(process_id).process_id)
    }

    /// SVC 0x36: GetProcessIdOfThread.
    fn get_process_id_of_thread(&mut self, thread_handle: Handle) -> Result<u32, ResultCode> {
        log::trace!("GetProcessIdOfThread: thread={thread_handle:#010X}");
        let current = self.current_process();
        let thread = self
            .kernel
            .object_for_handle(current, thread_handle)
            .filter(|&id| self.kernel.try_thread_ref(id).is_some())
            .ok_or(error::INVALID_HANDLE)?;
        let owner = self.kernel.thread_ref(thread).owner_process;
        Ok(self.kernel.process_ref(owner).process_id)
    }

    /// SVC 0x37: GetThreadId.
    fn get_thread_id(&mut self, handle: Handle) -> Result<u32, ResultCode> {
        log::trace!("GetThreadId: thread={handle:#010X}");
        let current = self.current_process();
        let thread = self
            .kernel
            .object_for_handle(current, handle)
            .filter(|&id| self.kernel.try_thread_ref(id).is_some())
            .ok_or(error::INVALID_HANDLE)?;
        Ok(self.kernel.thread_ref(thread).thread_id)
    }

    /// SVC 0x38: GetResourceLimit.
    fn get_resource_limit(&mut self, process_handle: Handle) -> Result<Handle, ResultCode> {
        log::trace!("GetResourceLimit: process={process_handle:#010X}");
        let current = self.current_process();
        let process_id = self
            .kernel
            .object_for_handle(current, process_handle)
            .filter(|&id| self.kernel.try_process_ref(id).is_some())
            .ok_or(error::INVALID_HANDLE)?;
        let limit = self.kernel.process_ref(process_id).resource_limit;
        self.kernel.create_handle(current, limit)
    }

    /// SVC 0x39/0x3A: GetResourceLimitLimitValues / CurrentValues.
    fn get_resource_limit_values(
        &mut self,
        values_address: VAddr,
        resource_limit_handle: Handle,
        names_address: VAddr,
        name_count: u32,
        current_values: bool,
    ) -> ResultCode {
        log::trace!(
            "GetResourceLimitValues: resource_limit={resource_limit_handle:#010X}, \
             names={names_address:#010X}, name_count={name_count}"
        );
        let process_id = self.current_process();
        let Some(limit) = self
            .kernel
            .object_for_handle(process_id, resource_limit_handle)
            .filter(|&id| self.kernel.try_resource_limit_ref(id).is_some())
        else {
            return error::INVALID_HANDLE;
        };
        for i in 0..name_count {
            let name = match self.kernel.guest_read_u32(process_id, names_address + i * 4) {
                Ok(name) => name,
                Err(_) => return error::INVALID_POINTER,
            };
            let value = {
                let limit = self.kernel.resource_limit_ref(limit);
                if current_values {
                    limit.current_resource_value(name)
                } else {
                    limit.max_resource_value(name)
                }
            };
            if self
                .kernel
                .guest_write_u64(process_id, values_address + i * 8, value as i64 as u64)
                .is_err()
            {
                return error::INVALID_POINTER;
            }
        }
        ResultCode::SUCCESS
    }

    // -- Debug --------------------------------------------------------------

    /// SVC 0x3C: Break.
    fn break_execution(&mut self, break_reason: u32) {
        let reason = match break_reason & 0xFF {
            0 => "PANIC",
            1 => "ASSERT",
            2 => "USER",
            _ => "UNKNOWN",
        };
        log::error!("emulated program broke execution, reason: {reason}");
    }

    /// SVC 0x3D: OutputDebugString.
    fn output_debug_string(&mut self, address: VAddr, len: i32) {
        if len <= 0 {
            return;
        }
        let process_id = self.current_process();
        let mut bytes = vec![0u8; len as usize];
        match self.kernel.guest_read_block(process_id, address, &mut bytes) {
            Ok(()) => debug!("[guest] {}", String::from_utf8_lossy(&bytes)),
            Err(_) => log::error!("OutputDebugString with an unreadable buffer"),
        }
    }

    // -- IPC ----------------------------------------------------------------

    /// SVC 0x2D: ConnectToPort.
    fn connect_to_port(&mut self, port_name_address: VAddr) -> Result<Handle, ResultCode> {
        let process_id = self.current_process();
        // Read one byte past the limit to detect over-long names.
        let port_name = self
            .kernel
            .guest_read_cstring(process_id, port_name_address, PORT_NAME_MAX_LENGTH + 1)
            .map_err(|_| error::NOT_FOUND)?;
        if port_name.len() > PORT_NAME_MAX_LENGTH {
            return Err(error::PORT_NAME_TOO_LONG);
        }
        log::trace!("ConnectToPort: port_name={port_name}");

        let Some(client_port) = self.kernel.named_port(&port_name) else {
            warn!("tried to connect to unknown port: {port_name}");
            return Err(error::NOT_FOUND);
        };
        let session = self.kernel.client_port_connect(client_port)?;
        self.kernel.create_handle_consuming(process_id, session)
    }

    /// SVC 0x32: SendSyncRequest.
    fn send_sync_request(&mut self, handle: Handle) -> ResultCode {
        let process_id = self.current_process();
        let Some(session) = self
            .kernel
            .object_for_handle(process_id, handle)
            .filter(|&id| self.kernel.try_client_session_ref(id).is_some())
        else {
            return error::INVALID_HANDLE;
        };
        log::trace!("SendSyncRequest: handle={handle:#010X}");
        let thread = self.current_thread();
        self.kernel.prepare_reschedule();
        self.kernel.session_send_sync_request(session, thread)
    }

    /// SVC 0x47: CreatePort.
    fn create_port(
        &mut self,
        name_address: VAddr,
        max_sessions: u32,
    ) -> Result<(Handle, Handle), ResultCode> {
        let process_id = self.current_process();
        let name = if name_address == 0 {
            String::new()
        } else {
            let name = self
                .kernel
                .guest_read_cstring(process_id, name_address, PORT_NAME_MAX_LENGTH + 1)
                .map_err(|_| error::INVALID_ADDRESS)?;
            if name.len() > PORT_NAME_MAX_LENGTH {
                return Err(error::PORT_NAME_TOO_LONG);
            }
            name
        };

        let (server_port, client_port) = self
            .kernel
            .create_port_pair(max_sessions, if name.is_empty() { "port".into() } else { name.clone() });
        if !name.is_empty() {
            self.kernel.register_named_port(&name, client_port);
        }
        let server_handle = match self.kernel.create_handle_consuming(process_id, server_port) {
            Ok(handle) => handle,
            Err(rc) => {
                self.kernel.release_object(client_port);
                return Err(rc);
            }
        };
        let client_handle = match self.kernel.create_handle_consuming(process_id, client_port) {
            Ok(handle) => handle,
            Err(rc) => {
                let _ = self.kernel.close_handle(process_id, server_handle);
                return Err(rc);
            }
        };
        log::trace!("CreatePort: max_sessions={max_sessions}");
        Ok((server_handle, client_handle))
    }

    /// SVC 0x48: CreateSessionToPort.
    fn create_session_to_port(&mut self, client_port_handle: Handle) -> Result<Handle, ResultCode> {
        let process_id = self.current_process();
        let client_port = self
            .kernel
            .object_for_handle(process_id, client_port_handle)
            .filter(|&id| self.kernel.try_client_port_ref(id).is_some())
            .ok_or(error::INVALID_HANDLE)?;
        let session = self.kernel.client_port_connect(client_port)?;
        self.kernel.create_handle_consuming(process_id, session)
    }

    /// SVC 0x49: CreateSession.
    fn create_session(&mut self) -> Result<(Handle, Handle), ResultCode> {
        let process_id = self.current_process();
        let (server_session, client_session) = self
            .kernel
            .create_session_pair(None, format!("session-{:08x}", self.cpu.lr()));
        let server_handle = self
            .kernel
            .create_handle_consuming(process_id, server_session)?;
        let client_handle = match self.kernel.create_handle_consuming(process_id, client_session) {
            Ok(handle) => handle,
            Err(rc) => {
                let _ = self.kernel.close_handle(process_id, server_handle);
                return Err(rc);
            }
        };
        log::trace!("CreateSession: called");
        Ok((server_handle, client_handle))
    }

    /// SVC 0x4A: AcceptSession.
    fn accept_session(&mut self, server_port_handle: Handle) -> Result<Handle, ResultCode> {
        let process_id = self.current_process();
        let server_port = self
            .kernel
            .object_for_handle(process_id, server_port_handle)
            .filter(|&id| self.kernel.try_server_port_ref(id).is_some())
            .ok_or(error::INVALID_HANDLE)?;
        let session = self.kernel.server_port_accept(server_port)?;
        self.kernel.create_handle_consuming(process_id, session)
    }

    /// SVC 0x4F: ReplyAndReceive.
    fn reply_and_receive(
        &mut self,
        out_index: &mut i32,
        handles_address: VAddr,
        handle_count: i32,
        reply_target: Handle,
    ) -> ResultCode {
        let process_id = self.current_process();
        let thread = self.current_thread();

        if handle_count < 0 {
            return error::OUT_OF_RANGE;
        }
        let mut objects = Vec::with_capacity(handle_count as usize);
        for i in 0..handle_count as u32 {
            let handle = match self.kernel.guest_read_u32(process_id, handles_address + i * 4) {
                Ok(handle) => handle,
                Err(_) => return error::INVALID_POINTER,
            };
            match self.kernel.wait_object_for_handle(process_id, handle) {
                Some(object) => objects.push(object),
                None => return error::INVALID_HANDLE,
            }
        }

        let command_buffer = self.kernel.thread_ref(thread).command_buffer_address();
        let header = match self.kernel.guest_read_u32(process_id, command_buffer) {
            Ok(word) => Header(word),
            Err(_) => return error::INVALID_POINTER,
        };

        // A command id of 0xFFFF means: do not send a reply.
        if reply_target != 0 && header.command_id() != 0xFFFF {
            let Some(session) = self
                .kernel
                .object_for_handle(process_id, reply_target)
                .filter(|&id| self.kernel.try_server_session_ref(id).is_some())
            else {
                return error::INVALID_HANDLE;
            };
            // Mark the request handled.
            let request_thread = self.kernel.server_session_mut(session).currently_handling.take();
            let session_id = self.kernel.server_session_ref(session).session;
            let client_alive = self.kernel.session_ref(session_id).client.is_some();
            let Some(request_thread) = request_thread.filter(|_| client_alive) else {
                *out_index = -1;
                return error::SESSION_CLOSED_BY_REMOTE;
            };

            match self
                .kernel
                .translate_command_buffer(thread, request_thread, session, true)
            {
                Ok(()) => {}
                Err(rc) => {
                    // The real kernel panics when the server-to-client
                    // translation fails; report it instead.
                    log::error!("reply translation failed: {rc}");
                    return rc;
                }
            }
            // The scheduler isn't invoked here; the client resumes directly.
            self.kernel.resume_thread_from_wait(request_thread);
        }

        if handle_count == 0 {
            *out_index = 0;
            // Placeholder result the kernel returns when no reply was sent
            // and there is nothing to wait on.
            if reply_target == 0 || header.command_id() == 0xFFFF {
                return error::NO_REPLY_NO_WAIT;
            }
            return ResultCode::SUCCESS;
        }

        if let Some(index) = objects
            .iter()
            .position(|&object| !self.kernel.should_wait(object, thread))
        {
            let object = objects[index];
            self.kernel.wait_object_acquire(object, thread);
            *out_index = index as i32;
            if self.kernel.try_server_session_ref(object).is_none() {
                return ResultCode::SUCCESS;
            }
            return self.kernel.receive_ipc_request(object, thread);
        }

        // Nothing ready; park until a session signals. The receive-side
        // translation runs from the wakeup callback.
        {
            let t = self.kernel.thread_mut(thread);
            t.status = ThreadStatus::WaitSynchAny;
            t.wakeup_callback = Some(WakeupCallback::IpcReceive);
        }
        for &object in &objects {
            self.kernel.wait_object_add_waiter(object, thread);
        }
        self.kernel.thread_mut(thread).wait_objects = objects;
        self.kernel.prepare_reschedule();
        *out_index = -1;
        ResultCode::SUCCESS
    }
}

// ---------------------------------------------------------------------------
// Wrappers: register marshaling per SVC
// ---------------------------------------------------------------------------

fn wrap_control_memory(svc: &mut Svc<'_>) {
    let (op, addr0, addr1, size, perms) = (
        svc.reg(0),
        svc.reg(1),
        svc.reg(2),
        svc.reg(3),
        svc.reg(4),
    );
    match svc.control_memory(op, addr0, addr1, size, perms) {
        Ok(out_addr) => {
            svc.set_reg(0, ResultCode::SUCCESS.raw());
            svc.set_reg(1, out_addr);
        }
        Err(rc) => {
            svc.set_reg(0, rc.raw());
            svc.set_reg(1, 0);
        }
    }
}

fn wrap_query_memory(svc: &mut Svc<'_>) {
    let addr = svc.reg(2);
    write_memory_query(svc, CURRENT_PROCESS_HANDLE, addr);
}

fn wrap_query_process_memory(svc: &mut Svc<'_>) {
    let (handle, addr) = (svc.reg(2), svc.reg(3));
    write_memory_query(svc, handle, addr);
}

fn write_memory_query(svc: &mut Svc<'_>, handle: Handle, addr: VAddr) {
    match svc.query_process_memory(handle, addr) {
        Ok((base, size, permissions, state)) => {
            svc.set_reg(0, ResultCode::SUCCESS.raw());
            svc.set_reg(1, base);
            svc.set_reg(2, size);
            svc.set_reg(3, permissions);
            svc.set_reg(4, state);
            svc.set_reg(5, 0); // page_info flags
        }
        Err(rc) => {
            svc.set_reg(0, rc.raw());
        }
    }
}

fn wrap_exit_process(svc: &mut Svc<'_>) {
    svc.exit_process();
}

fn wrap_create_thread(svc: &mut Svc<'_>) {
    let (priority, entry, arg, stack_top, processor) = (
        svc.reg(0),
        svc.reg(1),
        svc.reg(2),
        svc.reg(3),
        svc.reg(4) as i32,
    );
    match svc.create_thread(priority, entry, arg, stack_top, processor) {
        Ok(handle) => {
            svc.set_reg(0, ResultCode::SUCCESS.raw());
            svc.set_reg(1, handle);
        }
        Err(rc) => {
            svc.set_reg(0, rc.raw());
            svc.set_reg(1, 0);
        }
    }
}

fn wrap_exit_thread(svc: &mut Svc<'_>) {
    svc.exit_thread();
}

fn wrap_sleep_thread(svc: &mut Svc<'_>) {
    let ns = svc.ns_from(0, 1);
    svc.sleep_thread(ns);
    svc.set_reg(0, ResultCode::SUCCESS.raw());
}

fn wrap_get_thread_priority(svc: &mut Svc<'_>) {
    let handle = svc.reg(1);
    match svc.get_thread_priority(handle) {
        Ok(priority) => {
            svc.set_reg(0, ResultCode::SUCCESS.raw());
            svc.set_reg(1, priority);
        }
        Err(rc) => svc.set_reg(0, rc.raw()),
    }
}

fn wrap_set_thread_priority(svc: &mut Svc<'_>) {
    let (handle, priority) = (svc.reg(0), svc.reg(1));
    let rc = svc.set_thread_priority(handle, priority);
    svc.set_reg(0, rc.raw());
}

fn wrap_create_mutex(svc: &mut Svc<'_>) {
    let initial_locked = svc.reg(1);
    write_handle_result(svc, |svc| svc.create_mutex(initial_locked));
}

fn wrap_release_mutex(svc: &mut Svc<'_>) {
    let handle = svc.reg(0);
    let rc = svc.release_mutex(handle);
    svc.set_reg(0, rc.raw());
}

fn wrap_create_semaphore(svc: &mut Svc<'_>) {
    let (initial, max) = (svc.reg(1) as i32, svc.reg(2) as i32);
    write_handle_result(svc, |svc| svc.create_semaphore(initial, max));
}

fn wrap_release_semaphore(svc: &mut Svc<'_>) {
    let (handle, count) = (svc.reg(1), svc.reg(2) as i32);
    match svc.release_semaphore(handle, count) {
        Ok(previous) => {
            svc.set_reg(0, ResultCode::SUCCESS.raw());
            svc.set_reg(1, previous as u32);
        }
        Err(rc) => svc.set_reg(0, rc.raw()),
    }
}

fn wrap_create_event(svc: &mut Svc<'_>) {
    let reset_type = svc.reg(1);
    write_handle_result(svc, |svc| svc.create_event(reset_type));
}

fn wrap_signal_event(svc: &mut Svc<'_>) {
    let handle = svc.reg(0);
    let rc = svc.signal_event(handle);
    svc.set_reg(0, rc.raw());
}

fn wrap_clear_event(svc: &mut Svc<'_>) {
    let handle = svc.reg(0);
    let rc = svc.clear_event(handle);
    svc.set_reg(0, rc.raw());
}

fn wrap_create_timer(svc: &mut Svc<'_>) {
    let reset_type = svc.reg(1);
    write_handle_result(svc, |svc| svc.create_timer(reset_type));
}

fn wrap_set_timer(svc: &mut Svc<'_>) {
    let handle = svc.reg(0);
    let initial = svc.ns_from(2, 3);
    let interval = (((svc.reg(4) as u64) << 32) | svc.reg(1) as u64) as i64;
    let rc = svc.set_timer(handle, initial, interval);
    svc.set_reg(0, rc.raw());
}

fn wrap_cancel_timer(svc: &mut Svc<'_>) {
    let handle = svc.reg(0);
    let rc = svc.cancel_timer(handle);
    svc.set_reg(0, rc.raw());
}

fn wrap_clear_timer(svc: &mut Svc<'_>) {
    let handle = svc.reg(0);
    let rc = svc.clear_timer(handle);
    svc.set_reg(0, rc.raw());
}

fn wrap_create_memory_block(svc: &mut Svc<'_>) {
    let (other_perm, addr, size, my_perm) = (svc.reg(0), svc.reg(1), svc.reg(2), svc.reg(3));
    write_handle_result(svc, |svc| {
        svc.create_memory_block(addr, size, my_perm, other_perm)
    });
}

fn wrap_map_memory_block(svc: &mut Svc<'_>) {
    let (handle, addr, perms, other_perms) = (svc.reg(0), svc.reg(1), svc.reg(2), svc.reg(3));
    let rc = svc.map_memory_block(handle, addr, perms, other_perms);
    svc.set_reg(0, rc.raw());
}

fn wrap_unmap_memory_block(svc: &mut Svc<'_>) {
    let (handle, addr) = (svc.reg(0), svc.reg(1));
    let rc = svc.unmap_memory_block(handle, addr);
    svc.set_reg(0, rc.raw());
}

fn wrap_create_address_arbiter(svc: &mut Svc<'_>) {
    write_handle_result(svc, |svc| svc.create_address_arbiter());
}

fn wrap_arbitrate_address(svc: &mut Svc<'_>) {
    let (handle, address, arb_type, value) =
        (svc.reg(0), svc.reg(1), svc.reg(2), svc.reg(3));
    let ns = svc.ns_from(4, 5);
    let rc = svc.arbitrate_address(handle, address, arb_type, value, ns);
    svc.set_reg(0, rc.raw());
}

fn wrap_close_handle(svc: &mut Svc<'_>) {
    let handle = svc.reg(0);
    let rc = svc.close_handle(handle);
    svc.set_reg(0, rc.raw());
}

fn wrap_wait_synchronization1(svc: &mut Svc<'_>) {
    let handle = svc.reg(0);
    let ns = svc.ns_from(2, 3);
    let rc = svc.wait_synchronization1(handle, ns);
    svc.set_reg(0, rc.raw());
}

fn wrap_wait_synchronization_n(svc: &mut Svc<'_>) {
    let handles_address = svc.reg(1);
    let handle_count = svc.reg(2) as i32;
    let wait_all = svc.reg(3) != 0;
    let ns = (((svc.reg(4) as u64) << 32) | svc.reg(0) as u64) as i64;
    let mut out_index = 0i32;
    let rc = svc.wait_synchronization_n(&mut out_index, handles_address, handle_count, wait_all, ns);
    svc.set_reg(0, rc.raw());
    svc.set_reg(1, out_index as u32);
}

fn wrap_duplicate_handle(svc: &mut Svc<'_>) {
    let handle = svc.reg(1);
    write_handle_result(svc, |svc| svc.duplicate_handle(handle));
}

fn wrap_get_system_tick(svc: &mut Svc<'_>) {
    let ticks = svc.get_system_tick();
    svc.set_reg(0, ticks as u32);
    svc.set_reg(1, (ticks >> 32) as u32);
}

fn wrap_get_system_info(svc: &mut Svc<'_>) {
    let (info_type, param) = (svc.reg(1), svc.reg(2) as i32);
    let out = svc.get_system_info(info_type, param);
    svc.set_reg(0, ResultCode::SUCCESS.raw());
    svc.set_reg(1, out as u32);
    svc.set_reg(2, (out >> 32) as u32);
}

fn wrap_get_process_info(svc: &mut Svc<'_>) {
    let (handle, info_type) = (svc.reg(1), svc.reg(2));
    match svc.get_process_info(handle, info_type) {
        Ok(out) => {
            svc.set_reg(0, ResultCode::SUCCESS.raw());
            svc.set_reg(1, out as u32);
            svc.set_reg(2, (out >> 32) as u32);
        }
        Err(rc) => svc.set_reg(0, rc.raw()),
    }
}

fn wrap_connect_to_port(svc: &mut Svc<'_>) {
    let name_address = svc.reg(1);
    write_handle_result(svc, |svc| svc.connect_to_port(name_address));
}

fn wrap_send_sync_request(svc: &mut Svc<'_>) {
    let handle = svc.reg(0);
    let rc = svc.send_sync_request(handle);
    svc.set_reg(0, rc.raw());
}

fn wrap_get_process_id(svc: &mut Svc<'_>) {
    let handle = svc.reg(1);
    match svc.get_process_id(handle) {
        Ok(pid) => {
            svc.set_reg(0, ResultCode::SUCCESS.raw());
            svc.set_reg(1, pid);
        }
        Err(rc) => svc.set_reg(0, rc.raw()),
    }
}

fn wrap_get_process_id_of_thread(svc: &mut Svc<'_>) {
    let handle = svc.reg(1);
    match svc.get_process_id_of_thread(handle) {
        Ok(pid) => {
            svc.set_reg(0, ResultCode::SUCCESS.raw());
            svc.set_reg(1, pid);
        }
        Err(rc) => svc.set_reg(0, rc.raw()),
    }
}

fn wrap_get_thread_id(svc: &mut Svc<'_>) {
    let handle = svc.reg(1);
    match svc.get_thread_id(handle) {
        Ok(tid) => {
            svc.set_reg(0, ResultCode::SUCCESS.raw());
            svc.set_reg(1, tid);
        }
        Err(rc) => svc.set_reg(0, rc.raw()),
    }
}

fn wrap_get_resource_limit(svc: &mut Svc<'_>) {
    let handle = svc.reg(1);
    write_handle_result(svc, |svc| svc.get_resource_limit(handle));
}

fn wrap_get_resource_limit_limit_values(svc: &mut Svc<'_>) {
    let (values, handle, names, count) = (svc.reg(0), svc.reg(1), svc.reg(2), svc.reg(3));
    let rc = svc.get_resource_limit_values(values, handle, names, count, false);
    svc.set_reg(0, rc.raw());
}

fn wrap_get_resource_limit_current_values(svc: &mut Svc<'_>) {
    let (values, handle, names, count) = (svc.reg(0), svc.reg(1), svc.reg(2), svc.reg(3));
    let rc = svc.get_resource_limit_values(values, handle, names, count, true);
    svc.set_reg(0, rc.raw());
}

fn wrap_break(svc: &mut Svc<'_>) {
    let reason = svc.reg(0);
    svc.break_execution(reason);
}

fn wrap_output_debug_string(svc: &mut Svc<'_>) {
    let (address, len) = (svc.reg(0), svc.reg(1) as i32);
    svc.output_debug_string(address, len);
    svc.set_reg(0, ResultCode::SUCCESS.raw());
}

fn wrap_create_port(svc: &mut Svc<'_>) {
    let (name_address, max_sessions) = (svc.reg(2), svc.reg(3));
    match svc.create_port(name_address, max_sessions) {
        Ok((server, client)) => {
            svc.set_reg(0, ResultCode::SUCCESS.raw());
            svc.set_reg(1, server);
            svc.set_reg(2, client);
        }
        Err(rc) => {
            svc.set_reg(0, rc.raw());
            svc.set_reg(1, 0);
            svc.set_reg(2, 0);
        }
    }
}

fn wrap_create_session_to_port(svc: &mut Svc<'_>) {
    let handle = svc.reg(1);
    write_handle_result(svc, |svc| svc.create_session_to_port(handle));
}

fn wrap_create_session(svc: &mut Svc<'_>) {
    match svc.create_session() {
        Ok((server, client)) => {
            svc.set_reg(0, ResultCode::SUCCESS.raw());
            svc.set_reg(1, server);
            svc.set_reg(2, client);
        }
        Err(rc) => {
            svc.set_reg(0, rc.raw());
            svc.set_reg(1, 0);
            svc.set_reg(2, 0);
        }
    }
}

fn wrap_accept_session(svc: &mut Svc<'_>) {
    let handle = svc.reg(1);
    write_handle_result(svc, |svc| svc.accept_session(handle));
}

fn wrap_reply_and_receive(svc: &mut Svc<'_>) {
    let (handles_address, handle_count, reply_target) =
        (svc.reg(1), svc.reg(2) as i32, svc.reg(3));
    let mut out_index = 0i32;
    let rc = svc.reply_and_receive(&mut out_index, handles_address, handle_count, reply_target);
    svc.set_reg(0, rc.raw());
    svc.set_reg(1, out_index as u32);
}

/// Shared shape: result in r0, handle (or 0) in r1.
fn write_handle_result(
    svc: &mut Svc<'_>,
    f: impl FnOnce(&mut Svc<'_>) -> Result<Handle, ResultCode>,
) {
    match f(svc) {
        Ok(handle) => {
            svc.set_reg(0, ResultCode::SUCCESS.raw());
            svc.set_reg(1, handle);
        }
        Err(rc) => {
            svc.set_reg(0, rc.raw());
            svc.set_reg(1, 0);
        }
    }
}

// ---------------------------------------------------------------------------
// The table
// ---------------------------------------------------------------------------

macro_rules! svc_table {
    ($(($name:literal, $handler:expr),)*) => {
        &[$(SvcDef { name: $name, handler: $handler },)*]
    };
}

static SVC_TABLE: &[SvcDef] = svc_table![
    ("Unknown", None),                                               // 0x00
    ("ControlMemory", Some(wrap_control_memory as fn(&mut Svc<'_>))), // 0x01
    ("QueryMemory", Some(wrap_query_memory)),                        // 0x02
    ("ExitProcess", Some(wrap_exit_process)),                        // 0x03
    ("GetProcessAffinityMask", None),                                // 0x04
    ("SetProcessAffinityMask", None),                                // 0x05
    ("GetProcessIdealProcessor", None),                              // 0x06
    ("SetProcessIdealProcessor", None),                              // 0x07
    ("CreateThread", Some(wrap_create_thread)),                      // 0x08
    ("ExitThread", Some(wrap_exit_thread)),                          // 0x09
    ("SleepThread", Some(wrap_sleep_thread)),                        // 0x0A
    ("GetThreadPriority", Some(wrap_get_thread_priority)),           // 0x0B
    ("SetThreadPriority", Some(wrap_set_thread_priority)),           // 0x0C
    ("GetThreadAffinityMask", None),                                 // 0x0D
    ("SetThreadAffinityMask", None),                                 // 0x0E
    ("GetThreadIdealProcessor", None),                               // 0x0F
    ("SetThreadIdealProcessor", None),                               // 0x10
    ("GetCurrentProcessorNumber", None),                             // 0x11
    ("Run", None),                                                   // 0x12
    ("CreateMutex", Some(wrap_create_mutex)),                        // 0x13
    ("ReleaseMutex", Some(wrap_release_mutex)),                      // 0x14
    ("CreateSemaphore", Some(wrap_create_semaphore)),                // 0x15
    ("ReleaseSemaphore", Some(wrap_release_semaphore)),              // 0x16
    ("CreateEvent", Some(wrap_create_event)),                        // 0x17
    ("SignalEvent", Some(wrap_signal_event)),                        // 0x18
    ("ClearEvent", Some(wrap_clear_event)),                          // 0x19
    ("CreateTimer", Some(wrap_create_timer)),                        // 0x1A
    ("SetTimer", Some(wrap_set_timer)),                              // 0x1B
    ("CancelTimer", Some(wrap_cancel_timer)),                        // 0x1C
    ("ClearTimer", Some(wrap_clear_timer)),                          // 0x1D
    ("CreateMemoryBlock", Some(wrap_create_memory_block)),           // 0x1E
    ("MapMemoryBlock", Some(wrap_map_memory_block)),                 // 0x1F
    ("UnmapMemoryBlock", Some(wrap_unmap_memory_block)),             // 0x20
    ("CreateAddressArbiter", Some(wrap_create_address_arbiter)),     // 0x21
    ("ArbitrateAddress", Some(wrap_arbitrate_address)),              // 0x22
    ("CloseHandle", Some(wrap_close_handle)),                        // 0x23
    ("WaitSynchronization1", Some(wrap_wait_synchronization1)),      // 0x24
    ("WaitSynchronizationN", Some(wrap_wait_synchronization_n)),     // 0x25
    ("SignalAndWait", None),                                         // 0x26
    ("DuplicateHandle", Some(wrap_duplicate_handle)),                // 0x27
    ("GetSystemTick", Some(wrap_get_system_tick)),                   // 0x28
    ("GetHandleInfo", None),                                         // 0x29
    ("GetSystemInfo", Some(wrap_get_system_info)),                   // 0x2A
    ("GetProcessInfo", Some(wrap_get_process_info)),                 // 0x2B
    ("GetThreadInfo", None),                                         // 0x2C
    ("ConnectToPort", Some(wrap_connect_to_port)),                   // 0x2D
    ("SendSyncRequest1", None),                                      // 0x2E
    ("SendSyncRequest2", None),                                      // 0x2F
    ("SendSyncRequest3", None),                                      // 0x30
    ("SendSyncRequest4", None),                                      // 0x31
    ("SendSyncRequest", Some(wrap_send_sync_request)),               // 0x32
    ("OpenProcess", None),                                           // 0x33
    ("OpenThread", None),                                            // 0x34
    ("GetProcessId", Some(wrap_get_process_id)),                     // 0x35
    ("GetProcessIdOfThread", Some(wrap_get_process_id_of_thread)),   // 0x36
    ("GetThreadId", Some(wrap_get_thread_id)),                       // 0x37
    ("GetResourceLimit", Some(wrap_get_resource_limit)),             // 0x38
    ("GetResourceLimitLimitValues", Some(wrap_get_resource_limit_limit_values)), // 0x39
    ("GetResourceLimitCurrentValues", Some(wrap_get_resource_limit_current_values)), // 0x3A
    ("GetThreadContext", None),                                      // 0x3B
    ("Break", Some(wrap_break)),                                     // 0x3C
    ("OutputDebugString", Some(wrap_output_debug_string)),           // 0x3D
    ("ControlPerformanceCounter", None),                             // 0x3E
    ("Unknown", None),                                               // 0x3F
    ("Unknown", None),                                               // 0x40
    ("Unknown", None),                                               // 0x41
    ("Unknown", None),                                               // 0x42
    ("Unknown", None),                                               // 0x43
    ("Unknown", None),                                               // 0x44
    ("Unknown", None),                                               // 0x45
    ("Unknown", None),                                               // 0x46
    ("CreatePort", Some(wrap_create_port)),                          // 0x47
    ("CreateSessionToPort", Some(wrap_create_session_to_port)),      // 0x48
    ("CreateSession", Some(wrap_create_session)),                    // 0x49
    ("AcceptSession", Some(wrap_accept_session)),                    // 0x4A
    ("ReplyAndReceive1", None),                                      // 0x4B
    ("ReplyAndReceive2", None),                                      // 0x4C
    ("ReplyAndReceive3", None),                                      // 0x4D
    ("ReplyAndReceive4", None),                                      // 0x4E
    ("ReplyAndReceive", Some(wrap_reply_and_receive)),               // 0x4F
    ("BindInterrupt", None),                                         // 0x50
    ("UnbindInterrupt", None),                                       // 0x51
    ("InvalidateProcessDataCache", None),                            // 0x52
    ("StoreProcessDataCache", None),                                 // 0x53
    ("FlushProcessDataCache", None),                                 // 0x54
    ("StartInterProcessDma", None),                                  // 0x55
    ("StopDma", None),                                               // 0x56
    ("GetDmaState", None),                                           // 0x57
    ("RestartDma", None),                                            // 0x58
    ("SetGpuProt", None),                                            // 0x59
    ("SetWifiEnabled", None),                                        // 0x5A
    ("Unknown", None),                                               // 0x5B
    ("Unknown", None),                                               // 0x5C
    ("Unknown", None),                                               // 0x5D
    ("Unknown", None),                                               // 0x5E
    ("Unknown", None),                                               // 0x5F
    ("DebugActiveProcess", None),                                    // 0x60
    ("BreakDebugProcess", None),                                     // 0x61
    ("TerminateDebugProcess", None),                                 // 0x62
    ("GetProcessDebugEvent", None),                                  // 0x63
    ("ContinueDebugEvent", None),                                    // 0x64
    ("GetProcessList", None),                                        // 0x65
    ("GetThreadList", None),                                         // 0x66
    ("GetDebugThreadContext", None),                                 // 0x67
    ("SetDebugThreadContext", None),                                 // 0x68
    ("QueryDebugProcessMemory", None),                               // 0x69
    ("ReadProcessMemory", None),                                     // 0x6A
    ("WriteProcessMemory", None),                                    // 0x6B
    ("SetHardwareBreakPoint", None),                                 // 0x6C
    ("GetDebugThreadParam", None),                                   // 0x6D
    ("Unknown", None),                                               // 0x6E
    ("Unknown", None),                                               // 0x6F
    ("ControlProcessMemory", None),                                  // 0x70
    ("MapProcessMemory", None),                                      // 0x71
    ("UnmapProcessMemory", None),                                    // 0x72
    ("CreateCodeSet", None),                                         // 0x73
    ("RandomStub", None),                                            // 0x74
    ("CreateProcess", None),                                         // 0x75
    ("TerminateProcess", None),                                      // 0x76
    ("SetProcessResourceLimits", None),                              // 0x77
    ("CreateResourceLimit", None),                                   // 0x78
    ("SetResourceLimitValues", None),                                // 0x79
    ("AddCodeSegment", None),                                        // 0x7A
    ("Backdoor", None),                                              // 0x7B
    ("KernelSetState", None),                                        // 0x7C
    ("QueryProcessMemory", Some(wrap_query_process_memory)),         // 0x7D
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::make_header;
    use crate::kernel::test_support::{boot, check_invariants, spawn_thread};
    use crate::vm_manager::MemoryState;
    use rytra_common::{ns_to_cycles, HEAP_VADDR_END, PAGE_SIZE_U32};

    const SVC_CONTROL_MEMORY: u32 = 0x01;
    const SVC_QUERY_MEMORY: u32 = 0x02;
    const SVC_CREATE_THREAD: u32 = 0x08;
    const SVC_SLEEP_THREAD: u32 = 0x0A;
    const SVC_CREATE_EVENT: u32 = 0x17;
    const SVC_SIGNAL_EVENT: u32 = 0x18;
    const SVC_CLOSE_HANDLE: u32 = 0x23;
    const SVC_WAIT_SYNCHRONIZATION1: u32 = 0x24;
    const SVC_WAIT_SYNCHRONIZATION_N: u32 = 0x25;
    const SVC_DUPLICATE_HANDLE: u32 = 0x27;
    const SVC_GET_SYSTEM_TICK: u32 = 0x28;
    const SVC_CONNECT_TO_PORT: u32 = 0x2D;
    const SVC_SEND_SYNC_REQUEST: u32 = 0x32;
    const SVC_CREATE_SESSION: u32 = 0x49;
    const SVC_REPLY_AND_RECEIVE: u32 = 0x4F;

    fn exec(kernel: &mut KernelContext, cpu: &mut CpuState, number: u32) {
        call_svc(kernel, cpu, number);
    }

    fn create_event(kernel: &mut KernelContext, cpu: &mut CpuState, reset_type: u32) -> Handle {
        cpu.regs[1] = reset_type;
        exec(kernel, cpu, SVC_CREATE_EVENT);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
        cpu.regs[1]
    }

    fn wait1(kernel: &mut KernelContext, cpu: &mut CpuState, handle: Handle, ns: i64) -> u32 {
        cpu.regs[0] = handle;
        cpu.regs[2] = ns as u64 as u32;
        cpu.regs[3] = ((ns as u64) >> 32) as u32;
        exec(kernel, cpu, SVC_WAIT_SYNCHRONIZATION1);
        cpu.regs[0]
    }

    // -- Events through the guest ABI ---------------------------------------

    #[test]
    fn test_sticky_event_waits_succeed_until_cleared() {
        let (mut kernel, mut cpu, _process, _main) = boot();
        let handle = create_event(&mut kernel, &mut cpu, 1);

        cpu.regs[0] = handle;
        exec(&mut kernel, &mut cpu, SVC_SIGNAL_EVENT);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());

        assert_eq!(wait1(&mut kernel, &mut cpu, handle, 0), ResultCode::SUCCESS.raw());
        // Sticky events keep signalling.
        assert_eq!(wait1(&mut kernel, &mut cpu, handle, 0), ResultCode::SUCCESS.raw());
    }

    #[test]
    fn test_oneshot_event_times_out_after_consumption() {
        let (mut kernel, mut cpu, _process, _main) = boot();
        let handle = create_event(&mut kernel, &mut cpu, 0);

        cpu.regs[0] = handle;
        exec(&mut kernel, &mut cpu, SVC_SIGNAL_EVENT);

        assert_eq!(wait1(&mut kernel, &mut cpu, handle, 0), ResultCode::SUCCESS.raw());
        assert_eq!(wait1(&mut kernel, &mut cpu, handle, 0), error::TIMEOUT.raw());
    }

    // A thread waiting on a never-signalled event resumes with a timeout
    // result once the timing wheel passes the deadline.
    #[test]
    fn test_wait_synchronization_timeout() {
        let (mut kernel, mut cpu, _process, main) = boot();
        let handle = create_event(&mut kernel, &mut cpu, 0);

        assert_eq!(
            wait1(&mut kernel, &mut cpu, handle, 1_000_000),
            error::TIMEOUT.raw()
        );
        // The thread suspended and nothing else can run.
        assert_eq!(kernel.current_thread(), None);
        assert_eq!(kernel.thread_ref(main).status, ThreadStatus::WaitSynchAny);

        kernel.advance_ticks(&mut cpu, ns_to_cycles(1_000_000) + 1);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_eq!(cpu.regs[0], error::TIMEOUT.raw());
        check_invariants(&kernel);
    }

    #[test]
    fn test_wait_resumes_with_success_on_signal() {
        let (mut kernel, mut cpu, process, main) = boot();
        let handle = create_event(&mut kernel, &mut cpu, 0);
        let event = kernel.object_for_handle(process, handle).unwrap();

        assert_eq!(
            wait1(&mut kernel, &mut cpu, handle, -1),
            error::TIMEOUT.raw()
        );
        assert_eq!(kernel.thread_ref(main).status, ThreadStatus::WaitSynchAny);

        kernel.event_signal(event);
        kernel.reschedule(&mut cpu);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
    }

    #[test]
    fn test_sleep_thread_wakes_after_delay() {
        let (mut kernel, mut cpu, _process, main) = boot();
        cpu.regs[0] = 1_000_000u32;
        cpu.regs[1] = 0;
        exec(&mut kernel, &mut cpu, SVC_SLEEP_THREAD);
        assert_eq!(kernel.thread_ref(main).status, ThreadStatus::WaitSleep);
        assert_eq!(kernel.current_thread(), None);

        kernel.advance_ticks(&mut cpu, ns_to_cycles(1_000_000) + 1);
        assert_eq!(kernel.current_thread(), Some(main));
    }

    // -- WaitSynchronizationN boundaries ------------------------------------

    #[test]
    fn test_wait_n_negative_count() {
        let (mut kernel, mut cpu, _process, _main) = boot();
        cpu.regs[0] = 0;
        cpu.regs[1] = HEAP_VADDR;
        cpu.regs[2] = -1i32 as u32;
        cpu.regs[3] = 0;
        cpu.regs[4] = 0;
        exec(&mut kernel, &mut cpu, SVC_WAIT_SYNCHRONIZATION_N);
        assert_eq!(cpu.regs[0], error::OUT_OF_RANGE.raw());
    }

    #[test]
    fn test_wait_n_empty_with_zero_timeout() {
        let (mut kernel, mut cpu, _process, main) = boot();
        cpu.regs[0] = 0;
        cpu.regs[1] = HEAP_VADDR;
        cpu.regs[2] = 0;
        cpu.regs[3] = 0;
        cpu.regs[4] = 0;
        exec(&mut kernel, &mut cpu, SVC_WAIT_SYNCHRONIZATION_N);
        assert_eq!(cpu.regs[0], error::TIMEOUT.raw());
        // Nothing to wait for and no time to wait: still running.
        assert_eq!(kernel.current_thread(), Some(main));
    }

    #[test]
    fn test_wait_n_empty_without_timeout_blocks_forever() {
        let (mut kernel, mut cpu, _process, main) = boot();
        cpu.regs[0] = 0xFFFF_FFFF;
        cpu.regs[1] = HEAP_VADDR;
        cpu.regs[2] = 0;
        cpu.regs[3] = 0;
        cpu.regs[4] = 0xFFFF_FFFF;
        exec(&mut kernel, &mut cpu, SVC_WAIT_SYNCHRONIZATION_N);
        assert_eq!(kernel.thread_ref(main).status, ThreadStatus::WaitSynchAny);
        assert_eq!(kernel.current_thread(), None);

        // No wakeup is ever scheduled.
        kernel.advance_ticks(&mut cpu, ns_to_cycles(10_000_000_000));
        assert_eq!(kernel.current_thread(), None);
    }

    #[test]
    fn test_wait_n_any_reports_signalled_index() {
        let (mut kernel, mut cpu, process, main) = boot();
        let first = create_event(&mut kernel, &mut cpu, 0);
        let second = create_event(&mut kernel, &mut cpu, 0);
        let second_object = kernel.object_for_handle(process, second).unwrap();

        let handles = HEAP_VADDR + 0x200;
        kernel.guest_write_u32(process, handles, first).unwrap();
        kernel.guest_write_u32(process, handles + 4, second).unwrap();

        cpu.regs[0] = 0xFFFF_FFFF;
        cpu.regs[1] = handles;
        cpu.regs[2] = 2;
        cpu.regs[3] = 0;
        cpu.regs[4] = 0xFFFF_FFFF;
        exec(&mut kernel, &mut cpu, SVC_WAIT_SYNCHRONIZATION_N);
        assert_eq!(kernel.thread_ref(main).status, ThreadStatus::WaitSynchAny);

        kernel.event_signal(second_object);
        kernel.reschedule(&mut cpu);
        assert_eq!(kernel.current_thread(), Some(main));
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
        assert_eq!(cpu.regs[1], 1);
    }

    // -- ControlMemory ------------------------------------------------------

    #[test]
    fn test_control_memory_alignment_checks() {
        let (mut kernel, mut cpu, _process, _main) = boot();
        cpu.regs[0] = 3; // COMMIT
        cpu.regs[1] = HEAP_VADDR + 1;
        cpu.regs[2] = 0;
        cpu.regs[3] = PAGE_SIZE_U32;
        cpu.regs[4] = VMAPermission::READ_WRITE.bits();
        exec(&mut kernel, &mut cpu, SVC_CONTROL_MEMORY);
        assert_eq!(cpu.regs[0], error::MISALIGNED_ADDRESS.raw());

        cpu.regs[0] = 3; // COMMIT
        cpu.regs[1] = HEAP_VADDR + 0x10_0000;
        cpu.regs[3] = 0x123;
        exec(&mut kernel, &mut cpu, SVC_CONTROL_MEMORY);
        assert_eq!(cpu.regs[0], error::MISALIGNED_SIZE.raw());
    }

    #[test]
    fn test_commit_query_free_round_trip() {
        let (mut kernel, mut cpu, _process, _main) = boot();
        let target = HEAP_VADDR + 0x10_0000;

        cpu.regs[0] = 3; // COMMIT
        cpu.regs[1] = target;
        cpu.regs[2] = 0;
        cpu.regs[3] = PAGE_SIZE_U32 * 2;
        cpu.regs[4] = VMAPermission::READ_WRITE.bits();
        exec(&mut kernel, &mut cpu, SVC_CONTROL_MEMORY);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
        assert_eq!(cpu.regs[1], target);

        cpu.regs[2] = target;
        exec(&mut kernel, &mut cpu, SVC_QUERY_MEMORY);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
        assert_eq!(cpu.regs[1], target);
        assert_eq!(cpu.regs[2], PAGE_SIZE_U32 * 2);
        assert_eq!(cpu.regs[4], MemoryState::Private as u32);

        cpu.regs[0] = 1; // FREE
        cpu.regs[1] = target;
        cpu.regs[2] = 0;
        cpu.regs[3] = PAGE_SIZE_U32 * 2;
        cpu.regs[4] = 0;
        exec(&mut kernel, &mut cpu, SVC_CONTROL_MEMORY);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());

        cpu.regs[2] = target;
        exec(&mut kernel, &mut cpu, SVC_QUERY_MEMORY);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
        assert_eq!(cpu.regs[4], MemoryState::Free as u32);
    }

    // -- Thread creation ----------------------------------------------------

    #[test]
    fn test_create_thread_priority_bounds() {
        let (mut kernel, mut cpu, _process, _main) = boot();
        cpu.regs[0] = 64;
        cpu.regs[1] = rytra_common::PROCESS_IMAGE_VADDR;
        cpu.regs[2] = 0;
        cpu.regs[3] = HEAP_VADDR_END;
        cpu.regs[4] = 0;
        exec(&mut kernel, &mut cpu, SVC_CREATE_THREAD);
        assert_eq!(cpu.regs[0], error::OUT_OF_RANGE.raw());

        // Better than the resource limit allows.
        cpu.regs[0] = 10;
        cpu.regs[1] = rytra_common::PROCESS_IMAGE_VADDR;
        exec(&mut kernel, &mut cpu, SVC_CREATE_THREAD);
        assert_eq!(cpu.regs[0], error::NOT_AUTHORIZED.raw());

        cpu.regs[0] = 50;
        cpu.regs[1] = rytra_common::PROCESS_IMAGE_VADDR;
        cpu.regs[2] = 0;
        cpu.regs[3] = HEAP_VADDR_END;
        cpu.regs[4] = 0;
        exec(&mut kernel, &mut cpu, SVC_CREATE_THREAD);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
        assert_ne!(cpu.regs[1], 0);
    }

    // -- Handles ------------------------------------------------------------

    #[test]
    fn test_duplicate_survives_closing_the_original() {
        let (mut kernel, mut cpu, _process, _main) = boot();
        let handle = create_event(&mut kernel, &mut cpu, 1);

        cpu.regs[1] = handle;
        exec(&mut kernel, &mut cpu, SVC_DUPLICATE_HANDLE);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
        let duplicate = cpu.regs[1];
        assert_ne!(duplicate, handle);

        cpu.regs[0] = handle;
        exec(&mut kernel, &mut cpu, SVC_CLOSE_HANDLE);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());

        // The duplicate still signals the same live event.
        cpu.regs[0] = duplicate;
        exec(&mut kernel, &mut cpu, SVC_SIGNAL_EVENT);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
    }

    #[test]
    fn test_close_handle_twice_fails() {
        let (mut kernel, mut cpu, _process, _main) = boot();
        let handle = create_event(&mut kernel, &mut cpu, 0);
        cpu.regs[0] = handle;
        exec(&mut kernel, &mut cpu, SVC_CLOSE_HANDLE);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
        cpu.regs[0] = handle;
        exec(&mut kernel, &mut cpu, SVC_CLOSE_HANDLE);
        assert_eq!(cpu.regs[0], error::INVALID_HANDLE.raw());
    }

    // -- Ports --------------------------------------------------------------

    #[test]
    fn test_connect_to_port_name_rules() {
        let (mut kernel, mut cpu, process, _main) = boot();
        let name_addr = HEAP_VADDR + 0x300;

        kernel.guest_write_block(process, name_addr, b"unknown:\0").unwrap();
        cpu.regs[1] = name_addr;
        exec(&mut kernel, &mut cpu, SVC_CONNECT_TO_PORT);
        assert_eq!(cpu.regs[0], error::NOT_FOUND.raw());

        // Twelve characters: one too many.
        kernel
            .guest_write_block(process, name_addr, b"abcdefghijkl\0")
            .unwrap();
        cpu.regs[1] = name_addr;
        exec(&mut kernel, &mut cpu, SVC_CONNECT_TO_PORT);
        assert_eq!(cpu.regs[0], error::PORT_NAME_TOO_LONG.raw());

        let (_server_port, client_port) = kernel.create_port_pair(8, "srv:".into());
        kernel.register_named_port("srv:", client_port);
        kernel.guest_write_block(process, name_addr, b"srv:\0").unwrap();
        cpu.regs[1] = name_addr;
        exec(&mut kernel, &mut cpu, SVC_CONNECT_TO_PORT);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
        assert_ne!(cpu.regs[1], 0);
    }

    // -- Misc ---------------------------------------------------------------

    #[test]
    fn test_get_system_tick_advances_time() {
        let (mut kernel, mut cpu, _process, _main) = boot();
        exec(&mut kernel, &mut cpu, SVC_GET_SYSTEM_TICK);
        let first = cpu.regs[0] as u64 | ((cpu.regs[1] as u64) << 32);
        exec(&mut kernel, &mut cpu, SVC_GET_SYSTEM_TICK);
        let second = cpu.regs[0] as u64 | ((cpu.regs[1] as u64) << 32);
        assert_eq!(second, first + 150);
    }

    #[test]
    fn test_unimplemented_svc_returns_success_with_zeroed_outputs() {
        let (mut kernel, mut cpu, _process, _main) = boot();
        cpu.regs[1] = 0xDEAD_BEEF;
        cpu.regs[2] = 0xDEAD_BEEF;
        cpu.regs[3] = 0xDEAD_BEEF;
        exec(&mut kernel, &mut cpu, 0x12); // Run
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
        assert_eq!(cpu.regs[1], 0);
        assert_eq!(cpu.regs[2], 0);
        assert_eq!(cpu.regs[3], 0);
    }

    // -- IPC round trip (request and reply through two threads) -------------

    struct IpcFixture {
        kernel: KernelContext,
        cpu: CpuState,
        process: ObjectId,
        main: ObjectId,
        server_thread: ObjectId,
        server_handle: Handle,
        client_handle: Handle,
    }

    /// Set up a session pair plus a server thread parked in ReplyAndReceive.
    fn ipc_fixture() -> IpcFixture {
        let (mut kernel, mut cpu, process, main) = boot();

        exec(&mut kernel, &mut cpu, SVC_CREATE_SESSION);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
        let server_handle = cpu.regs[1];
        let client_handle = cpu.regs[2];

        let server_thread = spawn_thread(&mut kernel, process, 30);
        let handles_addr = HEAP_VADDR + 0x380;
        kernel
            .guest_write_u32(process, handles_addr, server_handle)
            .unwrap();

        // Put main to sleep so the server thread gets the core.
        cpu.regs[0] = 1_000_000u32;
        cpu.regs[1] = 0;
        exec(&mut kernel, &mut cpu, SVC_SLEEP_THREAD);
        assert_eq!(kernel.current_thread(), Some(server_thread));

        // Server: ReplyAndReceive with no reply, waiting on the session.
        cpu.regs[1] = handles_addr;
        cpu.regs[2] = 1;
        cpu.regs[3] = 0;
        exec(&mut kernel, &mut cpu, SVC_REPLY_AND_RECEIVE);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
        assert_eq!(
            kernel.thread_ref(server_thread).status,
            ThreadStatus::WaitSynchAny
        );

        // Wake the client back up.
        kernel.advance_ticks(&mut cpu, ns_to_cycles(1_000_000) + 1);
        assert_eq!(kernel.current_thread(), Some(main));

        IpcFixture {
            kernel,
            cpu,
            process,
            main,
            server_thread,
            server_handle,
            client_handle,
        }
    }

    #[test]
    fn test_ipc_round_trip() {
        let IpcFixture {
            mut kernel,
            mut cpu,
            process,
            main,
            server_thread,
            server_handle,
            client_handle,
        } = ipc_fixture();

        // Client request: cmd 0x0001 with one normal word.
        let client_cmd = kernel.thread_ref(main).command_buffer_address();
        kernel
            .guest_write_u32(process, client_cmd, make_header(0x0001, 1, 0))
            .unwrap();
        kernel.guest_write_u32(process, client_cmd + 4, 42).unwrap();

        cpu.regs[0] = client_handle;
        exec(&mut kernel, &mut cpu, SVC_SEND_SYNC_REQUEST);

        // The server resumed with the translated request in its TLS.
        assert_eq!(kernel.current_thread(), Some(server_thread));
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());
        assert_eq!(cpu.regs[1], 0); // index of the signalled session
        let server_cmd = kernel.thread_ref(server_thread).command_buffer_address();
        assert_eq!(
            kernel.guest_read_u32(process, server_cmd).unwrap(),
            make_header(0x0001, 1, 0)
        );
        assert_eq!(kernel.guest_read_u32(process, server_cmd + 4).unwrap(), 42);
        assert_eq!(kernel.thread_ref(main).status, ThreadStatus::WaitIpc);

        // Server reply: cmd 0x0001 with 42 * 42.
        kernel
            .guest_write_u32(process, server_cmd, make_header(0x0001, 1, 0))
            .unwrap();
        kernel.guest_write_u32(process, server_cmd + 4, 1764).unwrap();
        cpu.regs[1] = 0;
        cpu.regs[2] = 0;
        cpu.regs[3] = server_handle;
        exec(&mut kernel, &mut cpu, SVC_REPLY_AND_RECEIVE);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());

        // The client got the reply and is runnable again.
        assert_eq!(kernel.thread_ref(main).status, ThreadStatus::Ready);
        assert_eq!(
            kernel.guest_read_u32(process, client_cmd).unwrap(),
            make_header(0x0001, 1, 0)
        );
        assert_eq!(kernel.guest_read_u32(process, client_cmd + 4).unwrap(), 1764);
        assert_eq!(
            kernel.thread_ref(main).context.regs[0],
            ResultCode::SUCCESS.raw()
        );
        check_invariants(&kernel);
    }

    #[test]
    fn test_reply_and_receive_empty_without_reply() {
        let (mut kernel, mut cpu, _process, _main) = boot();
        cpu.regs[1] = HEAP_VADDR;
        cpu.regs[2] = 0;
        cpu.regs[3] = 0;
        exec(&mut kernel, &mut cpu, SVC_REPLY_AND_RECEIVE);
        // No reply and nothing to wait on: the placeholder result.
        assert_eq!(cpu.regs[0], 0xE7E3_FFFF);
        assert_eq!(cpu.regs[1], 0);
    }

    // Client hangs up while the server is mid-request; the server's reply
    // fails with the closed-by-remote error and so does the client's wait.
    #[test]
    fn test_session_closed_by_remote_during_handling() {
        let IpcFixture {
            mut kernel,
            mut cpu,
            process,
            main,
            server_thread,
            server_handle,
            client_handle,
        } = ipc_fixture();

        let client_cmd = kernel.thread_ref(main).command_buffer_address();
        kernel
            .guest_write_u32(process, client_cmd, make_header(0x0001, 0, 0))
            .unwrap();
        cpu.regs[0] = client_handle;
        exec(&mut kernel, &mut cpu, SVC_SEND_SYNC_REQUEST);
        assert_eq!(kernel.current_thread(), Some(server_thread));

        // The server (same process) closes the client half mid-handling.
        cpu.regs[0] = client_handle;
        exec(&mut kernel, &mut cpu, SVC_CLOSE_HANDLE);
        assert_eq!(cpu.regs[0], ResultCode::SUCCESS.raw());

        // The abandoned client already completed with the error.
        assert_eq!(
            kernel.thread_ref(main).context.regs[0],
            error::SESSION_CLOSED_BY_REMOTE.raw()
        );

        // And the server's reply has nobody to go to.
        let server_cmd = kernel.thread_ref(server_thread).command_buffer_address();
        kernel
            .guest_write_u32(process, server_cmd, make_header(0x0001, 0, 0))
            .unwrap();
        cpu.regs[1] = 0;
        cpu.regs[2] = 0;
        cpu.regs[3] = server_handle;
        exec(&mut kernel, &mut cpu, SVC_REPLY_AND_RECEIVE);
        assert_eq!(cpu.regs[0], error::SESSION_CLOSED_BY_REMOTE.raw());
    }
}
