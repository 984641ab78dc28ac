// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use rytra_common::{error, ObjectId, ResultCode, VAddr, SHARED_MEMORY_VADDR, SHARED_MEMORY_VADDR_END};

use crate::kernel::KernelContext;
use crate::memory::MemoryRegionName;
use crate::vm_manager::{MemoryState, VMAPermission};

/// A block of FCRAM that can be mapped into multiple processes.
pub struct SharedMemory {
    /// Process that created the block, if any.
    pub owner_process: Option<ObjectId>,
    pub size: u32,
    /// Permissions for the owner process.
    pub permissions: VMAPermission,
    /// Permissions for every other process.
    pub other_permissions: VMAPermission,
    /// FCRAM offset of the backing block.
    pub backing_offset: usize,
    /// Region the backing was allocated from, for returning it on finalize.
    pub backing_region: MemoryRegionName,
    /// Whether the block allocated its backing (as opposed to borrowing the
    /// creator's committed pages).
    pub owns_backing: bool,
    pub name: String,
}

impl KernelContext {
    /// Create a shared memory block backed by freshly allocated FCRAM.
    pub(crate) fn create_shared_memory(
        &mut self,
        owner_process: Option<ObjectId>,
        size: u32,
        permissions: VMAPermission,
        other_permissions: VMAPermission,
        region: MemoryRegionName,
        name: String,
    ) -> Result<ObjectId, ResultCode> {
        let backing_offset = self
            .memory
            .region(region)
            .allocate(size as usize)
            .ok_or(error::OUT_OF_MEMORY)?;
        let block = SharedMemory {
            owner_process,
            size,
            permissions,
            other_permissions,
            backing_offset,
            backing_region: region,
            owns_backing: true,
            name,
        };
        Ok(self.arena.insert(crate::object::KernelObject::SharedMemory(block)))
    }

    /// Create a shared memory block over memory the owner already committed
    /// at `address`. The backing stays owned by the creator's heap.
    pub(crate) fn create_shared_memory_at(
        &mut self,
        owner_process: ObjectId,
        address: VAddr,
        size: u32,
        permissions: VMAPermission,
        other_permissions: VMAPermission,
        name: String,
    ) -> Result<ObjectId, ResultCode> {
        let region = self.process_ref(owner_process).memory_region;
        let vm = &self.process_ref(owner_process).vm_manager;
        let Some(backing_offset) = vm.backing_offset(address) else {
            return Err(error::INVALID_ADDRESS);
        };
        // The whole range must be physically contiguous so one block can
        // describe it.
        for page in (0..size).step_by(rytra_common::PAGE_SIZE) {
            match vm.backing_offset(address + page) {
                Some(offset) if offset == backing_offset + page as usize => {}
                _ => {
                    log::error!(
                        "shared memory over non-contiguous range {address:#010X}+{size:#X}"
                    );
                    return Err(error::INVALID_ADDRESS);
                }
            }
        }
        let block = SharedMemory {
            owner_process: Some(owner_process),
            size,
            permissions,
            other_permissions,
            backing_offset,
            backing_region: region,
            owns_backing: false,
            name,
        };
        Ok(self.arena.insert(crate::object::KernelObject::SharedMemory(block)))
    }

    /// Map a shared memory block into a process's address space.
    pub(crate) fn shared_memory_map(
        &mut self,
        shmem_id: ObjectId,
        process_id: ObjectId,
        address: VAddr,
        permissions: VMAPermission,
    ) -> ResultCode {
        let (size, backing_offset, allowed) = {
            let block = self.shared_memory_ref(shmem_id);
            let allowed = if block.owner_process == Some(process_id) {
                block.permissions
            } else {
                block.other_permissions
            };
            (block.size, block.backing_offset, allowed)
        };

        let effective = if permissions == VMAPermission::DONT_CARE {
            allowed
        } else {
            permissions
        };
        // Requesting access the block does not grant is rejected.
        if effective.bits() & !allowed.bits() & !VMAPermission::DONT_CARE.bits() != 0 {
            return error::INVALID_COMBINATION;
        }

        let target = if address == 0 {
            let Some(found) = self.process_ref(process_id).vm_manager.find_free_region(
                SHARED_MEMORY_VADDR,
                SHARED_MEMORY_VADDR_END,
                size,
            ) else {
                return error::OUT_OF_MEMORY;
            };
            found
        } else {
            if address < SHARED_MEMORY_VADDR || address + size > SHARED_MEMORY_VADDR_END {
                return error::INVALID_ADDRESS;
            }
            address
        };

        let process = self.process_mut(process_id);
        if let Err(e) =
            process
                .vm_manager
                .map_backing_memory(target, backing_offset, size, MemoryState::Shared)
        {
            log::error!("failed to map shared memory block: {e}");
            return error::INVALID_ADDRESS;
        }
        if let Err(e) = process.vm_manager.reprotect_range(target, size, effective) {
            log::error!("failed to set shared memory permissions: {e}");
            return error::INVALID_ADDRESS;
        }
        process.memory_used += size;
        ResultCode::SUCCESS
    }

    /// Unmap a shared memory block from a process.
    pub(crate) fn shared_memory_unmap(
        &mut self,
        shmem_id: ObjectId,
        process_id: ObjectId,
        address: VAddr,
    ) -> ResultCode {
        let size = self.shared_memory_ref(shmem_id).size;
        let process = self.process_mut(process_id);
        match process.vm_manager.unmap_range(address, size) {
            Ok(()) => {
                process.memory_used -= size;
                ResultCode::SUCCESS
            }
            Err(e) => {
                log::error!("failed to unmap shared memory block: {e}");
                error::INVALID_ADDRESS
            }
        }
    }
}
