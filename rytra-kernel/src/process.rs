// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use rytra_common::{
    error, ObjectId, ProcessId, ResultCode, VAddr, HEAP_VADDR, HEAP_VADDR_END, LINEAR_HEAP_VADDR,
    LINEAR_HEAP_VADDR_END, TLS_SLOTS_PER_PAGE,
};

use crate::handle_table::HandleTable;
use crate::memory::{MemoryRegionInfo, MemoryRegionName};
use crate::vm_manager::{MemoryState, VMAPermission, VMManager, VmaBacking};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited,
}

/// HLE kernel process.
pub struct Process {
    pub process_id: ProcessId,
    pub name: String,
    pub status: ProcessStatus,
    pub handle_table: HandleTable,
    pub vm_manager: VMManager,
    /// This process's resource limit (owning arena reference).
    pub resource_limit: ObjectId,
    /// One 8-bit occupancy bitset per mapped TLS page.
    pub tls_slots: Vec<u8>,
    /// FCRAM region process memory is allocated from.
    pub memory_region: MemoryRegionName,
    pub ideal_processor: i32,
    /// Bytes of FCRAM committed to this process.
    pub memory_used: u32,
}

impl Process {
    pub fn new(
        process_id: ProcessId,
        name: String,
        memory_region: MemoryRegionName,
        resource_limit: ObjectId,
    ) -> Self {
        Self {
            process_id,
            name,
            status: ProcessStatus::Running,
            handle_table: HandleTable::new(),
            vm_manager: VMManager::new(),
            resource_limit,
            tls_slots: Vec::new(),
            memory_region,
            ideal_processor: 0,
            memory_used: 0,
        }
    }

    /// Find a free TLS slot: (page, slot, needs_new_page).
    pub fn find_free_tls_slot(&self) -> (usize, usize, bool) {
        for (page, &bits) in self.tls_slots.iter().enumerate() {
            if bits != 0xFF {
                for slot in 0..TLS_SLOTS_PER_PAGE {
                    if bits & (1 << slot) == 0 {
                        return (page, slot, false);
                    }
                }
            }
        }
        (0, 0, true)
    }

    /// Mark a TLS slot used.
    pub fn set_tls_slot(&mut self, page: usize, slot: usize) {
        self.tls_slots[page] |= 1 << slot;
    }

    /// Mark a TLS slot free again.
    pub fn clear_tls_slot(&mut self, page: usize, slot: usize) {
        self.tls_slots[page] &= !(1 << slot);
    }

    // -- Heap ---------------------------------------------------------------

    /// Commit `size` bytes of heap at `target` (ControlMemory COMMIT).
    pub fn heap_allocate(
        &mut self,
        region: &mut MemoryRegionInfo,
        target: VAddr,
        size: u32,
        perms: VMAPermission,
    ) -> Result<VAddr, ResultCode> {
        if target < HEAP_VADDR
            || target.checked_add(size).is_none()
            || target + size > HEAP_VADDR_END
        {
            return Err(error::INVALID_ADDRESS);
        }
        let offset = region.allocate(size as usize).ok_or(error::OUT_OF_MEMORY)?;

        if let Err(e) = self
            .vm_manager
            .map_backing_memory(target, offset, size, MemoryState::Private)
        {
            log::debug!("heap commit of {size:#X} at {target:#010X} failed: {e}");
            region.free(offset, size as usize);
            return Err(error::INVALID_ADDRESS);
        }
        // map_backing_memory leaves the range RW; apply the requested perms.
        let _ = self.vm_manager.reprotect_range(target, size, perms);
        self.memory_used += size;
        Ok(target)
    }

    /// Free previously committed heap (ControlMemory FREE).
    pub fn heap_free(
        &mut self,
        region: &mut MemoryRegionInfo,
        target: VAddr,
        size: u32,
    ) -> ResultCode {
        if target < HEAP_VADDR
            || target.checked_add(size).is_none()
            || target + size > HEAP_VADDR_END
        {
            return error::INVALID_ADDRESS;
        }
        match self.collect_backing(target, size, MemoryState::Private) {
            Ok(blocks) => {
                let _ = self.vm_manager.unmap_range(target, size);
                for (offset, len) in blocks {
                    region.free(offset, len);
                }
                self.memory_used -= size;
                ResultCode::SUCCESS
            }
            Err(rc) => rc,
        }
    }

    // -- Linear heap --------------------------------------------------------

    /// Commit physically contiguous memory in the linear heap. The mapping
    /// address mirrors the FCRAM offset so guest physical lookups stay
    /// trivial.
    pub fn linear_allocate(
        &mut self,
        region: &mut MemoryRegionInfo,
        target: VAddr,
        size: u32,
        perms: VMAPermission,
    ) -> Result<VAddr, ResultCode> {
        let offset = if target == 0 {
            region.allocate(size as usize).ok_or(error::OUT_OF_MEMORY)?
        } else {
            if target < LINEAR_HEAP_VADDR
                || target.checked_add(size).is_none()
                || target + size > LINEAR_HEAP_VADDR_END
            {
                return Err(error::INVALID_ADDRESS);
            }
            let wanted = (target - LINEAR_HEAP_VADDR) as usize;
            if !region.allocate_at(wanted, size as usize) {
                return Err(error::OUT_OF_MEMORY);
            }
            wanted
        };

        let vaddr = LINEAR_HEAP_VADDR + offset as u32;
        if let Err(e) =
            self.vm_manager
                .map_backing_memory(vaddr, offset, size, MemoryState::Continuous)
        {
            log::debug!("linear commit of {size:#X} failed: {e}");
            region.free(offset, size as usize);
            return Err(error::INVALID_ADDRESS);
        }
        let _ = self.vm_manager.reprotect_range(vaddr, size, perms);
        self.memory_used += size;
        Ok(vaddr)
    }

    /// Free linear heap memory.
    pub fn linear_free(
        &mut self,
        region: &mut MemoryRegionInfo,
        target: VAddr,
        size: u32,
    ) -> ResultCode {
        if target < LINEAR_HEAP_VADDR
            || target.checked_add(size).is_none()
            || target + size > LINEAR_HEAP_VADDR_END
        {
            return error::INVALID_ADDRESS;
        }
        match self.collect_backing(target, size, MemoryState::Continuous) {
            Ok(blocks) => {
                let _ = self.vm_manager.unmap_range(target, size);
                for (offset, len) in blocks {
                    region.free(offset, len);
                }
                self.memory_used -= size;
                ResultCode::SUCCESS
            }
            Err(rc) => rc,
        }
    }

    // -- Mirror mappings (ControlMemory MAP/UNMAP) --------------------------

    /// Mirror `[source, source + size)` at `target`. The source keeps its
    /// backing and becomes Aliased; the target aliases the same FCRAM.
    pub fn map(
        &mut self,
        target: VAddr,
        source: VAddr,
        size: u32,
        perms: VMAPermission,
    ) -> ResultCode {
        let blocks = match self.collect_backing(source, size, MemoryState::Private) {
            Ok(blocks) => blocks,
            Err(rc) => return rc,
        };

        let mut dst = target;
        for (offset, len) in &blocks {
            if let Err(e) =
                self.vm_manager
                    .map_backing_memory(dst, *offset, *len as u32, MemoryState::Alias)
            {
                log::error!("mirror mapping failed: {e}");
                // Unwind the partially created mirror.
                if dst > target {
                    let _ = self.vm_manager.unmap_range(target, dst - target);
                }
                return error::INVALID_ADDRESS;
            }
            dst += *len as u32;
        }
        let _ = self.vm_manager.reprotect_range(target, size, perms);
        let _ = self.vm_manager.change_state_range(
            source,
            size,
            MemoryState::Aliased,
            VMAPermission::READ_WRITE,
        );
        ResultCode::SUCCESS
    }

    /// Remove a mirror created by `map`.
    pub fn unmap(
        &mut self,
        target: VAddr,
        source: VAddr,
        size: u32,
        _perms: VMAPermission,
    ) -> ResultCode {
        if self.collect_backing(target, size, MemoryState::Alias).is_err() {
            return error::INVALID_ADDRESS;
        }
        let _ = self.vm_manager.unmap_range(target, size);
        let _ = self.vm_manager.change_state_range(
            source,
            size,
            MemoryState::Private,
            VMAPermission::READ_WRITE,
        );
        ResultCode::SUCCESS
    }

    /// Collect the FCRAM blocks backing `[target, target + size)`, verifying
    /// every byte is mapped with the expected state.
    fn collect_backing(
        &self,
        target: VAddr,
        size: u32,
        expected_state: MemoryState,
    ) -> Result<Vec<(usize, usize)>, ResultCode> {
        let mut blocks: Vec<(usize, usize)> = Vec::new();
        let mut addr = target;
        let end = target + size;
        while addr < end {
            let vma = self.vm_manager.find_vma(addr).ok_or(error::INVALID_ADDRESS)?;
            if vma.meminfo_state != expected_state {
                return Err(error::INVALID_ADDRESS);
            }
            let VmaBacking::Backing { offset } = vma.backing else {
                return Err(error::INVALID_ADDRESS);
            };
            let chunk_start = offset + (addr - vma.base) as usize;
            let chunk_len = (vma.end().min(end) - addr) as usize;
            // Coalesce physically adjacent chunks.
            match blocks.last_mut() {
                Some((last_off, last_len)) if *last_off + *last_len == chunk_start => {
                    *last_len += chunk_len;
                }
                _ => blocks.push((chunk_start, chunk_len)),
            }
            addr = vma.end().min(end);
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rytra_common::PAGE_SIZE_U32;

    fn make_process() -> (Process, MemoryRegionInfo) {
        let process = Process::new(1, "test".into(), MemoryRegionName::Application, 0);
        let region = MemoryRegionInfo::new(0, 0x0100_0000);
        (process, region)
    }

    #[test]
    fn test_heap_allocate_and_free() {
        let (mut process, mut region) = make_process();
        let addr = process
            .heap_allocate(
                &mut region,
                HEAP_VADDR,
                PAGE_SIZE_U32 * 4,
                VMAPermission::READ_WRITE,
            )
            .unwrap();
        assert_eq!(addr, HEAP_VADDR);
        assert_eq!(process.memory_used, PAGE_SIZE_U32 * 4);
        assert!(process.vm_manager.backing_offset(HEAP_VADDR).is_some());

        assert!(process
            .heap_free(&mut region, HEAP_VADDR, PAGE_SIZE_U32 * 4)
            .is_success());
        assert_eq!(process.memory_used, 0);
        assert_eq!(region.used, 0);
        assert!(process.vm_manager.backing_offset(HEAP_VADDR).is_none());
    }

    #[test]
    fn test_heap_allocate_outside_heap_rejected() {
        let (mut process, mut region) = make_process();
        let result = process.heap_allocate(
            &mut region,
            0x0010_0000,
            PAGE_SIZE_U32,
            VMAPermission::READ_WRITE,
        );
        assert_eq!(result, Err(error::INVALID_ADDRESS));
    }

    #[test]
    fn test_heap_free_wrong_state_rejected() {
        let (mut process, mut region) = make_process();
        let rc = process.heap_free(&mut region, HEAP_VADDR, PAGE_SIZE_U32);
        assert_eq!(rc, error::INVALID_ADDRESS);
    }

    #[test]
    fn test_linear_allocate_mirrors_offset() {
        let (mut process, mut region) = make_process();
        let vaddr = process
            .linear_allocate(&mut region, 0, PAGE_SIZE_U32 * 2, VMAPermission::READ_WRITE)
            .unwrap();
        let offset = process.vm_manager.backing_offset(vaddr).unwrap();
        assert_eq!(vaddr, LINEAR_HEAP_VADDR + offset as u32);
    }

    #[test]
    fn test_mirror_map_unmap() {
        let (mut process, mut region) = make_process();
        process
            .heap_allocate(
                &mut region,
                HEAP_VADDR,
                PAGE_SIZE_U32 * 2,
                VMAPermission::READ_WRITE,
            )
            .unwrap();

        let mirror = 0x0030_0000;
        assert!(process
            .map(mirror, HEAP_VADDR, PAGE_SIZE_U32 * 2, VMAPermission::READ_WRITE)
            .is_success());
        // Mirror and source share backing.
        assert_eq!(
            process.vm_manager.backing_offset(mirror),
            process.vm_manager.backing_offset(HEAP_VADDR)
        );
        let source_vma = process.vm_manager.find_vma(HEAP_VADDR).unwrap();
        assert_eq!(source_vma.meminfo_state, MemoryState::Aliased);

        assert!(process
            .unmap(mirror, HEAP_VADDR, PAGE_SIZE_U32 * 2, VMAPermission::READ_WRITE)
            .is_success());
        assert!(process.vm_manager.backing_offset(mirror).is_none());
        let source_vma = process.vm_manager.find_vma(HEAP_VADDR).unwrap();
        assert_eq!(source_vma.meminfo_state, MemoryState::Private);
    }

    #[test]
    fn test_tls_slot_tracking() {
        let (mut process, _) = make_process();
        assert_eq!(process.find_free_tls_slot(), (0, 0, true));
        process.tls_slots.push(0);
        assert_eq!(process.find_free_tls_slot(), (0, 0, false));
        process.set_tls_slot(0, 0);
        assert_eq!(process.find_free_tls_slot(), (0, 1, false));
        for slot in 1..TLS_SLOTS_PER_PAGE {
            process.set_tls_slot(0, slot);
        }
        assert_eq!(process.find_free_tls_slot(), (0, 0, true));
        process.clear_tls_slot(0, 3);
        assert_eq!(process.find_free_tls_slot(), (0, 3, false));
    }
}
