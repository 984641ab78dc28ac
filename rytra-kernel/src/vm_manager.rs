// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-process virtual memory map.
//!
//! The map is a set of non-overlapping VMAs keyed by base address whose union
//! always covers the whole user address space; unmapped space is explicit
//! `Free` VMAs. Mapping carves a free VMA, unmapping rewrites the range back
//! to `Free` and merges with free neighbours.

use std::collections::BTreeMap;

use bitflags::bitflags;

use rytra_common::{is_page_aligned, VAddr, USER_SPACE_VADDR_END};

use crate::memory::{MemoryError, MemoryResult};

bitflags! {
    /// Permissions attached to a VMA, matching the guest ABI encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VMAPermission: u32 {
        const READ    = 1;
        const WRITE   = 2;
        const EXECUTE = 4;

        const READ_WRITE         = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE       = Self::READ.bits() | Self::EXECUTE.bits();
        const WRITE_EXECUTE      = Self::WRITE.bits() | Self::EXECUTE.bits();
        const READ_WRITE_EXECUTE =
            Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
        const DONT_CARE = 0x1000_0000;
        const NONE = 0;
    }
}

impl std::fmt::Display for VMAPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = if self.contains(Self::READ) { 'R' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'W' } else { '-' };
        let x = if self.contains(Self::EXECUTE) { 'X' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

/// Memory state reported by QueryMemory, matching the guest ABI values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MemoryState {
    Free = 0,
    Reserved = 1,
    Io = 2,
    Static = 3,
    Code = 4,
    Private = 5,
    Shared = 6,
    Continuous = 7,
    Aliased = 8,
    Alias = 9,
    AliasCode = 10,
    Locked = 11,
}

/// What backs a VMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaBacking {
    /// Not mapped.
    Free,
    /// Backed by FCRAM at the given byte offset.
    Backing { offset: usize },
}

/// A contiguous region of the process address space with uniform attributes.
#[derive(Debug, Clone)]
pub struct VirtualMemoryArea {
    pub base: VAddr,
    pub size: u32,
    pub permissions: VMAPermission,
    pub meminfo_state: MemoryState,
    pub backing: VmaBacking,
}

impl VirtualMemoryArea {
    #[inline]
    pub fn end(&self) -> VAddr {
        self.base + self.size
    }

    /// Whether `other` can be appended to `self` as one VMA.
    fn can_merge_with(&self, other: &VirtualMemoryArea) -> bool {
        if self.end() != other.base
            || self.permissions != other.permissions
            || self.meminfo_state != other.meminfo_state
        {
            return false;
        }
        match (self.backing, other.backing) {
            (VmaBacking::Free, VmaBacking::Free) => true,
            (VmaBacking::Backing { offset: a }, VmaBacking::Backing { offset: b }) => {
                a + self.size as usize == b
            }
            _ => false,
        }
    }
}

/// Result of a QueryMemory coalescing lookup.
#[derive(Debug, Clone, Copy)]
pub struct MemoryInfo {
    pub base: VAddr,
    pub size: u32,
    pub permissions: VMAPermission,
    pub state: MemoryState,
}

pub struct VMManager {
    /// VMAs keyed by base address. Invariant: non-overlapping and covering
    /// `[0, USER_SPACE_VADDR_END)` completely.
    vma_map: BTreeMap<VAddr, VirtualMemoryArea>,
}

impl VMManager {
    pub fn new() -> Self {
        let mut vma_map = BTreeMap::new();
        vma_map.insert(
            0,
            VirtualMemoryArea {
                base: 0,
                size: USER_SPACE_VADDR_END,
                permissions: VMAPermission::NONE,
                meminfo_state: MemoryState::Free,
                backing: VmaBacking::Free,
            },
        );
        Self { vma_map }
    }

    /// Find the VMA containing `addr`.
    pub fn find_vma(&self, addr: VAddr) -> Option<&VirtualMemoryArea> {
        if addr >= USER_SPACE_VADDR_END {
            return None;
        }
        self.vma_map
            .range(..=addr)
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| addr < vma.end())
    }

    /// Map FCRAM-backed memory into the address space. The target range must
    /// be entirely free.
    pub fn map_backing_memory(
        &mut self,
        base: VAddr,
        fcram_offset: usize,
        size: u32,
        state: MemoryState,
    ) -> MemoryResult<()> {
        self.validate_range(base, size)?;
        self.carve_vma(base, size)?;

        let vma = self.vma_map.get_mut(&base).unwrap();
        vma.permissions = VMAPermission::READ_WRITE;
        vma.meminfo_state = state;
        vma.backing = VmaBacking::Backing {
            offset: fcram_offset,
        };

        log::debug!(
            "map [{:#010X}..{:#010X}) state={:?} backing={:#X}",
            base,
            base + size,
            state,
            fcram_offset,
        );
        self.merge_surrounding(base, size);
        Ok(())
    }

    /// Unmap a range, rewriting it to a single free VMA.
    pub fn unmap_range(&mut self, base: VAddr, size: u32) -> MemoryResult<()> {
        self.validate_range(base, size)?;
        self.split_at(base);
        self.split_at(base + size);

        let keys: Vec<VAddr> = self
            .vma_map
            .range(base..base + size)
            .map(|(&k, _)| k)
            .collect();
        for key in keys {
            self.vma_map.remove(&key);
        }
        self.vma_map.insert(
            base,
            VirtualMemoryArea {
                base,
                size,
                permissions: VMAPermission::NONE,
                meminfo_state: MemoryState::Free,
                backing: VmaBacking::Free,
            },
        );

        log::debug!("unmap [{:#010X}..{:#010X})", base, base + size);
        self.merge_surrounding(base, size);
        Ok(())
    }

    /// Rewrite the permissions of a mapped range, splitting at the edges.
    pub fn reprotect_range(
        &mut self,
        base: VAddr,
        size: u32,
        new_perms: VMAPermission,
    ) -> MemoryResult<()> {
        self.validate_range(base, size)?;
        // The whole range must be mapped before any attribute is touched.
        let mut addr = base;
        while addr < base + size {
            let vma = self.find_vma(addr).ok_or(MemoryError::NotMapped(addr))?;
            if vma.backing == VmaBacking::Free {
                return Err(MemoryError::NotMapped(addr));
            }
            addr = vma.end();
        }

        self.split_at(base);
        self.split_at(base + size);
        for (_, vma) in self.vma_map.range_mut(base..base + size) {
            vma.permissions = new_perms;
        }
        self.merge_surrounding(base, size);
        Ok(())
    }

    /// Rewrite the meminfo state (and permissions) of a mapped range.
    pub fn change_state_range(
        &mut self,
        base: VAddr,
        size: u32,
        state: MemoryState,
        perms: VMAPermission,
    ) -> MemoryResult<()> {
        self.validate_range(base, size)?;
        self.split_at(base);
        self.split_at(base + size);
        for (_, vma) in self.vma_map.range_mut(base..base + size) {
            vma.meminfo_state = state;
            vma.permissions = perms;
        }
        self.merge_surrounding(base, size);
        Ok(())
    }

    /// Resolve a guest address to its FCRAM offset.
    pub fn backing_offset(&self, addr: VAddr) -> Option<usize> {
        let vma = self.find_vma(addr)?;
        match vma.backing {
            VmaBacking::Backing { offset } => Some(offset + (addr - vma.base) as usize),
            VmaBacking::Free => None,
        }
    }

    /// QueryMemory: widest contiguous range around `addr` sharing the same
    /// permissions and state, regardless of physical backing.
    pub fn query(&self, addr: VAddr) -> Option<MemoryInfo> {
        let vma = self.find_vma(addr)?;
        let permissions = vma.permissions;
        let state = vma.meminfo_state;

        let mut lower = vma.base;
        for (_, v) in self.vma_map.range(..vma.base).rev() {
            if v.permissions != permissions || v.meminfo_state != state {
                break;
            }
            lower = v.base;
        }
        let mut upper = vma.end();
        for (_, v) in self.vma_map.range(vma.end()..) {
            if v.permissions != permissions || v.meminfo_state != state {
                break;
            }
            upper = v.end();
        }

        Some(MemoryInfo {
            base: lower,
            size: upper - lower,
            permissions,
            state,
        })
    }

    /// Find a free gap of `size` bytes inside `[start, end)`.
    pub fn find_free_region(&self, start: VAddr, end: VAddr, size: u32) -> Option<VAddr> {
        for (_, vma) in self.vma_map.range(..end) {
            if vma.backing != VmaBacking::Free {
                continue;
            }
            let gap_start = vma.base.max(start);
            let gap_end = vma.end().min(end);
            if gap_end > gap_start && gap_end - gap_start >= size {
                return Some(gap_start);
            }
        }
        None
    }

    /// Iterate all VMAs. Used by the invariant checks in tests.
    pub fn vmas(&self) -> impl Iterator<Item = &VirtualMemoryArea> {
        self.vma_map.values()
    }

    /// Dump the layout at debug level.
    pub fn log_layout(&self) {
        for vma in self.vma_map.values() {
            log::debug!(
                "{:#010X} - {:#010X} size {:#010X} perm {} state {:?}",
                vma.base,
                vma.end(),
                vma.size,
                vma.permissions,
                vma.meminfo_state,
            );
        }
    }

    // -- Internal helpers ---------------------------------------------------

    fn validate_range(&self, base: VAddr, size: u32) -> MemoryResult<()> {
        if !is_page_aligned(base) {
            return Err(MemoryError::MisalignedAddress(base));
        }
        if size == 0 || !is_page_aligned(size) {
            return Err(MemoryError::MisalignedSize(size));
        }
        let end = base.checked_add(size).ok_or(MemoryError::OutOfRange(base, size))?;
        if end > USER_SPACE_VADDR_END {
            return Err(MemoryError::OutOfRange(base, size));
        }
        Ok(())
    }

    /// Carve `[base, base + size)` out of a single free VMA, leaving a VMA
    /// with base address exactly `base` and size exactly `size`.
    fn carve_vma(&mut self, base: VAddr, size: u32) -> MemoryResult<()> {
        let vma = self
            .find_vma(base)
            .ok_or(MemoryError::OutOfRange(base, size))?;
        if vma.backing != VmaBacking::Free || vma.end() < base + size {
            return Err(MemoryError::RegionNotFree(base, base + size));
        }
        self.split_at(base);
        self.split_at(base + size);
        Ok(())
    }

    /// Ensure a VMA boundary exists at `addr`.
    fn split_at(&mut self, addr: VAddr) {
        if addr == 0 || addr >= USER_SPACE_VADDR_END {
            return;
        }
        let (&base, vma) = self
            .vma_map
            .range(..=addr)
            .next_back()
            .expect("vma map must cover the address space");
        if base == addr {
            return;
        }
        let mut right = vma.clone();
        let left_size = addr - base;
        let right_size = vma.size - left_size;

        self.vma_map.get_mut(&base).unwrap().size = left_size;

        right.base = addr;
        right.size = right_size;
        if let VmaBacking::Backing { offset } = right.backing {
            right.backing = VmaBacking::Backing {
                offset: offset + left_size as usize,
            };
        }
        self.vma_map.insert(addr, right);
    }

    /// Merge mergeable VMAs in and immediately around `[base, base + size)`.
    fn merge_surrounding(&mut self, base: VAddr, size: u32) {
        let start = self
            .vma_map
            .range(..base)
            .next_back()
            .map(|(&k, _)| k)
            .unwrap_or(base);
        let mut cursor = start;
        loop {
            let Some(vma) = self.vma_map.get(&cursor) else {
                break;
            };
            let next_base = vma.end();
            if next_base >= USER_SPACE_VADDR_END {
                break;
            }
            let Some(next) = self.vma_map.get(&next_base) else {
                break;
            };
            if vma.can_merge_with(next) {
                let grow = next.size;
                self.vma_map.remove(&next_base);
                self.vma_map.get_mut(&cursor).unwrap().size += grow;
                // Stay on the merged VMA; it may merge again.
                continue;
            }
            if next_base > base + size {
                break;
            }
            cursor = next_base;
        }
    }
}

impl Default for VMManager {
    fn default() -> Self {
        Self::new()
    }
}
