// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-process handle table.
//!
//! Handles pack a 15-bit generation with a slot index; stale handles to a
//! reused slot fail the generation check instead of aliasing the new object.
//! The table stores arena object ids only; the reference counting that keeps
//! objects alive is driven by [`crate::kernel::KernelContext`], which pairs
//! every `create`/`close` with a retain/release on the arena.

use rytra_common::error;
use rytra_common::{Handle, ObjectId, ResultCode};

/// Maximum number of handles per process.
const MAX_HANDLE_COUNT: usize = 4096;

#[inline]
fn handle_slot(handle: Handle) -> usize {
    (handle >> 15) as usize
}

#[inline]
fn handle_generation(handle: Handle) -> u16 {
    (handle & 0x7FFF) as u16
}

pub struct HandleTable {
    /// Object id per slot, `None` when free.
    objects: Vec<Option<ObjectId>>,
    /// Generation of the live handle in each slot. For free slots this field
    /// doubles as the next-free-slot link.
    generations: Vec<u16>,
    next_generation: u16,
    /// Head of the free-slot list; `MAX_HANDLE_COUNT` when the table is full.
    next_free_slot: usize,
}

impl HandleTable {
    pub fn new() -> Self {
        let mut generations = vec![0u16; MAX_HANDLE_COUNT];
        for (slot, generation) in generations.iter_mut().enumerate() {
            *generation = (slot + 1) as u16;
        }
        Self {
            objects: vec![None; MAX_HANDLE_COUNT],
            generations,
            next_generation: 1,
            next_free_slot: 0,
        }
    }

    /// Allocate a handle for an object id. The caller is responsible for the
    /// matching arena retain.
    pub fn create(&mut self, object: ObjectId) -> Result<Handle, ResultCode> {
        let slot = self.next_free_slot;
        if slot >= MAX_HANDLE_COUNT {
            return Err(error::OUT_OF_HANDLES);
        }
        self.next_free_slot = self.generations[slot] as usize;

        let generation = self.next_generation;
        self.next_generation += 1;
        // The generation zero handle is the invalid handle, skip over it.
        if self.next_generation >= (1 << 15) {
            self.next_generation = 1;
        }

        self.generations[slot] = generation;
        self.objects[slot] = Some(object);
        Ok(generation as Handle | ((slot as Handle) << 15))
    }

    /// Whether the handle refers to a live slot of matching generation.
    pub fn is_valid(&self, handle: Handle) -> bool {
        let slot = handle_slot(handle);
        slot < MAX_HANDLE_COUNT
            && self.objects[slot].is_some()
            && self.generations[slot] == handle_generation(handle)
    }

    /// Resolve a handle to its object id.
    pub fn get(&self, handle: Handle) -> Option<ObjectId> {
        if !self.is_valid(handle) {
            return None;
        }
        self.objects[handle_slot(handle)]
    }

    /// Free a handle, returning the object id it referenced so the caller can
    /// release the arena reference.
    pub fn close(&mut self, handle: Handle) -> Result<ObjectId, ResultCode> {
        if !self.is_valid(handle) {
            return Err(error::INVALID_HANDLE);
        }
        let slot = handle_slot(handle);
        let object = self.objects[slot].take().unwrap();
        self.generations[slot] = self.next_free_slot as u16;
        self.next_free_slot = slot;
        Ok(object)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.objects.iter().filter(|o| o.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.iter().all(|o| o.is_none())
    }

    /// Free slots remaining. IPC translation pre-flights handle creation
    /// against this so a full table aborts a translation atomically.
    pub fn free_slot_count(&self) -> usize {
        MAX_HANDLE_COUNT - self.len()
    }

    /// Iterate over all live (handle, object) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, ObjectId)> + '_ {
        self.objects
            .iter()
            .enumerate()
            .filter_map(move |(slot, object)| {
                object.map(|id| {
                    (
                        self.generations[slot] as Handle | ((slot as Handle) << 15),
                        id,
                    )
                })
            })
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
