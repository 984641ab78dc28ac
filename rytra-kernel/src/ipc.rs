// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! IPC command-buffer translation.
//!
//! The guest builds a header plus descriptor-tagged words at TLS+0x80. When a
//! request or reply crosses a session, every descriptor is rewritten for the
//! peer: handles are re-created in the destination table, process ids are
//! filled in, static buffers are copied into the slots the receiver declared,
//! and mapped buffers get a fresh mapping in the receiver's IPC region.
//! Translation is atomic: all fallible work happens (or is validated) before
//! the first destination-visible effect, and buffer mappings roll back on a
//! late failure.

use bitflags::bitflags;

use rytra_common::{
    align_down, error, Handle, ObjectId, ResultCode, VAddr, IPC_MAPPING_VADDR,
    IPC_MAPPING_VADDR_END, PAGE_MASK, PAGE_SIZE, PAGE_SIZE_U32,
};

use crate::kernel::KernelContext;
use crate::memory::MemoryRegionName;
use crate::vm_manager::{MemoryState, VMAPermission};

/// Length of the command buffer region in words (0x100 bytes).
pub const COMMAND_BUFFER_LENGTH: usize = 0x40;

/// IPC command header: `[cmd_id:16 | pad:4 | normal:6 | translate:6]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header(pub u32);

impl Header {
    pub fn command_id(self) -> u32 {
        self.0 >> 16
    }

    pub fn normal_params(self) -> usize {
        ((self.0 >> 6) & 0x3F) as usize
    }

    pub fn translate_params(self) -> usize {
        (self.0 & 0x3F) as usize
    }
}

/// Build a command header word.
pub const fn make_header(command_id: u16, normal_params: u32, translate_params: u32) -> u32 {
    ((command_id as u32) << 16) | ((normal_params & 0x3F) << 6) | (translate_params & 0x3F)
}

bitflags! {
    /// Receiver-side access to a mapped buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappedBufferPermissions: u32 {
        const R = 1;
        const W = 2;
        const RW = Self::R.bits() | Self::W.bits();
    }
}

/// Kinds of translate descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorType {
    CopyHandle,
    MoveHandle,
    CallingPid,
    StaticBuffer,
    PxiBuffer,
    MappedBuffer,
}

/// Decode a translate descriptor. The buffer checks must run before the
/// handle checks; a write-mapped buffer shares its low nibble with a
/// read-only PXI descriptor and resolves as mapped.
pub fn descriptor_type(descriptor: u32) -> DescriptorType {
    if descriptor & 0xF == 0x2 {
        DescriptorType::StaticBuffer
    } else if descriptor & 0xF == 0x4 {
        DescriptorType::PxiBuffer
    } else if descriptor & 0x8 != 0 {
        DescriptorType::MappedBuffer
    } else {
        match descriptor & 0x30 {
            0x10 => DescriptorType::MoveHandle,
            0x20 => DescriptorType::CallingPid,
            _ => DescriptorType::CopyHandle,
        }
    }
}

pub const fn copy_handles_desc(count: u32) -> u32 {
    (count - 1) << 26
}

pub const fn move_handles_desc(count: u32) -> u32 {
    0x10 | ((count - 1) << 26)
}

pub const fn calling_pid_desc() -> u32 {
    0x20
}

pub const fn static_buffer_desc(size: u32, buffer_id: u32) -> u32 {
    0x2 | ((buffer_id & 0xF) << 10) | (size << 14)
}

pub const fn mapped_buffer_desc(size: u32, perms: MappedBufferPermissions) -> u32 {
    0x8 | (perms.bits() << 1) | (size << 4)
}

fn handle_count_from_desc(descriptor: u32) -> usize {
    ((descriptor >> 26) + 1) as usize
}

/// Book-keeping for a buffer mapped into a server for one request.
pub struct MappedBufferContext {
    pub permissions: MappedBufferPermissions,
    pub size: u32,
    /// Where the buffer lives in the requesting client.
    pub source_address: VAddr,
    /// Address handed to the server (page offset included).
    pub target_address: VAddr,
    /// Base-region backing holding the copy.
    pub backing_offset: usize,
    pub num_pages: usize,
}

struct PendingHandle {
    word_index: usize,
    object: Option<ObjectId>,
    /// Move descriptors close the source handle after the transfer.
    close_in_src: Option<Handle>,
}

struct PendingWrite {
    address: VAddr,
    data: Vec<u8>,
}

struct PendingMapping {
    word_index: usize,
    source_address: VAddr,
    size: u32,
    permissions: MappedBufferPermissions,
    data: Vec<u8>,
    page_offset: u32,
    num_pages: usize,
}

struct PendingUnmapping {
    word_index: usize,
    context_index: usize,
}

impl KernelContext {
    /// Pull the next request of a server session into `thread`'s command
    /// buffer. Runs when ReplyAndReceive (or a wait) acquires the session.
    pub(crate) fn receive_ipc_request(
        &mut self,
        server_session: ObjectId,
        thread_id: ObjectId,
    ) -> ResultCode {
        let session_id = self.server_session_ref(server_session).session;
        if self.session_ref(session_id).client.is_none() {
            return error::SESSION_CLOSED_BY_REMOTE;
        }
        let Some(client_thread) = self.server_session_ref(server_session).currently_handling
        else {
            return error::SESSION_CLOSED_BY_REMOTE;
        };

        match self.translate_command_buffer(client_thread, thread_id, server_session, false) {
            Ok(()) => ResultCode::SUCCESS,
            Err(rc) => {
                // Hand the translation error straight back to the client.
                self.set_wait_synchronization_result(client_thread, rc);
                self.resume_thread_from_wait(client_thread);
                self.server_session_mut(server_session).currently_handling = None;
                // TODO: re-queue this thread to wait on its original handle
                // set instead of reporting the error to the server as well.
                log::error!("receive-side IPC translation failed: {rc}");
                rc
            }
        }
    }

    /// Translate the command buffer of `src_thread` into `dst_thread`'s.
    /// `reply` selects the server-to-client direction, which also unwinds
    /// the request's mapped buffers.
    pub(crate) fn translate_command_buffer(
        &mut self,
        src_thread: ObjectId,
        dst_thread: ObjectId,
        server_session: ObjectId,
        reply: bool,
    ) -> Result<(), ResultCode> {
        let src_process = self.thread_ref(src_thread).owner_process;
        let dst_process = self.thread_ref(dst_thread).owner_process;
        let src_address = self.thread_ref(src_thread).command_buffer_address();
        let dst_address = self.thread_ref(dst_thread).command_buffer_address();

        let header = Header(
            self.guest_read_u32(src_process, src_address)
                .map_err(|_| error::INVALID_ADDRESS)?,
        );
        let untranslated = 1 + header.normal_params();
        let command_size = untranslated + header.translate_params();
        if command_size > COMMAND_BUFFER_LENGTH {
            return Err(error::INVALID_COMBINATION);
        }

        let mut cmd_buff = vec![0u32; command_size];
        for (i, word) in cmd_buff.iter_mut().enumerate() {
            *word = self
                .guest_read_u32(src_process, src_address + (i * 4) as u32)
                .map_err(|_| error::INVALID_ADDRESS)?;
        }

        // Pass 1: resolve and validate everything without touching the
        // destination.
        let mut pending_handles: Vec<PendingHandle> = Vec::new();
        let mut pending_writes: Vec<PendingWrite> = Vec::new();
        let mut pending_mappings: Vec<PendingMapping> = Vec::new();
        let mut pending_unmappings: Vec<PendingUnmapping> = Vec::new();

        let mut i = untranslated;
        while i < command_size {
            let descriptor = cmd_buff[i];
            i += 1;
            match descriptor_type(descriptor) {
                DescriptorType::CopyHandle | DescriptorType::MoveHandle => {
                    let is_move = descriptor_type(descriptor) == DescriptorType::MoveHandle;
                    for _ in 0..handle_count_from_desc(descriptor) {
                        if i >= command_size {
                            return Err(error::INVALID_COMBINATION);
                        }
                        let handle = cmd_buff[i];
                        let object = if handle == 0 {
                            None
                        } else {
                            // Stale handles translate to 0 in the target
                            // process rather than failing the request.
                            self.object_for_handle(src_process, handle)
                        };
                        pending_handles.push(PendingHandle {
                            word_index: i,
                            object,
                            close_in_src: (is_move && object.is_some()).then_some(handle),
                        });
                        i += 1;
                    }
                }
                DescriptorType::CallingPid => {
                    if i >= command_size {
                        return Err(error::INVALID_COMBINATION);
                    }
                    cmd_buff[i] = self.process_ref(src_process).process_id;
                    i += 1;
                }
                DescriptorType::StaticBuffer => {
                    if i >= command_size {
                        return Err(error::INVALID_COMBINATION);
                    }
                    let source_buffer = cmd_buff[i];
                    let size = descriptor >> 14;
                    let buffer_id = (descriptor >> 10) & 0xF;

                    // The receiver declares its static buffers right after
                    // the command buffer region.
                    let decl_address =
                        dst_address + ((COMMAND_BUFFER_LENGTH as u32 + 2 * buffer_id) * 4);
                    let decl_desc = self
                        .guest_read_u32(dst_process, decl_address)
                        .map_err(|_| error::INVALID_ADDRESS)?;
                    let target_address = self
                        .guest_read_u32(dst_process, decl_address + 4)
                        .map_err(|_| error::INVALID_ADDRESS)?;
                    let declared_size = decl_desc >> 14;
                    if declared_size < size {
                        log::error!(
                            "static buffer {buffer_id} too small: {declared_size:#X} < {size:#X}"
                        );
                        return Err(error::INVALID_COMBINATION);
                    }

                    let mut data = vec![0u8; size as usize];
                    self.guest_read_block(src_process, source_buffer, &mut data)
                        .map_err(|_| error::INVALID_ADDRESS)?;
                    if !self.guest_range_mapped(dst_process, target_address, size) {
                        return Err(error::INVALID_ADDRESS);
                    }
                    pending_writes.push(PendingWrite {
                        address: target_address,
                        data,
                    });
                    cmd_buff[i] = target_address;
                    i += 1;
                }
                DescriptorType::PxiBuffer => {
                    if i >= command_size {
                        return Err(error::INVALID_COMBINATION);
                    }
                    // PXI buffers address hardware FIFOs, not the peer
                    // process; pass the descriptor pair through untouched.
                    log::warn!("PXI buffer descriptor passed through untranslated");
                    i += 1;
                }
                DescriptorType::MappedBuffer => {
                    if i >= command_size {
                        return Err(error::INVALID_COMBINATION);
                    }
                    let buffer_address = cmd_buff[i];
                    let size = descriptor >> 4;
                    let permissions = MappedBufferPermissions::from_bits_truncate(
                        (descriptor >> 1) & 0x3,
                    );

                    if reply {
                        let contexts = &self.server_session_ref(server_session).mapped_buffer_context;
                        let Some(context_index) = contexts.iter().position(|c| {
                            c.target_address == buffer_address && c.size == size
                        }) else {
                            log::error!(
                                "reply references unknown mapped buffer {buffer_address:#010X}"
                            );
                            return Err(error::INVALID_ADDRESS);
                        };
                        let context = &contexts[context_index];
                        if context.permissions.contains(MappedBufferPermissions::W)
                            && !self.guest_range_mapped(
                                dst_process,
                                context.source_address,
                                size,
                            )
                        {
                            return Err(error::INVALID_ADDRESS);
                        }
                        pending_unmappings.push(PendingUnmapping {
                            word_index: i,
                            context_index,
                        });
                    } else {
                        if size == 0 {
                            cmd_buff[i] = 0;
                            i += 1;
                            continue;
                        }
                        let page_start = align_down(buffer_address, PAGE_SIZE_U32);
                        let page_offset = buffer_address - page_start;
                        let num_pages =
                            ((page_offset + size + PAGE_MASK) / PAGE_SIZE_U32) as usize;

                        let mut data = vec![0u8; size as usize];
                        self.guest_read_block(src_process, buffer_address, &mut data)
                            .map_err(|_| error::INVALID_ADDRESS)?;
                        pending_mappings.push(PendingMapping {
                            word_index: i,
                            source_address: buffer_address,
                            size,
                            permissions,
                            data,
                            page_offset,
                            num_pages,
                        });
                    }
                    i += 1;
                }
            }
        }

        // Destination handle slots are checked up front so the handle pass
        // cannot fail halfway.
        let needed_handles = pending_handles.iter().filter(|p| p.object.is_some()).count();
        if self
            .process_ref(dst_process)
            .handle_table
            .free_slot_count()
            < needed_handles
        {
            return Err(error::OUT_OF_HANDLES);
        }

        // Pass 2: apply. Mapped-buffer allocation is the one remaining
        // fallible step; it rolls back its own partial work.
        self.apply_mappings(
            dst_process,
            server_session,
            &pending_mappings,
            &mut cmd_buff,
        )?;

        for unmapping in &pending_unmappings {
            self.apply_unmapping(src_process, dst_process, server_session, unmapping, &mut cmd_buff);
        }
        // Drop consumed contexts, highest index first.
        let mut consumed: Vec<usize> =
            pending_unmappings.iter().map(|u| u.context_index).collect();
        consumed.sort_unstable_by(|a, b| b.cmp(a));
        for index in consumed {
            let context = self
                .server_session_mut(server_session)
                .mapped_buffer_context
                .remove(index);
            self.memory
                .region(MemoryRegionName::Base)
                .free(context.backing_offset, context.num_pages * PAGE_SIZE);
        }

        for pending in &pending_handles {
            match pending.object {
                None => cmd_buff[pending.word_index] = 0,
                Some(object) => {
                    // Create before closing the source so a moved object
                    // cannot die in between.
                    let handle = self
                        .create_handle(dst_process, object)
                        .unwrap_or_else(|_| unreachable!("handle slots were pre-checked"));
                    if let Some(src_handle) = pending.close_in_src {
                        let _ = self.close_handle(src_process, src_handle);
                    }
                    cmd_buff[pending.word_index] = handle;
                }
            }
        }

        for write in &pending_writes {
            if let Err(e) = self.guest_write_block(dst_process, write.address, &write.data) {
                log::error!("static buffer write failed after validation: {e}");
            }
        }

        for (index, word) in cmd_buff.iter().enumerate() {
            self.guest_write_u32(dst_process, dst_address + (index * 4) as u32, *word)
                .map_err(|_| error::INVALID_ADDRESS)?;
        }
        Ok(())
    }

    /// Map the request's buffers into the destination's IPC region, leaving
    /// a free guard page on both sides of every mapping.
    fn apply_mappings(
        &mut self,
        dst_process: ObjectId,
        server_session: ObjectId,
        mappings: &[PendingMapping],
        cmd_buff: &mut [u32],
    ) -> Result<(), ResultCode> {
        let mut applied: Vec<(VAddr, usize, usize)> = Vec::new();

        for mapping in mappings {
            let map_size = (mapping.num_pages * PAGE_SIZE) as u32;
            let result = (|| -> Result<(VAddr, usize), ResultCode> {
                let backing = self
                    .memory
                    .region(MemoryRegionName::Base)
                    .allocate(mapping.num_pages * PAGE_SIZE)
                    .ok_or(error::OUT_OF_MEMORY)?;
                let span = map_size + 2 * PAGE_SIZE_U32;
                let Some(found) = self.process_ref(dst_process).vm_manager.find_free_region(
                    IPC_MAPPING_VADDR,
                    IPC_MAPPING_VADDR_END,
                    span,
                ) else {
                    self.memory
                        .region(MemoryRegionName::Base)
                        .free(backing, mapping.num_pages * PAGE_SIZE);
                    return Err(error::OUT_OF_MEMORY);
                };
                let target_page = found + PAGE_SIZE_U32;

                let offset = mapping.page_offset as usize;
                self.memory.fcram_mut()[backing + offset..backing + offset + mapping.data.len()]
                    .copy_from_slice(&mapping.data);

                if self
                    .process_mut(dst_process)
                    .vm_manager
                    .map_backing_memory(target_page, backing, map_size, MemoryState::Shared)
                    .is_err()
                {
                    self.memory
                        .region(MemoryRegionName::Base)
                        .free(backing, mapping.num_pages * PAGE_SIZE);
                    return Err(error::OUT_OF_MEMORY);
                }
                let perms = match mapping.permissions {
                    p if p == MappedBufferPermissions::R => VMAPermission::READ,
                    p if p == MappedBufferPermissions::W => VMAPermission::WRITE,
                    _ => VMAPermission::READ_WRITE,
                };
                let _ = self
                    .process_mut(dst_process)
                    .vm_manager
                    .reprotect_range(target_page, map_size, perms);
                Ok((target_page, backing))
            })();

            match result {
                Ok((target_page, backing)) => {
                    let target_address = target_page + mapping.page_offset;
                    cmd_buff[mapping.word_index] = target_address;
                    self.server_session_mut(server_session)
                        .mapped_buffer_context
                        .push(MappedBufferContext {
                            permissions: mapping.permissions,
                            size: mapping.size,
                            source_address: mapping.source_address,
                            target_address,
                            backing_offset: backing,
                            num_pages: mapping.num_pages,
                        });
                    applied.push((target_page, backing, mapping.num_pages));
                }
                Err(rc) => {
                    // Unwind every mapping this translation already created.
                    for (target_page, backing, num_pages) in applied {
                        let _ = self
                            .process_mut(dst_process)
                            .vm_manager
                            .unmap_range(target_page, (num_pages * PAGE_SIZE) as u32);
                        self.memory
                            .region(MemoryRegionName::Base)
                            .free(backing, num_pages * PAGE_SIZE);
                        let session = self.server_session_mut(server_session);
                        session.mapped_buffer_context.pop();
                    }
                    return Err(rc);
                }
            }
        }
        Ok(())
    }

    /// Reply-side unwinding of one mapped buffer: copy written data back to
    /// the client and drop the server-side mapping.
    fn apply_unmapping(
        &mut self,
        src_process: ObjectId,
        dst_process: ObjectId,
        server_session: ObjectId,
        unmapping: &PendingUnmapping,
        cmd_buff: &mut [u32],
    ) {
        let (permissions, size, source_address, target_address, backing_offset, num_pages) = {
            let context =
                &self.server_session_ref(server_session).mapped_buffer_context[unmapping.context_index];
            (
                context.permissions,
                context.size,
                context.source_address,
                context.target_address,
                context.backing_offset,
                context.num_pages,
            )
        };

        if permissions.contains(MappedBufferPermissions::W) {
            let page_offset = (target_address & PAGE_MASK) as usize;
            let data = self.memory.fcram()
                [backing_offset + page_offset..backing_offset + page_offset + size as usize]
                .to_vec();
            if let Err(e) = self.guest_write_block(dst_process, source_address, &data) {
                log::error!("mapped buffer copy-back failed: {e}");
            }
        }

        let page_start = align_down(target_address, PAGE_SIZE_U32);
        let _ = self
            .process_mut(src_process)
            .vm_manager
            .unmap_range(page_start, (num_pages * PAGE_SIZE) as u32);
        cmd_buff[unmapping.word_index] = 0;
    }

    /// Whether `[addr, addr + size)` is fully mapped in the process.
    fn guest_range_mapped(&self, process_id: ObjectId, addr: VAddr, size: u32) -> bool {
        let vm = &self.process_ref(process_id).vm_manager;
        let mut current = align_down(addr, PAGE_SIZE_U32);
        let end = addr.saturating_add(size);
        while current < end {
            if vm.backing_offset(current).is_none() {
                return false;
            }
            match current.checked_add(PAGE_SIZE_U32) {
                Some(next) => current = next,
                None => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fields() {
        let word = make_header(0x0001, 2, 3);
        let header = Header(word);
        assert_eq!(header.command_id(), 1);
        assert_eq!(header.normal_params(), 2);
        assert_eq!(header.translate_params(), 3);
    }

    #[test]
    fn test_descriptor_decode() {
        assert_eq!(descriptor_type(copy_handles_desc(1)), DescriptorType::CopyHandle);
        assert_eq!(descriptor_type(move_handles_desc(2)), DescriptorType::MoveHandle);
        assert_eq!(descriptor_type(calling_pid_desc()), DescriptorType::CallingPid);
        assert_eq!(
            descriptor_type(static_buffer_desc(0x100, 3)),
            DescriptorType::StaticBuffer
        );
        assert_eq!(
            descriptor_type(mapped_buffer_desc(0x1000, MappedBufferPermissions::RW)),
            DescriptorType::MappedBuffer
        );
    }

    #[test]
    fn test_handle_count() {
        assert_eq!(handle_count_from_desc(copy_handles_desc(1)), 1);
        assert_eq!(handle_count_from_desc(copy_handles_desc(4)), 4);
        assert_eq!(handle_count_from_desc(move_handles_desc(2)), 2);
    }

    #[test]
    fn test_static_buffer_desc_fields() {
        let desc = static_buffer_desc(0x40, 5);
        assert_eq!(desc >> 14, 0x40);
        assert_eq!((desc >> 10) & 0xF, 5);
    }

    // -- Whole-buffer translation -------------------------------------------

    use crate::event::ResetType;
    use crate::kernel::test_support::{boot, spawn_thread};
    use crate::kernel::KernelContext;
    use rytra_common::{Handle, ObjectId, HEAP_VADDR, IPC_MAPPING_VADDR, IPC_MAPPING_VADDR_END};

    struct TranslationFixture {
        kernel: KernelContext,
        process: ObjectId,
        client: ObjectId,
        server: ObjectId,
        server_session: ObjectId,
        client_cmd: u32,
        server_cmd: u32,
    }

    fn translation_fixture() -> TranslationFixture {
        let (mut kernel, _cpu, process, client) = boot();
        let server = spawn_thread(&mut kernel, process, 50);
        let (server_session, _client_session) = kernel.create_session_pair(None, "s".into());
        let client_cmd = kernel.thread_ref(client).command_buffer_address();
        let server_cmd = kernel.thread_ref(server).command_buffer_address();
        TranslationFixture {
            kernel,
            process,
            client,
            server,
            server_session,
            client_cmd,
            server_cmd,
        }
    }

    fn write_request(fixture: &mut TranslationFixture, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            fixture
                .kernel
                .guest_write_u32(fixture.process, fixture.client_cmd + (i * 4) as u32, *word)
                .unwrap();
        }
    }

    fn translated_word(fixture: &TranslationFixture, index: usize) -> u32 {
        fixture
            .kernel
            .guest_read_u32(fixture.process, fixture.server_cmd + (index * 4) as u32)
            .unwrap()
    }

    #[test]
    fn test_copy_handle_recreated_in_destination() {
        let mut fixture = translation_fixture();
        let event = fixture.kernel.create_event(ResetType::OneShot, "ev".into());
        let handle: Handle = fixture
            .kernel
            .create_handle_consuming(fixture.process, event)
            .unwrap();

        write_request(&mut fixture, &[make_header(1, 0, 2), copy_handles_desc(1), handle]);
        fixture
            .kernel
            .translate_command_buffer(fixture.client, fixture.server, fixture.server_session, false)
            .unwrap();

        let translated = translated_word(&fixture, 2);
        assert_ne!(translated, handle);
        assert_eq!(
            fixture.kernel.object_for_handle(fixture.process, translated),
            Some(event)
        );
        // A copy leaves the source handle alive.
        assert_eq!(
            fixture.kernel.object_for_handle(fixture.process, handle),
            Some(event)
        );
    }

    #[test]
    fn test_move_handle_closes_source() {
        let mut fixture = translation_fixture();
        let event = fixture.kernel.create_event(ResetType::OneShot, "ev".into());
        let handle = fixture
            .kernel
            .create_handle_consuming(fixture.process, event)
            .unwrap();

        write_request(&mut fixture, &[make_header(1, 0, 2), move_handles_desc(1), handle]);
        fixture
            .kernel
            .translate_command_buffer(fixture.client, fixture.server, fixture.server_session, false)
            .unwrap();

        let translated = translated_word(&fixture, 2);
        assert_eq!(
            fixture.kernel.object_for_handle(fixture.process, translated),
            Some(event)
        );
        assert_eq!(
            fixture.kernel.object_for_handle(fixture.process, handle),
            None
        );
    }

    #[test]
    fn test_stale_handle_translates_to_zero() {
        let mut fixture = translation_fixture();
        write_request(
            &mut fixture,
            &[make_header(1, 0, 2), copy_handles_desc(1), 0xDEAD_0000],
        );
        fixture
            .kernel
            .translate_command_buffer(fixture.client, fixture.server, fixture.server_session, false)
            .unwrap();
        assert_eq!(translated_word(&fixture, 2), 0);
    }

    #[test]
    fn test_calling_pid_filled_in() {
        let mut fixture = translation_fixture();
        write_request(&mut fixture, &[make_header(1, 0, 2), calling_pid_desc(), 0]);
        fixture
            .kernel
            .translate_command_buffer(fixture.client, fixture.server, fixture.server_session, false)
            .unwrap();
        let pid = fixture.kernel.process_ref(fixture.process).process_id;
        assert_eq!(translated_word(&fixture, 2), pid);
    }

    #[test]
    fn test_static_buffer_copied_into_declared_slot() {
        let mut fixture = translation_fixture();
        let source = HEAP_VADDR + 0x400;
        let target = HEAP_VADDR + 0x800;
        let payload = b"hello static buffers";

        fixture
            .kernel
            .guest_write_block(fixture.process, source, payload)
            .unwrap();
        // The receiver declares where static buffer 3 lands.
        let decl = fixture.server_cmd + (COMMAND_BUFFER_LENGTH as u32 + 2 * 3) * 4;
        fixture
            .kernel
            .guest_write_u32(fixture.process, decl, static_buffer_desc(0x100, 3))
            .unwrap();
        fixture
            .kernel
            .guest_write_u32(fixture.process, decl + 4, target)
            .unwrap();

        write_request(
            &mut fixture,
            &[
                make_header(1, 0, 2),
                static_buffer_desc(payload.len() as u32, 3),
                source,
            ],
        );
        fixture
            .kernel
            .translate_command_buffer(fixture.client, fixture.server, fixture.server_session, false)
            .unwrap();

        assert_eq!(translated_word(&fixture, 2), target);
        let mut copied = vec![0u8; payload.len()];
        fixture
            .kernel
            .guest_read_block(fixture.process, target, &mut copied)
            .unwrap();
        assert_eq!(&copied, payload);
    }

    #[test]
    fn test_static_buffer_too_small_aborts_translation() {
        let mut fixture = translation_fixture();
        let decl = fixture.server_cmd + (COMMAND_BUFFER_LENGTH as u32) * 4;
        fixture
            .kernel
            .guest_write_u32(fixture.process, decl, static_buffer_desc(0x10, 0))
            .unwrap();
        fixture
            .kernel
            .guest_write_u32(fixture.process, decl + 4, HEAP_VADDR + 0x800)
            .unwrap();

        write_request(
            &mut fixture,
            &[make_header(1, 0, 2), static_buffer_desc(0x20, 0), HEAP_VADDR],
        );
        let result = fixture.kernel.translate_command_buffer(
            fixture.client,
            fixture.server,
            fixture.server_session,
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_mapped_buffer_round_trip() {
        let mut fixture = translation_fixture();
        let buffer = HEAP_VADDR + 0xC40;
        let payload = b"request payload!";
        fixture
            .kernel
            .guest_write_block(fixture.process, buffer, payload)
            .unwrap();

        write_request(
            &mut fixture,
            &[
                make_header(1, 0, 2),
                mapped_buffer_desc(payload.len() as u32, MappedBufferPermissions::RW),
                buffer,
            ],
        );
        fixture
            .kernel
            .translate_command_buffer(fixture.client, fixture.server, fixture.server_session, false)
            .unwrap();

        // The server sees the data at a fresh mapping in its IPC region,
        // page offset preserved.
        let mapped = translated_word(&fixture, 2);
        assert!((IPC_MAPPING_VADDR..IPC_MAPPING_VADDR_END).contains(&mapped));
        assert_eq!(mapped & 0xFFF, buffer & 0xFFF);
        let mut seen = vec![0u8; payload.len()];
        fixture
            .kernel
            .guest_read_block(fixture.process, mapped, &mut seen)
            .unwrap();
        assert_eq!(&seen, payload);
        assert_eq!(
            fixture
                .kernel
                .server_session_ref(fixture.server_session)
                .mapped_buffer_context
                .len(),
            1
        );

        // The server rewrites the buffer and replies with the same
        // descriptor; the edit lands back in the client's buffer and the
        // mapping is gone.
        fixture
            .kernel
            .guest_write_block(fixture.process, mapped, b"reply! payload??")
            .unwrap();
        let reply = [
            make_header(1, 0, 2),
            mapped_buffer_desc(payload.len() as u32, MappedBufferPermissions::RW),
            mapped,
        ];
        for (i, word) in reply.iter().enumerate() {
            fixture
                .kernel
                .guest_write_u32(fixture.process, fixture.server_cmd + (i * 4) as u32, *word)
                .unwrap();
        }
        fixture
            .kernel
            .translate_command_buffer(fixture.server, fixture.client, fixture.server_session, true)
            .unwrap();

        let mut result = vec![0u8; payload.len()];
        fixture
            .kernel
            .guest_read_block(fixture.process, buffer, &mut result)
            .unwrap();
        assert_eq!(&result, b"reply! payload??");
        assert!(fixture
            .kernel
            .server_session_ref(fixture.server_session)
            .mapped_buffer_context
            .is_empty());
        // The reply buffer's descriptor word was cleared.
        assert_eq!(
            fixture
                .kernel
                .guest_read_u32(fixture.process, fixture.client_cmd + 8)
                .unwrap(),
            0
        );
        // The server-side mapping is unmapped again.
        assert!(fixture
            .kernel
            .guest_read_u32(fixture.process, mapped)
            .is_err());
    }
}
