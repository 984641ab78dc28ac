// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! IPC ports and sessions.
//!
//! A port is the rendezvous for establishing sessions: clients connect
//! through the client half, servers accept through the server half. Each
//! established session is a (client half, server half, optional port) triple
//! linked through a shared `Session` record; when either half dies, its field
//! in the record is cleared and the peer's pending operations complete with
//! a closed-by-remote error.

use std::collections::VecDeque;

use rytra_common::{error, ObjectId, ResultCode};

use crate::ipc::MappedBufferContext;
use crate::kernel::KernelContext;
use crate::object::KernelObject;
use crate::thread::ThreadStatus;

/// Links the two endpoints of a session with their originating port. Never
/// handle-visible; each half keeps the record alive.
pub struct Session {
    pub client: Option<ObjectId>,
    pub server: Option<ObjectId>,
    pub port: Option<ObjectId>,
}

pub struct ClientPort {
    pub server_port: ObjectId,
    pub max_sessions: u32,
    pub active_sessions: u32,
    pub name: String,
}

pub struct ServerPort {
    /// Established sessions nobody has accepted yet.
    pub pending_sessions: VecDeque<ObjectId>,
    /// Threads waiting for a connection attempt.
    pub waiters: Vec<ObjectId>,
    pub name: String,
}

pub struct ClientSession {
    /// The session triple this endpoint belongs to.
    pub session: ObjectId,
    pub name: String,
}

pub struct ServerSession {
    pub session: ObjectId,
    /// Threads waiting on this session via WaitSynch/ReplyAndReceive.
    pub waiters: Vec<ObjectId>,
    /// Client threads with a sent request not yet picked up, FIFO.
    pub pending_requesting_threads: VecDeque<ObjectId>,
    /// The client thread whose request is currently being handled.
    pub currently_handling: Option<ObjectId>,
    /// Buffers mapped into the server for the in-flight request.
    pub mapped_buffer_context: Vec<MappedBufferContext>,
    pub name: String,
}

impl KernelContext {
    /// Create a connected port pair. Returns (server port, client port), each
    /// carrying one creation reference.
    pub(crate) fn create_port_pair(
        &mut self,
        max_sessions: u32,
        name: String,
    ) -> (ObjectId, ObjectId) {
        let server_id = self.arena.insert(KernelObject::ServerPort(ServerPort {
            pending_sessions: VecDeque::new(),
            waiters: Vec::new(),
            name: format!("{name}_server"),
        }));
        // The client half keeps the server half alive.
        self.arena.retain(server_id);
        let client_id = self.arena.insert(KernelObject::ClientPort(ClientPort {
            server_port: server_id,
            max_sessions,
            active_sessions: 0,
            name: format!("{name}_client"),
        }));
        (server_id, client_id)
    }

    /// Create a connected session pair. Returns (server session, client
    /// session). The `Session` record is owned by both halves; `port`, when
    /// given, is additionally retained by the record.
    pub(crate) fn create_session_pair(
        &mut self,
        port: Option<ObjectId>,
        name: String,
    ) -> (ObjectId, ObjectId) {
        let session_id = self.arena.insert(KernelObject::Session(Session {
            client: None,
            server: None,
            port,
        }));
        if let Some(port_id) = port {
            self.arena.retain(port_id);
        }
        // Both halves share ownership of the record.
        self.arena.retain(session_id);

        let server_id = self.arena.insert(KernelObject::ServerSession(ServerSession {
            session: session_id,
            waiters: Vec::new(),
            pending_requesting_threads: VecDeque::new(),
            currently_handling: None,
            mapped_buffer_context: Vec::new(),
            name: format!("{name}_server"),
        }));
        let client_id = self.arena.insert(KernelObject::ClientSession(ClientSession {
            session: session_id,
            name: format!("{name}_client"),
        }));

        let session = self.session_mut(session_id);
        session.server = Some(server_id);
        session.client = Some(client_id);
        (server_id, client_id)
    }

    /// Connect through a client port, producing a new client session.
    pub(crate) fn client_port_connect(
        &mut self,
        client_port_id: ObjectId,
    ) -> Result<ObjectId, ResultCode> {
        let (server_port, name) = {
            let port = self.client_port_ref(client_port_id);
            if port.active_sessions >= port.max_sessions {
                return Err(error::MAX_CONNECTIONS_REACHED);
            }
            (port.server_port, port.name.clone())
        };
        self.client_port_mut(client_port_id).active_sessions += 1;

        let (server_session, client_session) =
            self.create_session_pair(Some(client_port_id), name);

        // Hand the server half to the port until somebody accepts it.
        self.server_port_mut(server_port)
            .pending_sessions
            .push_back(server_session);
        self.wake_up_all_waiters(server_port);

        Ok(client_session)
    }

    /// A session endpoint went away; give its connection slot back.
    pub(crate) fn client_port_connection_closed(&mut self, client_port_id: ObjectId) {
        let port = self.client_port_mut(client_port_id);
        port.active_sessions = port.active_sessions.saturating_sub(1);
    }

    /// Dequeue a pending session from a server port. The returned id carries
    /// the reference previously held by the pending queue.
    pub(crate) fn server_port_accept(
        &mut self,
        server_port_id: ObjectId,
    ) -> Result<ObjectId, ResultCode> {
        self.server_port_mut(server_port_id)
            .pending_sessions
            .pop_front()
            .ok_or(error::NO_PENDING_SESSIONS)
    }

    /// Client side of SendSyncRequest: queue the calling thread on the server
    /// session and signal it.
    pub(crate) fn session_send_sync_request(
        &mut self,
        client_session_id: ObjectId,
        thread_id: ObjectId,
    ) -> ResultCode {
        let session_id = self.client_session_ref(client_session_id).session;
        let Some(server_id) = self.session_ref(session_id).server else {
            return error::SESSION_CLOSED_BY_REMOTE;
        };

        self.thread_mut(thread_id).status = ThreadStatus::WaitIpc;
        self.server_session_mut(server_id)
            .pending_requesting_threads
            .push_back(thread_id);
        self.wake_up_all_waiters(server_id);
        ResultCode::SUCCESS
    }

    /// Wake every client thread parked on a server session with the
    /// closed-by-remote error. Used when either endpoint dies.
    pub(crate) fn session_abort_pending_requests(&mut self, server_session_id: ObjectId) {
        let (pending, current) = {
            let server = self.server_session_mut(server_session_id);
            (
                std::mem::take(&mut server.pending_requesting_threads),
                server.currently_handling.take(),
            )
        };
        for thread_id in pending.into_iter().chain(current) {
            let Some(thread) = self.try_thread_ref(thread_id) else {
                continue;
            };
            if thread.status != ThreadStatus::WaitIpc {
                continue;
            }
            self.set_wait_synchronization_result(thread_id, error::SESSION_CLOSED_BY_REMOTE);
            self.resume_thread_from_wait(thread_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::test_support::{boot, spawn_thread, unqueue};
    use crate::thread::ThreadStatus;
    use rytra_common::error;

    #[test]
    fn test_connect_saturates_at_max_sessions() {
        let (mut kernel, _cpu, _process, _main) = boot();
        let (_server_port, client_port) = kernel.create_port_pair(1, "srv:".into());

        let first = kernel.client_port_connect(client_port);
        assert!(first.is_ok());
        assert_eq!(
            kernel.client_port_connect(client_port).err(),
            Some(error::MAX_CONNECTIONS_REACHED)
        );

        // Closing the session frees the slot again.
        kernel.release_object(first.unwrap());
        assert!(kernel.client_port_connect(client_port).is_ok());
    }

    #[test]
    fn test_accept_dequeues_pending_sessions_in_order() {
        let (mut kernel, _cpu, _process, _main) = boot();
        let (server_port, client_port) = kernel.create_port_pair(4, "srv:".into());

        assert_eq!(
            kernel.server_port_accept(server_port).err(),
            Some(error::NO_PENDING_SESSIONS)
        );
        let client_a = kernel.client_port_connect(client_port).unwrap();
        let client_b = kernel.client_port_connect(client_port).unwrap();

        let server_a = kernel.server_port_accept(server_port).unwrap();
        let server_b = kernel.server_port_accept(server_port).unwrap();
        let session_a = kernel.server_session_ref(server_a).session;
        let session_b = kernel.server_session_ref(server_b).session;
        assert_eq!(kernel.session_ref(session_a).client, Some(client_a));
        assert_eq!(kernel.session_ref(session_b).client, Some(client_b));
    }

    #[test]
    fn test_send_on_dead_server_fails() {
        let (mut kernel, _cpu, _process, main) = boot();
        let (server_session, client_session) = kernel.create_session_pair(None, "s".into());
        kernel.release_object(server_session);
        assert_eq!(
            kernel.session_send_sync_request(client_session, main),
            error::SESSION_CLOSED_BY_REMOTE
        );
    }

    #[test]
    fn test_client_closure_fails_pending_requests() {
        let (mut kernel, _cpu, process, _main) = boot();
        let (server_session, client_session) = kernel.create_session_pair(None, "s".into());

        let client_thread = spawn_thread(&mut kernel, process, 50);
        unqueue(&mut kernel, client_thread);
        assert!(kernel
            .session_send_sync_request(client_session, client_thread)
            .is_success());
        assert_eq!(
            kernel.thread_ref(client_thread).status,
            ThreadStatus::WaitIpc
        );

        kernel.release_object(client_session);
        // The queued request completes with the closed-by-remote error.
        assert_eq!(kernel.thread_ref(client_thread).status, ThreadStatus::Ready);
        assert_eq!(
            kernel.thread_ref(client_thread).context.regs[0],
            error::SESSION_CLOSED_BY_REMOTE.raw()
        );
        let session = kernel.server_session_ref(server_session).session;
        assert_eq!(kernel.session_ref(session).client, None);
    }

    #[test]
    fn test_connection_wakes_port_waiter() {
        let (mut kernel, _cpu, process, _main) = boot();
        let (server_port, client_port) = kernel.create_port_pair(4, "srv:".into());

        let acceptor = spawn_thread(&mut kernel, process, 50);
        crate::kernel::test_support::block_on_any(&mut kernel, acceptor, &[server_port]);

        kernel.client_port_connect(client_port).unwrap();
        assert_eq!(kernel.thread_ref(acceptor).status, ThreadStatus::Ready);
    }
}
