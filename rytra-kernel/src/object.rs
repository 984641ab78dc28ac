// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Kernel object arena.
//!
//! All kernel objects live in one arena keyed by stable object id; the
//! relations between them (waiters, wait lists, holders, session peers) are
//! plain ids, which breaks the reference cycles a pointer graph would have.
//! Each entry carries a strong count: handle tables and the kernel's own
//! lists retain, and the object finalizes when the count reaches zero.

use std::collections::HashMap;

use rytra_common::ObjectId;

use crate::address_arbiter::AddressArbiter;
use crate::event::Event;
use crate::mutex::Mutex;
use crate::process::Process;
use crate::resource_limit::ResourceLimit;
use crate::semaphore::Semaphore;
use crate::session::{ClientPort, ClientSession, ServerPort, ServerSession, Session};
use crate::shared_memory::SharedMemory;
use crate::thread::Thread;
use crate::timer::Timer;

/// Every kernel object kind, tagged.
pub enum KernelObject {
    Thread(Thread),
    Mutex(Mutex),
    Semaphore(Semaphore),
    Event(Event),
    Timer(Timer),
    SharedMemory(SharedMemory),
    AddressArbiter(AddressArbiter),
    ClientPort(ClientPort),
    ServerPort(ServerPort),
    ClientSession(ClientSession),
    ServerSession(ServerSession),
    Session(Session),
    Process(Process),
    ResourceLimit(ResourceLimit),
}

impl KernelObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Thread(_) => "Thread",
            Self::Mutex(_) => "Mutex",
            Self::Semaphore(_) => "Semaphore",
            Self::Event(_) => "Event",
            Self::Timer(_) => "Timer",
            Self::SharedMemory(_) => "SharedMemory",
            Self::AddressArbiter(_) => "AddressArbiter",
            Self::ClientPort(_) => "ClientPort",
            Self::ServerPort(_) => "ServerPort",
            Self::ClientSession(_) => "ClientSession",
            Self::ServerSession(_) => "ServerSession",
            Self::Session(_) => "Session",
            Self::Process(_) => "Process",
            Self::ResourceLimit(_) => "ResourceLimit",
        }
    }

    /// Whether threads can block on this object via WaitSynchronization.
    pub fn is_wait_object(&self) -> bool {
        matches!(
            self,
            Self::Thread(_)
                | Self::Mutex(_)
                | Self::Semaphore(_)
                | Self::Event(_)
                | Self::Timer(_)
                | Self::ServerPort(_)
                | Self::ServerSession(_)
        )
    }

    /// The ordered waiter set, for wait objects.
    pub fn waiters(&self) -> Option<&Vec<ObjectId>> {
        match self {
            Self::Thread(t) => Some(&t.waiters),
            Self::Mutex(m) => Some(&m.waiters),
            Self::Semaphore(s) => Some(&s.waiters),
            Self::Event(e) => Some(&e.waiters),
            Self::Timer(t) => Some(&t.waiters),
            Self::ServerPort(p) => Some(&p.waiters),
            Self::ServerSession(s) => Some(&s.waiters),
            _ => None,
        }
    }

    pub fn waiters_mut(&mut self) -> Option<&mut Vec<ObjectId>> {
        match self {
            Self::Thread(t) => Some(&mut t.waiters),
            Self::Mutex(m) => Some(&mut m.waiters),
            Self::Semaphore(s) => Some(&mut s.waiters),
            Self::Event(e) => Some(&mut e.waiters),
            Self::Timer(t) => Some(&mut t.waiters),
            Self::ServerPort(p) => Some(&mut p.waiters),
            Self::ServerSession(s) => Some(&mut s.waiters),
            _ => None,
        }
    }
}

struct Entry {
    object: KernelObject,
    strong: u32,
}

/// Arena of kernel objects with explicit strong counts.
pub struct ObjectArena {
    entries: HashMap<ObjectId, Entry>,
    next_id: ObjectId,
}

impl ObjectArena {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    /// Insert an object with one strong reference (the creation reference).
    pub fn insert(&mut self, object: KernelObject) -> ObjectId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, Entry { object, strong: 1 });
        id
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&KernelObject> {
        self.entries.get(&id).map(|e| &e.object)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut KernelObject> {
        self.entries.get_mut(&id).map(|e| &mut e.object)
    }

    /// Add a strong reference.
    pub fn retain(&mut self, id: ObjectId) {
        match self.entries.get_mut(&id) {
            Some(entry) => entry.strong += 1,
            None => panic!("retain of dead object id {id}"),
        }
    }

    /// Drop a strong reference. Returns the object when the last reference
    /// went away, so the caller can finalize it.
    #[must_use]
    pub fn release(&mut self, id: ObjectId) -> Option<KernelObject> {
        let entry = self
            .entries
            .get_mut(&id)
            .unwrap_or_else(|| panic!("release of dead object id {id}"));
        entry.strong -= 1;
        if entry.strong == 0 {
            return self.entries.remove(&id).map(|e| e.object);
        }
        None
    }

    pub fn strong_count(&self, id: ObjectId) -> u32 {
        self.entries.get(&id).map_or(0, |e| e.strong)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ObjectArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate the typed accessors. Lookups with a wrong id are a corrupted
/// kernel state and abort.
macro_rules! arena_accessors {
    ($($variant:ident, $ty:ty, $ref_name:ident, $mut_name:ident, $try_ref_name:ident;)*) => {
        impl ObjectArena {
            $(
                pub fn $ref_name(&self, id: ObjectId) -> &$ty {
                    match self.get(id) {
                        Some(KernelObject::$variant(inner)) => inner,
                        Some(other) => panic!(
                            "object {id} is a {}, expected {}",
                            other.type_name(),
                            stringify!($variant)
                        ),
                        None => panic!("object {id} is dead, expected a live {}", stringify!($variant)),
                    }
                }

                pub fn $mut_name(&mut self, id: ObjectId) -> &mut $ty {
                    match self.get_mut(id) {
                        Some(KernelObject::$variant(inner)) => inner,
                        Some(other) => panic!(
                            "object {id} is a {}, expected {}",
                            other.type_name(),
                            stringify!($variant)
                        ),
                        None => panic!("object {id} is dead, expected a live {}", stringify!($variant)),
                    }
                }

                pub fn $try_ref_name(&self, id: ObjectId) -> Option<&$ty> {
                    match self.get(id) {
                        Some(KernelObject::$variant(inner)) => Some(inner),
                        _ => None,
                    }
                }
            )*
        }
    };
}

arena_accessors! {
    Thread, Thread, thread_ref, thread_mut, try_thread_ref;
    Mutex, Mutex, mutex_ref, mutex_mut, try_mutex_ref;
    Semaphore, Semaphore, semaphore_ref, semaphore_mut, try_semaphore_ref;
    Event, Event, event_ref, event_mut, try_event_ref;
    Timer, Timer, timer_ref, timer_mut, try_timer_ref;
    SharedMemory, SharedMemory, shared_memory_ref, shared_memory_mut, try_shared_memory_ref;
    AddressArbiter, AddressArbiter, arbiter_ref, arbiter_mut, try_arbiter_ref;
    ClientPort, ClientPort, client_port_ref, client_port_mut, try_client_port_ref;
    ServerPort, ServerPort, server_port_ref, server_port_mut, try_server_port_ref;
    ClientSession, ClientSession, client_session_ref, client_session_mut, try_client_session_ref;
    ServerSession, ServerSession, server_session_ref, server_session_mut, try_server_session_ref;
    Session, Session, session_ref, session_mut, try_session_ref;
    Process, Process, process_ref, process_mut, try_process_ref;
    ResourceLimit, ResourceLimit, resource_limit_ref, resource_limit_mut, try_resource_limit_ref;
}
