//! Ports and sessions.
//!
//! A ClientPort keeps its ServerPort alive; a ClientSession keeps its ClientPort alive. The links
//! between the two ends of a session are plain ids that the destroy hooks clear, so closing either
//! end is observed by the other. Sessions to host servers are owned by their client end.

use std::collections::VecDeque;

use log::{debug, trace, warn};

use crate::errors::{KernelError, KResult};
use crate::hle_ipc::{HLERequestContext, SharedRequestHandler};
use crate::ipc::{self, IPCMessage, IPCTranslateParameter, IPCWriter, IPC_REQUEST_SIZE};
use crate::memory::{Memory, MemoryState, PAGE_SIZE};
use crate::object::{ObjectId, ProcessId, ThreadId};
use crate::thread::{ThreadResume, ThreadStatus};
use crate::wait::{Completion, Timeout, WaitQueue};
use crate::{Handle, Kernel};

pub const MAX_PORT_NAME_LENGTH: usize = 11;

/// Where mapped buffers of incoming requests appear in the server process.
pub const IPC_MAPPING_VADDR: u32 = 0x04000000;
pub const IPC_MAPPING_VADDR_END: u32 = 0x08000000;

pub struct KServerPort {
    pub name: String,
    /// Server sessions of connections not accepted yet, each holding a reference.
    pub pending_sessions: VecDeque<ObjectId>,
    pub hle_handler: Option<SharedRequestHandler>,
    pub waiters: WaitQueue,
}

pub struct KClientPort {
    pub name: String,
    pub server_port: ObjectId,
    pub max_sessions: u32,
    pub active_sessions: u32,
}

/// A buffer of the request being handled, mapped into the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MappedBufferRecord {
    pub process: ProcessId,
    pub client_address: u32,
    pub server_address: u32,
    pub size: u32,
    pub mapping_base: u32,
    pub mapping_size: u32,
}

pub struct KServerSession {
    pub name: String,
    pub client: Option<ObjectId>,
    pub hle_handler: Option<SharedRequestHandler>,
    pub pending_requests: VecDeque<ThreadId>,
    pub currently_handling: Option<ThreadId>,
    pub mapped_buffers: Vec<MappedBufferRecord>,
    pub waiters: WaitQueue,
}

pub struct KClientSession {
    pub name: String,
    pub server: Option<ObjectId>,
    pub port: Option<ObjectId>,
    /// Whether this end holds the reference keeping the server end alive.
    pub owns_server: bool,
}

impl Kernel {
    /// Creates a port. Both ends come back with a reference owned by the caller.
    pub fn create_port_pair(&mut self, name: &str, max_sessions: u32, hle_handler: Option<SharedRequestHandler>) -> (ObjectId, ObjectId) {
        let server = self.objects.insert(KServerPort {
            name: name.to_owned(),
            pending_sessions: VecDeque::new(),
            hle_handler,
            waiters: WaitQueue::new(),
        });
        self.objects.retain(server);
        let client = self.objects.insert(KClientPort {
            name: name.to_owned(),
            server_port: server,
            max_sessions,
            active_sessions: 0,
        });
        debug!("created port {} ({:?}, {:?})", name, server, client);
        (server, client)
    }

    /// Creates an unconnected session. Both ends come back with a reference owned by the caller.
    pub fn create_session_pair(&mut self, name: &str, hle_handler: Option<SharedRequestHandler>) -> (ObjectId, ObjectId) {
        let server = self.objects.insert(KServerSession {
            name: name.to_owned(),
            client: None,
            hle_handler,
            pending_requests: VecDeque::new(),
            currently_handling: None,
            mapped_buffers: vec![],
            waiters: WaitQueue::new(),
        });
        let client = self.objects.insert(KClientSession {
            name: name.to_owned(),
            server: Some(server),
            port: None,
            owns_server: false,
        });
        if let Some(data) = self.objects.get_mut::<KServerSession>(server) {
            data.client = Some(client);
        }
        (server, client)
    }

    /// Opens a session through a client port and returns the client end.
    pub fn connect_to_port(&mut self, client_port: ObjectId) -> KResult<ObjectId> {
        let port = self.objects.get_mut::<KClientPort>(client_port).ok_or(KernelError::InvalidHandle)?;
        if port.active_sessions >= port.max_sessions {
            return Err(KernelError::MaxConnectionsReached)
        }
        port.active_sessions += 1;
        let server_port = port.server_port;
        let name = port.name.clone();

        let handler = self.objects.get::<KServerPort>(server_port).and_then(|port| port.hle_handler.clone());
        let (server, client) = self.create_session_pair(&name, handler.clone());

        self.objects.retain(client_port);
        if let Some(data) = self.objects.get_mut::<KClientSession>(client) {
            data.port = Some(client_port);
        }

        match handler {
            Some(handler) => {
                if let Some(data) = self.objects.get_mut::<KClientSession>(client) {
                    data.owns_server = true;
                }
                handler.borrow_mut().client_connected(self, server);
            },
            None => {
                if let Some(port) = self.objects.get_mut::<KServerPort>(server_port) {
                    port.pending_sessions.push_back(server);
                }
                self.wakeup_all_waiting_threads(server_port);
            },
        }

        debug!("connected to port {} with session {:?}", name, client);
        Ok(client)
    }

    /// Takes the oldest pending connection. The caller owns the returned server session.
    pub fn accept_session(&mut self, server_port: ObjectId) -> KResult<ObjectId> {
        let port = self.objects.get_mut::<KServerPort>(server_port).ok_or(KernelError::InvalidHandle)?;
        port.pending_sessions.pop_front().ok_or(KernelError::NoPendingSessions)
    }

    pub fn register_named_port(&mut self, name: &str, client_port: ObjectId) -> KResult<()> {
        if name.len() > MAX_PORT_NAME_LENGTH {
            return Err(KernelError::PortNameTooLong)
        }
        if self.named_ports.contains_key(name) {
            return Err(KernelError::AlreadyRegistered)
        }
        self.objects.retain(client_port);
        self.named_ports.insert(name.to_owned(), client_port);
        Ok(())
    }

    pub fn lookup_named_port(&self, name: &str) -> KResult<ObjectId> {
        if name.len() > MAX_PORT_NAME_LENGTH {
            return Err(KernelError::PortNameTooLong)
        }
        self.named_ports.get(name).copied().ok_or(KernelError::NotFound)
    }

    /// ConnectToPort: opens a session to a port registered by name.
    pub fn connect_to_named_port(&mut self, name: &str) -> KResult<ObjectId> {
        let port = self.lookup_named_port(name)?;
        self.connect_to_port(port)
    }

    /// Sends the request in the calling thread's command buffer.
    ///
    /// Host servers answer before this returns. Guest servers receive the request through
    /// ReplyAndReceive while the client stays blocked in WaitIpc.
    pub fn send_sync_request(&mut self, tid: ThreadId, client_session: ObjectId) -> KResult<Completion> {
        let client = self.objects.get::<KClientSession>(client_session).ok_or(KernelError::InvalidHandle)?;
        let server = client.server.ok_or(KernelError::SessionClosed)?;
        let handler = self.objects.get::<KServerSession>(server)
            .ok_or(KernelError::SessionClosed)?
            .hle_handler.clone();

        match handler {
            Some(handler) => {
                let mut context = HLERequestContext::from_client(self, tid, server)?;
                trace!("dispatching command {:#06X} to {}", context.command_id(), self.objects.get::<KServerSession>(server).map(|s| s.name.as_str()).unwrap_or("?"));

                let result = handler.borrow_mut().handle_sync_request(self, &mut context);
                if let Err(err) = result {
                    if !context.has_response() {
                        context.respond_error(err.code());
                    }
                }
                context.write_to_client(self)?;
                Ok(Completion::Immediate { index: None })
            },
            None => {
                self.suspend_thread(tid, ThreadStatus::WaitIpc);
                self.objects.retain(client_session);
                self.thread_mut(tid).ipc_session = Some(client_session);
                if let Some(data) = self.objects.get_mut::<KServerSession>(server) {
                    data.pending_requests.push_back(tid);
                }
                self.wakeup_all_waiting_threads(server);
                Ok(Completion::Suspended)
            },
        }
    }

    pub(crate) fn server_session_acquire(&mut self, server: ObjectId) {
        if let Some(session) = self.objects.get_mut::<KServerSession>(server) {
            if session.client.is_some() && session.currently_handling.is_none() {
                session.currently_handling = session.pending_requests.pop_front();
            }
        }
    }

    /// Replies to `target` if given, then waits for the next event on `objects`.
    pub fn reply_and_receive(&mut self, tid: ThreadId, objects: &[ObjectId], reply_target: Option<ObjectId>) -> KResult<Completion> {
        if let Some(target) = reply_target {
            self.reply(tid, target)?;
        }
        if objects.is_empty() {
            return Ok(Completion::Immediate { index: None })
        }
        self.wait_synchronization(tid, objects, false, Timeout::Forever)
    }

    /// Completes a receive on `object` once ReplyAndReceive picked it. For a server session this
    /// copies the request being handled into the receiver's command buffer.
    pub fn finish_receive(&mut self, tid: ThreadId, object: ObjectId) -> KResult<()> {
        let session = match self.objects.get::<KServerSession>(object) {
            Some(session) => session,
            None => return Ok(()),
        };
        if session.client.is_none() {
            return Err(KernelError::SessionClosed)
        }
        let client_thread = match session.currently_handling {
            Some(client_thread) => client_thread,
            None => return Ok(()),
        };

        if let Err(err) = self.translate_ipc(client_thread, tid, object, false) {
            warn!("failed to deliver request from {:?} to {:?}: {}", client_thread, tid, err);
            if let Some(session) = self.objects.get_mut::<KServerSession>(object) {
                session.currently_handling = None;
            }
            self.unmap_request_buffers(object);
            self.finish_ipc_wait(client_thread, ThreadResume::Error { result: err, index: None });
            self.wakeup_all_waiting_threads(object);
            return Err(err)
        }
        Ok(())
    }

    /// Sends the reply in `tid`'s command buffer to the client the session is handling.
    pub fn reply(&mut self, tid: ThreadId, server: ObjectId) -> KResult<()> {
        let session = self.objects.get_mut::<KServerSession>(server).ok_or(KernelError::InvalidHandle)?;
        if session.client.is_none() {
            return Err(KernelError::SessionClosed)
        }
        let client_thread = match session.currently_handling.take() {
            Some(client_thread) => client_thread,
            None => return Ok(()),
        };

        let resume = match self.translate_ipc(tid, client_thread, server, true) {
            Ok(()) => ThreadResume::Normal,
            Err(err) => {
                warn!("failed to deliver reply from {:?} to {:?}: {}", tid, client_thread, err);
                ThreadResume::Error { result: err, index: None }
            },
        };

        self.unmap_request_buffers(server);
        self.finish_ipc_wait(client_thread, resume);

        // The next queued request can be received now
        self.wakeup_all_waiting_threads(server);
        Ok(())
    }

    fn unmap_request_buffers(&mut self, server: ObjectId) {
        let records = match self.objects.get_mut::<KServerSession>(server) {
            Some(session) => std::mem::take(&mut session.mapped_buffers),
            None => return,
        };
        self.unmap_buffer_records(records);
    }

    fn unmap_buffer_records(&mut self, records: Vec<MappedBufferRecord>) {
        for record in records {
            if let Some(process) = self.objects.get_mut::<crate::process::KProcess>(record.process) {
                if let Err(err) = process.address_space.unmap(record.mapping_base, record.mapping_size) {
                    debug!("buffer mapping at {:#010X} in {:?} was already gone: {}", record.mapping_base, record.process, err);
                }
            }
        }
    }

    /// Resumes a client blocked in WaitIpc and drops its reference on the client session.
    fn finish_ipc_wait(&mut self, client_thread: ThreadId, resume: ThreadResume) {
        let thread = match self.objects.get_mut::<crate::thread::KThread>(client_thread) {
            Some(thread) if thread.status == ThreadStatus::WaitIpc => thread,
            _ => return,
        };
        let session = thread.ipc_session.take();
        self.resume_from_wait(client_thread, resume);
        if let Some(session) = session {
            self.release_object(session);
        }
    }

    pub(crate) fn cancel_ipc_wait(&mut self, tid: ThreadId) {
        let client = match self.thread_mut(tid).ipc_session.take() {
            Some(client) => client,
            None => return,
        };
        let server = self.objects.get::<KClientSession>(client).and_then(|c| c.server);
        if let Some(session) = server.and_then(|server| self.objects.get_mut::<KServerSession>(server)) {
            session.pending_requests.retain(|t| *t != tid);
            if session.currently_handling == Some(tid) {
                session.currently_handling = None;
            }
        }
        self.release_object(client);
    }

    /// Copies a command buffer from `src` to `dst`, translating descriptors on the way.
    fn translate_ipc(&mut self, src: ThreadId, dst: ThreadId, server: ObjectId, reply: bool) -> KResult<()> {
        let src_thread = self.thread(src);
        let src_pid = src_thread.owner;
        let src_address = src_thread.command_buffer_address();
        let dst_thread = self.thread(dst);
        let dst_pid = dst_thread.owner;
        let dst_address = dst_thread.command_buffer_address();
        let dst_static_buffers = dst_thread.static_buffer_descriptor_address();

        let mut data = [0u8; IPC_REQUEST_SIZE as usize];
        self.process(src_pid).address_space.read(src_address, &mut data)?;
        let message = IPCMessage::parse(&data)?;

        let mut created: Vec<Handle> = vec![];
        let mut moved: Vec<Handle> = vec![];
        let mut params = vec![];
        for param in message.translate {
            let translated = self.translate_ipc_param(param, src, src_pid, dst_pid, dst_static_buffers, server, reply, &mut created, &mut moved);
            match translated {
                Ok(param) => params.push(param),
                Err(err) => {
                    for handle in created {
                        if let Err(err) = self.close_handle(dst_pid, handle) {
                            debug!("could not roll back {:?} in {:?}: {}", handle, dst_pid, err);
                        }
                    }
                    return Err(err)
                }
            }
        }

        // Moved handles leave the sender only once every descriptor translated
        for handle in moved {
            if let Err(err) = self.close_handle(src_pid, handle) {
                debug!("moved {:?} was already gone from {:?}: {}", handle, src_pid, err);
            }
        }

        let mut out = [0u8; IPC_REQUEST_SIZE as usize];
        {
            let mut writer = IPCWriter::new_request(message.header.command_id, &mut out);
            for word in &message.normal {
                writer.write_normal(*word)?;
            }
            for param in &params {
                writer.write_translate(param)?;
            }
        }

        trace!("translated {:#010X} from {:?} to {:?}", message.header.raw(), src, dst);
        self.process(dst_pid).address_space.write(dst_address, &out)
    }

    #[allow(clippy::too_many_arguments)]
    fn translate_ipc_param(&mut self, param: IPCTranslateParameter, src: ThreadId, src_pid: ProcessId, dst_pid: ProcessId, dst_static_buffers: u32, server: ObjectId, reply: bool, created: &mut Vec<Handle>, moved_handles: &mut Vec<Handle>) -> KResult<IPCTranslateParameter> {
        match param {
            IPCTranslateParameter::Handle { moved, handles } => {
                let objects = handles.iter()
                    .map(|handle| match handle {
                        Some(handle) => self.lookup_handle(src_pid, src, Some(*handle)).map(Some),
                        None => Ok(None),
                    })
                    .collect::<KResult<Vec<_>>>()?;

                let mut translated = Vec::with_capacity(objects.len());
                for object in objects {
                    match object {
                        Some(object) => {
                            let handle = self.create_handle(dst_pid, object)?;
                            created.push(handle);
                            translated.push(Some(handle));
                        },
                        None => translated.push(None),
                    }
                }

                if moved {
                    moved_handles.extend(handles.into_iter().flatten().filter(|handle| !handle.is_pseudo()));
                }

                Ok(IPCTranslateParameter::Handle { moved, handles: translated })
            },
            IPCTranslateParameter::ProcessId(_) => {
                Ok(IPCTranslateParameter::ProcessId(self.process(src_pid).process_id))
            },
            IPCTranslateParameter::StaticBuffer { index, size, address } => {
                if index as usize >= ipc::MAX_STATIC_BUFFERS {
                    return Err(KernelError::InvalidBufferDescriptor)
                }
                let mut bytes = vec![0u8; size as usize];
                self.process(src_pid).address_space.read(address, &mut bytes)?;

                let dst_memory = &self.process(dst_pid).address_space;
                let slot = dst_static_buffers + index as u32 * 8;
                let capacity = dst_memory.read_u32(slot)? >> 14;
                let target = dst_memory.read_u32(slot + 4)?;
                if size > capacity {
                    return Err(KernelError::InvalidBufferDescriptor)
                }
                dst_memory.write(target, &bytes)?;
                Ok(IPCTranslateParameter::StaticBuffer { index, size, address: target })
            },
            IPCTranslateParameter::MappedBuffer { permission, size, address } if reply => {
                let session = self.objects.get_mut::<KServerSession>(server).ok_or(KernelError::SessionClosed)?;
                let record = session.mapped_buffers.iter()
                    .position(|record| record.server_address == address && record.size == size)
                    .map(|index| session.mapped_buffers.remove(index))
                    .ok_or(KernelError::InvalidBufferDescriptor)?;
                if let Err(err) = self.process_mut(src_pid).address_space.unmap(record.mapping_base, record.mapping_size) {
                    debug!("reply buffer mapping at {:#010X} was already gone: {}", record.mapping_base, err);
                }
                Ok(IPCTranslateParameter::MappedBuffer { permission, size, address: record.client_address })
            },
            IPCTranslateParameter::MappedBuffer { permission, size, address } => {
                if size == 0 {
                    return Ok(IPCTranslateParameter::MappedBuffer { permission, size, address })
                }

                let src_memory = &self.process(src_pid).address_space;
                src_memory.check_range(address, size, permission.memory_permission())?;

                let page_offset = address & (PAGE_SIZE - 1);
                let base = address - page_offset;
                let mapping_size = (page_offset + size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
                let (backing, backing_offset) = src_memory.backing_at(base, mapping_size)?;

                let dst_memory = &mut self.process_mut(dst_pid).address_space;
                let mapping_base = dst_memory.find_free(IPC_MAPPING_VADDR, IPC_MAPPING_VADDR_END, mapping_size)
                    .ok_or(KernelError::ResourceLimitExceeded)?;
                dst_memory.map(mapping_base, mapping_size, backing, backing_offset, permission.memory_permission(), MemoryState::Shared)?;

                let record = MappedBufferRecord {
                    process: dst_pid,
                    client_address: address,
                    server_address: mapping_base + page_offset,
                    size,
                    mapping_base,
                    mapping_size,
                };
                if let Some(session) = self.objects.get_mut::<KServerSession>(server) {
                    session.mapped_buffers.push(record);
                }
                Ok(IPCTranslateParameter::MappedBuffer { permission, size, address: record.server_address })
            },
        }
    }

    pub(crate) fn destroy_server_port(&mut self, port: KServerPort) {
        for session in port.pending_sessions {
            self.release_object(session);
        }
    }

    pub(crate) fn destroy_client_port(&mut self, port: KClientPort) {
        self.release_object(port.server_port);
    }

    /// The client end went away: the server sees the closure on its next receive.
    pub(crate) fn destroy_client_session(&mut self, id: ObjectId, client: KClientSession) {
        debug!("client session {:?} ({}) closed", id, client.name);

        if let Some(server) = client.server {
            let (handler, stranded) = match self.objects.get_mut::<KServerSession>(server) {
                Some(session) => {
                    session.client = None;
                    let mut stranded: Vec<ThreadId> = session.pending_requests.drain(..).collect();
                    stranded.extend(session.currently_handling.take());
                    (session.hle_handler.clone(), stranded)
                },
                None => (None, vec![]),
            };

            for tid in stranded {
                self.finish_ipc_wait(tid, ThreadResume::Error { result: KernelError::SessionClosed, index: None });
            }
            self.wakeup_all_waiting_threads(server);

            if let Some(handler) = handler {
                handler.borrow_mut().client_disconnected(self, server);
            }
            if client.owns_server {
                self.release_object(server);
            }
        }

        if let Some(port) = client.port {
            if let Some(data) = self.objects.get_mut::<KClientPort>(port) {
                data.active_sessions = data.active_sessions.saturating_sub(1);
            }
            self.release_object(port);
        }
    }

    /// The server end went away: pending and future requests fail with SessionClosed.
    pub(crate) fn destroy_server_session(&mut self, id: ObjectId, server: KServerSession) {
        debug!("server session {:?} ({}) closed", id, server.name);

        if let Some(client) = server.client {
            if let Some(data) = self.objects.get_mut::<KClientSession>(client) {
                data.server = None;
            }
        }

        for tid in server.pending_requests.into_iter().chain(server.currently_handling) {
            self.finish_ipc_wait(tid, ThreadResume::Error { result: KernelError::SessionClosed, index: None });
        }
        self.unmap_buffer_records(server.mapped_buffers);
    }
}
