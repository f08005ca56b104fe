//! Requests from guest clients to host-implemented servers.
//!
//! `HLERequestContext` is built from the client thread's command buffer with every descriptor
//! already translated: handles resolved to object ids (each retained by the context), the calling
//! process id filled in, static buffers copied out and mapped buffers checked against the client's
//! memory. Handlers answer through `respond`, and `write_to_client` marshals the answer back into
//! the client's command buffer.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, trace};

use crate::errors::{KernelError, KResult, ResultCode};
use crate::ipc::{self, BufferPermission, IPCHeaderCode, IPCMessage, IPCTranslateParameter, IPCWriter, IPC_REQUEST_SIZE};
use crate::memory::Memory;
use crate::object::{ObjectId, ProcessId, ThreadId};
use crate::{Handle, Kernel};

/// Host side of a session or port.
pub trait SessionRequestHandler {
    fn handle_sync_request(&mut self, kernel: &mut Kernel, context: &mut HLERequestContext) -> KResult<()>;

    fn client_connected(&mut self, _kernel: &mut Kernel, _server_session: ObjectId) {}

    fn client_disconnected(&mut self, _kernel: &mut Kernel, _server_session: ObjectId) {}
}

pub type SharedRequestHandler = Rc<RefCell<dyn SessionRequestHandler>>;

/// A buffer in the client's memory that the handler may access for the duration of the request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MappedBuffer {
    pub process: ProcessId,
    pub address: u32,
    pub size: u32,
    pub permission: BufferPermission,
}

impl MappedBuffer {
    fn check(&self, offset: u32, len: usize) -> KResult<u32> {
        match offset.checked_add(len as u32) {
            Some(end) if end <= self.size => Ok(self.address + offset),
            _ => Err(KernelError::InvalidAddress),
        }
    }

    pub fn read(&self, kernel: &Kernel, offset: u32, bytes: &mut [u8]) -> KResult<()> {
        let address = self.check(offset, bytes.len())?;
        kernel.process(self.process).address_space.read(address, bytes)
    }

    pub fn write(&self, kernel: &Kernel, offset: u32, bytes: &[u8]) -> KResult<()> {
        if self.permission == BufferPermission::Read {
            return Err(KernelError::InvalidAddress)
        }
        let address = self.check(offset, bytes.len())?;
        kernel.process(self.process).address_space.write(address, bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslatedParam {
    Objects {
        moved: bool,
        objects: Vec<Option<ObjectId>>,
    },
    CallingProcess(u32),
    StaticBuffer {
        index: u8,
        data: Vec<u8>,
    },
    MappedBuffer(MappedBuffer),
}

enum ResponseParam {
    Objects {
        moved: bool,
        objects: Vec<Option<ObjectId>>,
    },
    StaticBuffer {
        index: u8,
        data: Vec<u8>,
    },
    MappedBuffer(MappedBuffer),
}

struct Response {
    result: ResultCode,
    normal: Vec<u32>,
    translate: Vec<ResponseParam>,
}

pub struct ResponseBuilder<'a> {
    response: &'a mut Response,
}

impl<'a> ResponseBuilder<'a> {
    pub fn push_u32(&mut self, value: u32) -> &mut Self {
        assert!(self.response.translate.is_empty(), "Normal parameters must precede translate parameters");
        self.response.normal.push(value);
        self
    }

    pub fn push_u64(&mut self, value: u64) -> &mut Self {
        self.push_u32(value as u32);
        self.push_u32((value >> 32) as u32)
    }

    /// Hands objects to the client. Moved objects transfer one reference owned by the caller;
    /// copied objects are retained for the client's new handles.
    pub fn push_objects(&mut self, moved: bool, objects: Vec<Option<ObjectId>>) -> &mut Self {
        self.response.translate.push(ResponseParam::Objects { moved, objects });
        self
    }

    pub fn push_static_buffer(&mut self, index: u8, data: Vec<u8>) -> &mut Self {
        self.response.translate.push(ResponseParam::StaticBuffer { index, data });
        self
    }

    pub fn push_mapped_buffer(&mut self, buffer: MappedBuffer) -> &mut Self {
        self.response.translate.push(ResponseParam::MappedBuffer(buffer));
        self
    }
}

pub struct HLERequestContext {
    header: IPCHeaderCode,
    raw: Vec<u32>,
    client_thread: ThreadId,
    client_process: ProcessId,
    session: ObjectId,
    normal: Vec<u32>,
    normal_position: usize,
    translate: Vec<TranslatedParam>,
    translate_position: usize,
    response: Option<Response>,
}

impl HLERequestContext {
    /// Reads and translates the client thread's command buffer.
    pub fn from_client(kernel: &mut Kernel, client_thread: ThreadId, session: ObjectId) -> KResult<HLERequestContext> {
        let thread = kernel.thread(client_thread);
        let client_process = thread.owner;
        let address = thread.command_buffer_address();

        let mut data = [0u8; IPC_REQUEST_SIZE as usize];
        kernel.process(client_process).address_space.read(address, &mut data)?;
        let message = IPCMessage::parse(&data)?;

        let word_count = 1 + message.header.normal_parameter_count as usize + message.header.translate_parameter_size as usize;
        let raw = data.chunks(4).take(word_count)
            .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
            .collect();

        let mut context = HLERequestContext {
            header: message.header,
            raw,
            client_thread,
            client_process,
            session,
            normal: message.normal,
            normal_position: 0,
            translate: vec![],
            translate_position: 0,
            response: None,
        };

        let mut moved = vec![];
        for param in message.translate {
            match context.translate_param(kernel, param, &mut moved) {
                Ok(param) => context.translate.push(param),
                Err(err) => {
                    context.release(kernel);
                    return Err(err)
                }
            }
        }

        // Moved handles leave the client only once the whole request translated
        for handle in moved {
            if let Err(err) = kernel.close_handle(client_process, handle) {
                debug!("moved {:?} was already gone from {:?}: {}", handle, client_process, err);
            }
        }

        trace!("request {:#010X} from {:?} on {:?}", context.header.raw(), client_thread, session);
        Ok(context)
    }

    fn translate_param(&self, kernel: &mut Kernel, param: IPCTranslateParameter, moved_handles: &mut Vec<Handle>) -> KResult<TranslatedParam> {
        match param {
            IPCTranslateParameter::Handle { moved, handles } => {
                let mut objects = Vec::with_capacity(handles.len());
                for handle in &handles {
                    let object = match handle {
                        Some(handle) => match kernel.lookup_handle(self.client_process, self.client_thread, Some(*handle)) {
                            Ok(object) => Some(object),
                            Err(err) => {
                                for object in objects.into_iter().flatten() {
                                    kernel.release_object(object);
                                }
                                return Err(err)
                            }
                        },
                        None => None,
                    };
                    if let Some(object) = object {
                        kernel.retain_object(object);
                    }
                    objects.push(object);
                }

                if moved {
                    moved_handles.extend(handles.into_iter().flatten().filter(|handle| !handle.is_pseudo()));
                }

                Ok(TranslatedParam::Objects { moved, objects })
            },
            IPCTranslateParameter::ProcessId(_) => {
                Ok(TranslatedParam::CallingProcess(kernel.process(self.client_process).process_id))
            },
            IPCTranslateParameter::StaticBuffer { index, size, address } => {
                let mut data = vec![0u8; size as usize];
                kernel.process(self.client_process).address_space.read(address, &mut data)?;
                Ok(TranslatedParam::StaticBuffer { index, data })
            },
            IPCTranslateParameter::MappedBuffer { permission, size, address } => {
                kernel.process(self.client_process).address_space.check_range(address, size, permission.memory_permission())?;
                Ok(TranslatedParam::MappedBuffer(MappedBuffer {
                    process: self.client_process,
                    address,
                    size,
                    permission,
                }))
            },
        }
    }

    pub fn header(&self) -> IPCHeaderCode {
        self.header
    }

    pub fn command_id(&self) -> u16 {
        self.header.command_id
    }

    /// The request as the client wrote it, header included.
    pub fn command_buffer(&self) -> &[u32] {
        &self.raw
    }

    pub fn client_thread(&self) -> ThreadId {
        self.client_thread
    }

    pub fn client_process(&self) -> ProcessId {
        self.client_process
    }

    pub fn session(&self) -> ObjectId {
        self.session
    }

    pub fn translated_params(&self) -> &[TranslatedParam] {
        &self.translate
    }

    pub fn pop_u32(&mut self) -> KResult<u32> {
        let value = *self.normal.get(self.normal_position).ok_or(KernelError::InvalidBufferDescriptor)?;
        self.normal_position += 1;
        Ok(value)
    }

    pub fn pop_u64(&mut self) -> KResult<u64> {
        let low = self.pop_u32()? as u64;
        let high = self.pop_u32()? as u64;
        Ok(high << 32 | low)
    }

    fn pop_translated(&mut self) -> KResult<&TranslatedParam> {
        let param = self.translate.get(self.translate_position).ok_or(KernelError::InvalidBufferDescriptor)?;
        self.translate_position += 1;
        Ok(param)
    }

    /// Objects sent by the client. The context keeps its references; retain anything kept past
    /// the request.
    pub fn pop_objects(&mut self) -> KResult<Vec<Option<ObjectId>>> {
        match self.pop_translated()? {
            TranslatedParam::Objects { objects, .. } => Ok(objects.clone()),
            _ => Err(KernelError::InvalidBufferDescriptor),
        }
    }

    pub fn pop_pid(&mut self) -> KResult<u32> {
        match self.pop_translated()? {
            TranslatedParam::CallingProcess(pid) => Ok(*pid),
            _ => Err(KernelError::InvalidBufferDescriptor),
        }
    }

    pub fn pop_static_buffer(&mut self) -> KResult<Vec<u8>> {
        match self.pop_translated()? {
            TranslatedParam::StaticBuffer { data, .. } => Ok(data.clone()),
            _ => Err(KernelError::InvalidBufferDescriptor),
        }
    }

    pub fn pop_mapped_buffer(&mut self) -> KResult<MappedBuffer> {
        match self.pop_translated()? {
            TranslatedParam::MappedBuffer(buffer) => Ok(*buffer),
            _ => Err(KernelError::InvalidBufferDescriptor),
        }
    }

    /// Starts the response, replacing any earlier one.
    pub fn respond(&mut self, result: ResultCode) -> ResponseBuilder {
        self.response = Some(Response {
            result,
            normal: vec![],
            translate: vec![],
        });
        ResponseBuilder {
            response: self.response.as_mut().expect("Response was just set"),
        }
    }

    pub fn respond_error(&mut self, result: ResultCode) {
        self.respond(result);
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Writes the response into the client's command buffer and drops the request's references.
    ///
    /// A handler that never responded produces an explicit NotImplemented response.
    pub fn write_to_client(mut self, kernel: &mut Kernel) -> KResult<()> {
        let response = self.response.take();
        let result = self.encode_response(kernel, response);
        self.release(kernel);

        let data = result?;
        let address = kernel.thread(self.client_thread).command_buffer_address();
        kernel.process(self.client_process).address_space.write(address, &data)
    }

    fn encode_response(&self, kernel: &mut Kernel, response: Option<Response>) -> KResult<[u8; IPC_REQUEST_SIZE as usize]> {
        let mut data = [0u8; IPC_REQUEST_SIZE as usize];

        let response = match response {
            Some(response) => response,
            None => {
                drop(IPCWriter::new_response(self.header.command_id, KernelError::NotImplemented.raw(), &mut data)?);
                return Ok(data)
            }
        };

        let mut failure = None;
        let mut params = vec![];
        for param in response.translate {
            match param {
                ResponseParam::Objects { moved, objects } => {
                    let mut handles = vec![];
                    for object in objects {
                        let handle = match (object, failure) {
                            (None, _) => None,
                            (Some(object), Some(_)) => {
                                if moved {
                                    kernel.release_object(object);
                                }
                                None
                            },
                            (Some(object), None) => {
                                let created = if moved {
                                    kernel.adopt_handle(self.client_process, object)
                                } else {
                                    kernel.create_handle(self.client_process, object)
                                };
                                match created {
                                    Ok(handle) => Some(handle),
                                    Err(err) => {
                                        failure = Some(err);
                                        None
                                    }
                                }
                            },
                        };
                        handles.push(handle);
                    }
                    params.push(IPCTranslateParameter::Handle { moved, handles });
                },
                ResponseParam::StaticBuffer { index, data: bytes } => {
                    if failure.is_some() {
                        continue
                    }
                    match self.write_client_static_buffer(kernel, index, &bytes) {
                        Ok(param) => params.push(param),
                        Err(err) => failure = Some(err),
                    }
                },
                ResponseParam::MappedBuffer(buffer) => {
                    params.push(IPCTranslateParameter::MappedBuffer {
                        permission: buffer.permission,
                        size: buffer.size,
                        address: buffer.address,
                    });
                },
            }
        }

        if let Some(err) = failure {
            return Err(err)
        }

        {
            let mut writer = IPCWriter::new_response(self.header.command_id, response.result.raw(), &mut data)?;
            for word in &response.normal {
                writer.write_normal(*word)?;
            }
            for param in &params {
                writer.write_translate(param)?;
            }
        }
        Ok(data)
    }

    /// Copies response data into the client's static buffer `index`, as described at TLS + 0x180.
    fn write_client_static_buffer(&self, kernel: &Kernel, index: u8, bytes: &[u8]) -> KResult<IPCTranslateParameter> {
        if index as usize >= ipc::MAX_STATIC_BUFFERS {
            return Err(KernelError::InvalidBufferDescriptor)
        }
        let descriptor_address = kernel.thread(self.client_thread).static_buffer_descriptor_address() + index as u32 * 8;
        let memory = &kernel.process(self.client_process).address_space;
        let descriptor = memory.read_u32(descriptor_address)?;
        let address = memory.read_u32(descriptor_address + 4)?;
        let capacity = descriptor >> 14;
        if bytes.len() as u32 > capacity {
            return Err(KernelError::InvalidBufferDescriptor)
        }
        memory.write(address, bytes)?;
        Ok(IPCTranslateParameter::StaticBuffer { index, size: bytes.len() as u32, address })
    }

    /// Drops the references the context took on the client's objects.
    pub fn release(&mut self, kernel: &mut Kernel) {
        for param in self.translate.drain(..) {
            if let TranslatedParam::Objects { objects, .. } = param {
                for object in objects.into_iter().flatten() {
                    kernel.release_object(object);
                }
            }
        }
    }
}
