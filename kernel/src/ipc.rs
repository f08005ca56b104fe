//! Command buffer layout and descriptor codec.
//!
//! A command buffer is 0x100 bytes at TLS + 0x80. Word 0 is the header (command id in bits
//! 16-31, normal word count in bits 6-11, translate word count in bits 0-5), followed by the
//! normal words and then the translate descriptors with their payload words.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use static_assertions::const_assert;

use crate::errors::{KernelError, KResult};
use crate::memory::MemoryPermission;
use crate::Handle;

pub const IPC_REQUEST_SIZE: u32 = 0x100;
pub const IPC_REQUEST_WORDS: usize = (IPC_REQUEST_SIZE / 4) as usize;
pub const COMMAND_BUFFER_OFFSET: u32 = 0x80;
pub const STATIC_BUFFER_DESCRIPTOR_OFFSET: u32 = 0x180;
pub const MAX_STATIC_BUFFERS: usize = 16;

const_assert!(COMMAND_BUFFER_OFFSET + IPC_REQUEST_SIZE <= STATIC_BUFFER_DESCRIPTOR_OFFSET);
const_assert!(STATIC_BUFFER_DESCRIPTOR_OFFSET + (MAX_STATIC_BUFFERS as u32) * 8 <= 0x200);

pub fn make_header(command_id: u16, normal_params: u32, translate_params: u32) -> u32 {
    (command_id as u32) << 16 | (normal_params & 0x3F) << 6 | (translate_params & 0x3F)
}

/// Translate descriptor words.
pub mod descriptor {
    pub const fn copy_handles(count: u32) -> u32 {
        (count - 1) << 26
    }

    pub const fn move_handles(count: u32) -> u32 {
        (count - 1) << 26 | 0x10
    }

    pub const fn calling_pid() -> u32 {
        0x20
    }

    pub const fn static_buffer(size: u32, index: u32) -> u32 {
        size << 14 | (index & 0xF) << 10 | 0x2
    }

    pub const fn mapped_buffer(size: u32, permission: u32) -> u32 {
        size << 4 | 0x8 | (permission & 3) << 1
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferPermission {
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl BufferPermission {
    pub fn from_raw(raw: u32) -> KResult<BufferPermission> {
        match raw {
            1 => Ok(BufferPermission::Read),
            2 => Ok(BufferPermission::Write),
            3 => Ok(BufferPermission::ReadWrite),
            _ => Err(KernelError::InvalidBufferDescriptor),
        }
    }

    /// What the sender's memory must allow for the buffer to be handed over.
    pub fn memory_permission(self) -> MemoryPermission {
        match self {
            BufferPermission::Read => MemoryPermission::READ,
            BufferPermission::Write => MemoryPermission::WRITE,
            BufferPermission::ReadWrite => MemoryPermission::READ_WRITE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IPCTranslateParameter {
    Handle {
        moved: bool,
        handles: Vec<Option<Handle>>,
    },
    /// Filled in by the kernel with the sender's process id.
    ProcessId(u32),
    StaticBuffer {
        index: u8,
        size: u32,
        address: u32,
    },
    MappedBuffer {
        permission: BufferPermission,
        size: u32,
        address: u32,
    }
}

impl IPCTranslateParameter {
    /// Number of words this parameter occupies, descriptor included.
    pub fn word_count(&self) -> u32 {
        match self {
            IPCTranslateParameter::Handle { handles, .. } => 1 + handles.len() as u32,
            _ => 2,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IPCHeaderCode {
    pub command_id: u16,
    pub normal_parameter_count: u8,
    pub translate_parameter_size: u8,
}

impl IPCHeaderCode {
    pub fn raw(&self) -> u32 {
        make_header(self.command_id, self.normal_parameter_count as u32, self.translate_parameter_size as u32)
    }
}

impl From<u32> for IPCHeaderCode {
    fn from(value: u32) -> IPCHeaderCode {
        IPCHeaderCode {
            command_id: ((value & 0xFFFF0000) >> 16) as u16,
            normal_parameter_count: ((value & 0xFC0) >> 6) as u8,
            translate_parameter_size: (value & 0x3F) as u8,
        }
    }
}

/// A fully decoded command buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IPCMessage {
    pub header: IPCHeaderCode,
    pub normal: Vec<u32>,
    pub translate: Vec<IPCTranslateParameter>,
}

impl IPCMessage {
    pub fn parse(data: &[u8]) -> KResult<IPCMessage> {
        let mut reader = IPCReader::new_request(data)?;
        let header = reader.header();
        let normal = (0..header.normal_parameter_count)
            .map(|_| reader.read_normal())
            .collect::<KResult<Vec<_>>>()?;
        let mut translate = vec![];
        while reader.has_more_translate_params() {
            translate.push(reader.read_translate()?);
        }
        Ok(IPCMessage { header, normal, translate })
    }
}

pub struct IPCReader<'a> {
    header: IPCHeaderCode,
    result: u32,
    data: Cursor<&'a [u8]>,
    normal_parameter_count: u8,
    translate_parameter_words: u8,
}

impl<'a> IPCReader<'a> {
    fn new(data: &'a [u8], with_result: bool) -> KResult<IPCReader<'a>> {
        let mut data = Cursor::new(data);
        let header = IPCHeaderCode::from(read_word(&mut data)?);
        if 1 + header.normal_parameter_count as usize + header.translate_parameter_size as usize > IPC_REQUEST_WORDS {
            return Err(KernelError::InvalidBufferDescriptor)
        }

        let mut reader = IPCReader {
            header,
            result: 0,
            data,
            normal_parameter_count: header.normal_parameter_count,
            translate_parameter_words: header.translate_parameter_size,
        };
        if with_result {
            reader.result = reader.read_normal()?;
        }
        Ok(reader)
    }

    // Reads an IPC request
    pub fn new_request(data: &'a [u8]) -> KResult<IPCReader<'a>> {
        IPCReader::new(data, false)
    }

    // Reads an IPC response; the result code is the first normal word
    pub fn new_response(data: &'a [u8]) -> KResult<IPCReader<'a>> {
        IPCReader::new(data, true)
    }

    pub fn header(&self) -> IPCHeaderCode {
        self.header
    }

    pub fn result(&self) -> u32 {
        self.result
    }

    pub fn read_normal(&mut self) -> KResult<u32> {
        if self.normal_parameter_count == 0 {
            return Err(KernelError::InvalidBufferDescriptor)
        }
        self.normal_parameter_count -= 1;
        read_word(&mut self.data)
    }

    fn read_translate_word(&mut self) -> KResult<u32> {
        if self.translate_parameter_words == 0 {
            return Err(KernelError::InvalidBufferDescriptor)
        }
        self.translate_parameter_words -= 1;
        read_word(&mut self.data)
    }

    pub fn has_more_translate_params(&self) -> bool {
        self.translate_parameter_words > 0
    }

    pub fn read_translate(&mut self) -> KResult<IPCTranslateParameter> {
        // Skip whatever normal words the caller did not consume
        while self.normal_parameter_count > 0 {
            self.read_normal()?;
        }

        let descriptor = self.read_translate_word()?;
        if descriptor & 0xF == 0 {
            let count = (descriptor >> 26) + 1;
            match descriptor & 0x30 {
                0x00 | 0x10 => {
                    let moved = descriptor & 0x10 != 0;
                    let handles = (0..count)
                        .map(|_| self.read_translate_word().map(Handle::from_raw))
                        .collect::<KResult<Vec<_>>>()?;
                    Ok(IPCTranslateParameter::Handle { moved, handles })
                },
                0x20 => {
                    let pid = self.read_translate_word()?;
                    Ok(IPCTranslateParameter::ProcessId(pid))
                },
                _ => Err(KernelError::InvalidBufferDescriptor),
            }
        } else if descriptor & 0xF == 2 {
            let index = ((descriptor & 0x3C00) >> 10) as u8;
            let size = (descriptor & 0xFFFFC000) >> 14;
            let address = self.read_translate_word()?;
            Ok(IPCTranslateParameter::StaticBuffer { index, size, address })
        } else if descriptor & 0xE == 4 {
            // PXI buffers only exist between system modules
            Err(KernelError::InvalidBufferDescriptor)
        } else if descriptor & 0x8 != 0 {
            let permission = BufferPermission::from_raw((descriptor & 0b0110) >> 1)?;
            let size = (descriptor & 0xFFFFFFF0) >> 4;
            let address = self.read_translate_word()?;
            Ok(IPCTranslateParameter::MappedBuffer { permission, size, address })
        } else {
            Err(KernelError::InvalidBufferDescriptor)
        }
    }
}

fn read_word(data: &mut Cursor<&[u8]>) -> KResult<u32> {
    data.read_u32::<LittleEndian>().map_err(|_| KernelError::InvalidBufferDescriptor)
}

/// Writes a command buffer. The header is written last, when the writer is dropped.
pub struct IPCWriter<'a> {
    command_id: u16,
    normal_parameter_count: u8,
    translate_parameter_size: u8,
    data: Cursor<&'a mut [u8]>,
}

impl<'a> IPCWriter<'a> {
    pub fn new_request(command_id: u16, data: &'a mut [u8]) -> IPCWriter<'a> {
        let mut data = Cursor::new(data);
        data.set_position(4);
        IPCWriter {
            command_id,
            normal_parameter_count: 0,
            translate_parameter_size: 0,
            data,
        }
    }

    pub fn new_response(command_id: u16, result: u32, data: &'a mut [u8]) -> KResult<IPCWriter<'a>> {
        let mut response = IPCWriter::new_request(command_id, data);
        response.write_normal(result)?;
        Ok(response)
    }

    fn write(&mut self, word: u32) -> KResult<()> {
        if self.data.position() >= IPC_REQUEST_SIZE as u64 {
            return Err(KernelError::InvalidBufferDescriptor)
        }
        self.data.write_u32::<LittleEndian>(word).map_err(|_| KernelError::InvalidBufferDescriptor)
    }

    pub fn write_normal(&mut self, param: u32) -> KResult<()> {
        assert!(self.translate_parameter_size == 0, "Normal parameters must precede translate parameters");
        self.write(param)?;
        self.normal_parameter_count += 1;
        Ok(())
    }

    fn write_translate_word(&mut self, word: u32) -> KResult<()> {
        self.write(word)?;
        self.translate_parameter_size += 1;
        Ok(())
    }

    pub fn write_translate(&mut self, param: &IPCTranslateParameter) -> KResult<()> {
        match param {
            IPCTranslateParameter::Handle { moved, handles } => {
                if handles.is_empty() || handles.len() > 64 {
                    return Err(KernelError::InvalidBufferDescriptor)
                }
                let count = handles.len() as u32;
                self.write_translate_word(if *moved { descriptor::move_handles(count) } else { descriptor::copy_handles(count) })?;
                for handle in handles {
                    self.write_translate_word(handle.map(|h| h.raw()).unwrap_or(0))?;
                }
            },
            IPCTranslateParameter::ProcessId(pid) => {
                self.write_translate_word(descriptor::calling_pid())?;
                self.write_translate_word(*pid)?;
            },
            IPCTranslateParameter::StaticBuffer { index, size, address } => {
                self.write_translate_word(descriptor::static_buffer(*size, *index as u32))?;
                self.write_translate_word(*address)?;
            },
            IPCTranslateParameter::MappedBuffer { permission, size, address } => {
                self.write_translate_word(descriptor::mapped_buffer(*size, *permission as u32))?;
                self.write_translate_word(*address)?;
            },
        }
        Ok(())
    }
}

impl<'a> Drop for IPCWriter<'a> {
    fn drop(&mut self) {
        let header = make_header(self.command_id, self.normal_parameter_count as u32, self.translate_parameter_size as u32);
        self.data.set_position(0);
        let _ = self.data.write_u32::<LittleEndian>(header);
    }
}
