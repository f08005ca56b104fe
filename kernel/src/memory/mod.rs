use bitflags::bitflags;
use byteorder::{LE, ByteOrder};

use crate::errors::KResult;

mod block;
mod virt;

pub mod kmm;

pub use {
    block::MemoryBlock,
    virt::{AddressSpace, MemoryInfo, Vma},
    kmm::{KMM, MemoryRegion, PhysicalAllocation},
};

pub const PAGE_SIZE: u32 = 0x1000;
pub const PAGE_MASK: u32 = PAGE_SIZE - 1;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MemoryPermission: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXECUTE = 4;
        const DONT_CARE = 0x10000000;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryState {
    Free = 0,
    Reserved = 1,
    IO = 2,
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

pub fn is_page_aligned(value: u32) -> bool {
    value & PAGE_MASK == 0
}

/// Byte-addressed guest memory. Accesses outside mapped memory fail with `InvalidAddress`.
pub trait Memory {
    fn read(&self, addr: u32, bytes: &mut [u8]) -> KResult<()>;
    fn write(&self, addr: u32, bytes: &[u8]) -> KResult<()>;

    fn read_u8(&self, addr: u32) -> KResult<u8> {
        let mut data = 0;
        self.read(addr, std::slice::from_mut(&mut data))?;
        Ok(data)
    }

    fn read_u16(&self, addr: u32) -> KResult<u16> {
        let mut data = [0u8; 2];
        self.read(addr, &mut data)?;
        Ok(LE::read_u16(&data))
    }

    fn read_u32(&self, addr: u32) -> KResult<u32> {
        let mut data = [0u8; 4];
        self.read(addr, &mut data)?;
        Ok(LE::read_u32(&data))
    }

    fn read_u64(&self, addr: u32) -> KResult<u64> {
        let mut data = [0u8; 8];
        self.read(addr, &mut data)?;
        Ok(LE::read_u64(&data))
    }

    fn write_u8(&self, addr: u32, value: u8) -> KResult<()> {
        self.write(addr, &[value])
    }

    fn write_u16(&self, addr: u32, value: u16) -> KResult<()> {
        let mut data = [0u8; 2];
        LE::write_u16(&mut data, value);
        self.write(addr, &data)
    }

    fn write_u32(&self, addr: u32, value: u32) -> KResult<()> {
        let mut data = [0u8; 4];
        LE::write_u32(&mut data, value);
        self.write(addr, &data)
    }

    fn write_u64(&self, addr: u32, value: u64) -> KResult<()> {
        let mut data = [0u8; 8];
        LE::write_u64(&mut data, value);
        self.write(addr, &data)
    }
}
